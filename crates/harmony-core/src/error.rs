//! Error types for harmony-core

use thiserror::Error;

/// Result type alias using harmony-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in harmony-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// libSQL error (local persistence failed)
    #[error("Storage error: {0}")]
    LibSql(#[from] libsql::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No viable transport to the server
    #[error("Server is not reachable")]
    Unreachable,

    /// Transport present but the server did not answer within the bound
    #[error("Request to server timed out")]
    Timeout,

    /// Remote rejected the request with a non-2xx code
    #[error("Server rejected request: HTTP {0}")]
    ServerError(u16),

    /// Lost the acceptance race; the emergency is already taken
    #[error("Emergency already accepted by another volunteer")]
    Conflict,

    /// Referenced record is unknown
    #[error("Emergency not found: {0}")]
    NotFound(String),

    /// Payload could not be parsed on receipt
    #[error("Malformed payload: {0}")]
    Malformed(String),

    /// HTTP transport error not covered by a more specific class
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Illegal emergency status transition
    #[error("Invalid status transition: {0}")]
    InvalidTransition(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl Error {
    /// Whether this error belongs to the queue-and-retry class.
    ///
    /// Transient failures are converted into durable pending operations by
    /// the sync coordinator; everything else is surfaced to the caller.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Unreachable | Self::Timeout | Self::ServerError(_) | Self::Http(_)
        )
    }
}
