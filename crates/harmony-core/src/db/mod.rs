//! Database layer for HarmonyCare

mod connection;
mod contact_repository;
mod migrations;
mod repository;

pub use connection::Database;
pub use contact_repository::{ContactRepository, LibSqlContactRepository};
pub use repository::{
    EmergencyRepository, LibSqlEmergencyRepository, LibSqlPendingOperationRepository,
    PendingOperationRepository,
};
