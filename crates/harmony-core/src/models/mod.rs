//! Data models for HarmonyCare

mod contact;
mod emergency;
mod pending;

pub use contact::{EmergencyContact, NotificationMethod};
pub use emergency::{Emergency, EmergencyId, EmergencyStatus};
pub use pending::{
    CreateEmergencyPayload, OperationKind, PendingOperation, UpdateStatusPayload,
};
