//! harmony-core - Core library for HarmonyCare
//!
//! This crate contains the shared models, durable store, and the
//! offline-first dispatch/sync engine used by all HarmonyCare
//! interfaces (mobile, CLI).

pub mod db;
pub mod error;
pub mod models;
pub mod sync;
pub mod util;

pub use error::{Error, Result};
pub use models::{Emergency, EmergencyId, EmergencyStatus};
