//! Emergency contact model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::Error;

/// How a contact prefers to be notified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationMethod {
    Sms,
    Call,
    Push,
}

impl NotificationMethod {
    /// Stable text form used in the database
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sms => "sms",
            Self::Call => "call",
            Self::Push => "push",
        }
    }
}

impl fmt::Display for NotificationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sms" => Ok(Self::Sms),
            "call" => Ok(Self::Call),
            "push" => Ok(Self::Push),
            other => Err(Error::Malformed(format!(
                "unknown notification method: {other}"
            ))),
        }
    }
}

/// A notification target tied to an elderly user.
///
/// Owned by the contacts subsystem; the dispatch core only reads these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergencyContact {
    pub id: String,
    pub elderly_id: i64,
    pub name: String,
    pub phone: String,
    pub relationship: Option<String>,
    pub is_primary: bool,
    pub notification_method: NotificationMethod,
    pub enabled: bool,
}

impl EmergencyContact {
    /// Create a new enabled contact with the default notification method
    #[must_use]
    pub fn new(elderly_id: i64, name: impl Into<String>, phone: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            elderly_id,
            name: name.into(),
            phone: phone.into(),
            relationship: None,
            is_primary: false,
            notification_method: NotificationMethod::Sms,
            enabled: true,
        }
    }
}
