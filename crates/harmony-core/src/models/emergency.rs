//! Emergency model and acceptance state machine

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::Error;

/// A unique local identifier for an emergency, using UUID v7 (time-sortable)
///
/// Locally-created records carry this id as a placeholder until the record
/// is reconciled with a server-assigned id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmergencyId(Uuid);

impl EmergencyId {
    /// Create a new unique emergency ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for EmergencyId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EmergencyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EmergencyId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Lifecycle status of an emergency.
///
/// Legal transitions: `Active -> Accepted -> Completed`, plus
/// `Active -> Cancelled` and `Accepted -> Cancelled`. `Completed` and
/// `Cancelled` are terminal. `Active -> Accepted` is the one concurrent
/// hazard; the server is the sole arbiter of that transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmergencyStatus {
    Active,
    Accepted,
    Completed,
    Cancelled,
}

impl EmergencyStatus {
    /// Whether no further transition may leave this status
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Whether the state machine permits moving from `self` to `next`
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Active, Self::Accepted | Self::Cancelled)
                | (Self::Accepted, Self::Completed | Self::Cancelled)
        )
    }

    /// Stable text form used in the database and on the wire
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Accepted => "accepted",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for EmergencyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EmergencyStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "accepted" => Ok(Self::Accepted),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(Error::Malformed(format!(
                "unknown emergency status: {other}"
            ))),
        }
    }
}

/// One help request.
///
/// Created by the requesting device; mutated by whichever actor observes a
/// valid transition. `server_id` is the authoritative identifier and stays
/// `None` until the server confirms the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Emergency {
    /// Local placeholder identifier
    pub id: EmergencyId,
    /// Server-assigned identifier, present once reconciled
    pub server_id: Option<i64>,
    /// Requesting elderly user
    pub elderly_id: i64,
    /// Accepting volunteer; set if and only if status is accepted/completed
    pub volunteer_id: Option<i64>,
    /// Latitude in degrees
    pub latitude: f64,
    /// Longitude in degrees
    pub longitude: f64,
    /// Creation instant (Unix ms)
    pub created_at: i64,
    /// Lifecycle status
    pub status: EmergencyStatus,
}

impl Emergency {
    /// Create a new active emergency at the given location
    #[must_use]
    pub fn new(elderly_id: i64, latitude: f64, longitude: f64) -> Self {
        Self {
            id: EmergencyId::new(),
            server_id: None,
            elderly_id,
            volunteer_id: None,
            latitude,
            longitude,
            created_at: crate::util::now_millis(),
            status: EmergencyStatus::Active,
        }
    }

    /// Whether the record has been confirmed by the server
    #[must_use]
    pub const fn is_confirmed(&self) -> bool {
        self.server_id.is_some()
    }

    /// Check the volunteer-id invariant: set iff accepted or completed
    #[must_use]
    pub const fn invariant_holds(&self) -> bool {
        match self.status {
            EmergencyStatus::Accepted | EmergencyStatus::Completed => self.volunteer_id.is_some(),
            EmergencyStatus::Active | EmergencyStatus::Cancelled => self.volunteer_id.is_none(),
        }
    }
}
