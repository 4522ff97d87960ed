//! Pending operation model - the durable retry queue

use serde::{Deserialize, Serialize};

use crate::models::{Emergency, EmergencyId, EmergencyStatus};

/// Tag identifying a replayable action.
///
/// Stored as text so that a queue written by a newer binary can still be
/// read back; tags this binary cannot interpret round-trip as `Unknown`
/// and are dropped during a drain instead of wedging the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationKind {
    /// Replay the creation of an emergency against the server
    CreateEmergency,
    /// Replay a status update (completion/cancellation) against the server
    UpdateStatus,
    /// A tag this binary does not understand
    Unknown(String),
}

impl OperationKind {
    /// Stable text form used in the database
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::CreateEmergency => "create-emergency",
            Self::UpdateStatus => "update-status",
            Self::Unknown(tag) => tag,
        }
    }

    /// Parse a stored tag; never fails, unrecognized tags become `Unknown`
    #[must_use]
    pub fn parse(tag: &str) -> Self {
        match tag {
            "create-emergency" => Self::CreateEmergency,
            "update-status" => Self::UpdateStatus,
            other => Self::Unknown(other.to_string()),
        }
    }
}

/// A durable, replayable unit of work queued when a write could not be
/// delivered immediately.
///
/// The payload is a serialized snapshot of the data needed to replay the
/// operation, not a reference to the live record; replay may happen long
/// after creation. Operations are never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOperation {
    /// Queue row id; insertion order defines FIFO processing order
    pub id: i64,
    /// Action tag
    pub kind: OperationKind,
    /// Serialized JSON snapshot
    pub payload: String,
    /// Enqueue instant (Unix ms)
    pub created_at: i64,
}

/// Snapshot payload for a queued `create-emergency` operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateEmergencyPayload {
    pub local_id: EmergencyId,
    pub elderly_id: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: i64,
    pub status: EmergencyStatus,
}

impl CreateEmergencyPayload {
    /// Rebuild an emergency value suitable for replay against the server
    #[must_use]
    pub fn to_emergency(&self) -> Emergency {
        Emergency {
            id: self.local_id,
            server_id: None,
            elderly_id: self.elderly_id,
            volunteer_id: None,
            latitude: self.latitude,
            longitude: self.longitude,
            created_at: self.timestamp,
            status: self.status,
        }
    }
}

impl From<&Emergency> for CreateEmergencyPayload {
    fn from(emergency: &Emergency) -> Self {
        Self {
            local_id: emergency.id,
            elderly_id: emergency.elderly_id,
            latitude: emergency.latitude,
            longitude: emergency.longitude,
            timestamp: emergency.created_at,
            status: emergency.status,
        }
    }
}

/// Snapshot payload for a queued `update-status` operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateStatusPayload {
    pub local_id: EmergencyId,
    pub server_id: i64,
    pub status: EmergencyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volunteer_id: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_text_roundtrip() {
        assert_eq!(
            OperationKind::parse("create-emergency"),
            OperationKind::CreateEmergency
        );
        assert_eq!(
            OperationKind::parse("update-status"),
            OperationKind::UpdateStatus
        );
        assert_eq!(OperationKind::CreateEmergency.as_str(), "create-emergency");
    }

    #[test]
    fn unrecognized_kind_preserved() {
        let kind = OperationKind::parse("relay-telemetry");
        assert_eq!(kind, OperationKind::Unknown("relay-telemetry".to_string()));
        assert_eq!(kind.as_str(), "relay-telemetry");
    }

    #[test]
    fn create_payload_snapshots_emergency() {
        let mut emergency = Emergency::new(5, 23.8, 90.4);
        let payload = CreateEmergencyPayload::from(&emergency);

        // Mutating the live record does not affect the snapshot
        emergency.status = EmergencyStatus::Cancelled;
        assert_eq!(payload.status, EmergencyStatus::Active);
        assert_eq!(payload.elderly_id, 5);

        let rebuilt = payload.to_emergency();
        assert_eq!(rebuilt.id, emergency.id);
        assert_eq!(rebuilt.status, EmergencyStatus::Active);
        assert!(rebuilt.server_id.is_none());
    }

    #[test]
    fn create_payload_json_roundtrip() {
        let emergency = Emergency::new(7, 23.8103, 90.4125);
        let payload = CreateEmergencyPayload::from(&emergency);
        let json = serde_json::to_string(&payload).unwrap();
        let back: CreateEmergencyPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(payload, back);
    }

    #[test]
    fn update_payload_omits_absent_volunteer() {
        let payload = UpdateStatusPayload {
            local_id: EmergencyId::new(),
            server_id: 42,
            status: EmergencyStatus::Cancelled,
            volunteer_id: None,
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(!json.contains("volunteer_id"));
    }
}
