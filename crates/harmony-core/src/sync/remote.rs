//! Remote dispatch client - JSON over HTTP to the authoritative server

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::{Emergency, EmergencyStatus};
use crate::sync::connectivity::{ConnectivityOracle, Reachability};
use crate::util::{is_http_url, normalize_text_option};

/// Bounded connect wait on every call
const CONNECT_TIMEOUT: Duration = Duration::from_secs(7);
/// Bounded read wait on every call
const READ_TIMEOUT: Duration = Duration::from_secs(7);

/// An emergency record as the server represents it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteEmergency {
    pub id: i64,
    pub elderly_id: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: i64,
    pub status: EmergencyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volunteer_id: Option<i64>,
}

impl RemoteEmergency {
    /// Convert to a local record with a fresh placeholder id
    #[must_use]
    pub fn to_emergency(&self) -> Emergency {
        let mut emergency = Emergency::new(self.elderly_id, self.latitude, self.longitude);
        emergency.server_id = Some(self.id);
        emergency.created_at = self.timestamp;
        emergency.status = self.status;
        emergency.volunteer_id = self.volunteer_id;
        emergency
    }
}

/// The three server operations, each asynchronous and independently
/// retryable. Object safe so the coordinator can be tested against a
/// fake server.
#[async_trait]
pub trait RemoteDispatch: Send + Sync {
    /// Create an emergency record; returns the authoritative id
    async fn create_emergency(&self, emergency: &Emergency) -> Result<i64>;

    /// List active emergencies, optionally filtered by accepting volunteer
    async fn list_active(&self, volunteer_id: Option<i64>) -> Result<Vec<RemoteEmergency>>;

    /// Apply a status transition; `Conflict` signals a lost acceptance race
    async fn update_status(
        &self,
        server_id: i64,
        status: EmergencyStatus,
        volunteer_id: Option<i64>,
    ) -> Result<()>;
}

#[derive(Debug, Serialize)]
struct CreateEmergencyRequest {
    elderly_id: i64,
    latitude: f64,
    longitude: f64,
    timestamp: i64,
    status: EmergencyStatus,
}

#[derive(Debug, Deserialize)]
struct CreateEmergencyResponse {
    id: i64,
}

#[derive(Debug, Serialize)]
struct UpdateStatusRequest {
    status: EmergencyStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    volunteer_id: Option<i64>,
}

/// HTTP implementation of `RemoteDispatch`.
///
/// Every call is gated on the injected oracle: when the server is not
/// reachable the call fails with `Unreachable` without touching the
/// network.
pub struct HttpDispatchClient {
    base_url: String,
    client: reqwest::Client,
    oracle: Arc<dyn ConnectivityOracle>,
}

impl HttpDispatchClient {
    pub fn new(base_url: impl Into<String>, oracle: Arc<dyn ConnectivityOracle>) -> Result<Self> {
        let base_url = normalize_base_url(base_url.into())?;
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .build()?;
        Ok(Self {
            base_url,
            client,
            oracle,
        })
    }

    fn gate(&self) -> Result<()> {
        if self.oracle.classify() == Reachability::ServerReachable {
            Ok(())
        } else {
            Err(Error::Unreachable)
        }
    }
}

#[async_trait]
impl RemoteDispatch for HttpDispatchClient {
    async fn create_emergency(&self, emergency: &Emergency) -> Result<i64> {
        self.gate()?;

        let request = CreateEmergencyRequest {
            elderly_id: emergency.elderly_id,
            latitude: emergency.latitude,
            longitude: emergency.longitude,
            timestamp: emergency.created_at,
            status: emergency.status,
        };

        let response = self
            .client
            .post(format!("{}/emergencies", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(map_transport_error)?;

        check_status(response.status())?;
        let payload = response.json::<CreateEmergencyResponse>().await?;
        Ok(payload.id)
    }

    async fn list_active(&self, volunteer_id: Option<i64>) -> Result<Vec<RemoteEmergency>> {
        self.gate()?;

        let mut request = self
            .client
            .get(format!("{}/emergencies/active", self.base_url));
        if let Some(volunteer_id) = volunteer_id {
            request = request.query(&[("volunteer_id", volunteer_id)]);
        }

        let response = request.send().await.map_err(map_transport_error)?;
        check_status(response.status())?;

        let entries = response.json::<Vec<serde_json::Value>>().await?;
        Ok(parse_active_list(entries))
    }

    async fn update_status(
        &self,
        server_id: i64,
        status: EmergencyStatus,
        volunteer_id: Option<i64>,
    ) -> Result<()> {
        self.gate()?;

        let request = UpdateStatusRequest {
            status,
            volunteer_id,
        };

        let response = self
            .client
            .put(format!("{}/emergencies/{server_id}", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(map_transport_error)?;

        check_status(response.status())
    }
}

/// Parse each list entry independently, skipping malformed items.
///
/// Stale volunteers benefit from seeing most emergencies even when one
/// record is corrupt, so a bad entry is logged and dropped instead of
/// failing the whole list.
fn parse_active_list(entries: Vec<serde_json::Value>) -> Vec<RemoteEmergency> {
    entries
        .into_iter()
        .filter_map(|entry| match serde_json::from_value(entry) {
            Ok(record) => Some(record),
            Err(error) => {
                tracing::warn!(%error, "skipping malformed emergency entry");
                None
            }
        })
        .collect()
}

/// Convert an HTTP response status into the error taxonomy
fn check_status(status: StatusCode) -> Result<()> {
    match status {
        StatusCode::CONFLICT => Err(Error::Conflict),
        StatusCode::NOT_FOUND => Err(Error::NotFound("unknown to server".to_string())),
        status if status.is_success() => Ok(()),
        status => Err(Error::ServerError(status.as_u16())),
    }
}

/// Map a reqwest transport failure into the error taxonomy
fn map_transport_error(error: reqwest::Error) -> Error {
    if error.is_timeout() {
        Error::Timeout
    } else if error.is_connect() {
        Error::Unreachable
    } else {
        Error::Http(error)
    }
}

fn normalize_base_url(raw: String) -> Result<String> {
    let base_url = normalize_text_option(Some(raw))
        .ok_or_else(|| Error::InvalidInput("server URL must not be empty".to_string()))?;
    if is_http_url(&base_url) {
        Ok(base_url.trim_end_matches('/').to_string())
    } else {
        Err(Error::InvalidInput(
            "server URL must include http:// or https://".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::connectivity::SharedConnectivity;

    fn offline_oracle() -> Arc<dyn ConnectivityOracle> {
        Arc::new(SharedConnectivity::new(Reachability::Offline))
    }

    #[test]
    fn normalize_base_url_rejects_invalid_values() {
        assert!(normalize_base_url(String::new()).is_err());
        assert!(normalize_base_url("api.example.com".to_string()).is_err());
        assert_eq!(
            normalize_base_url("https://api.example.com/".to_string()).unwrap(),
            "https://api.example.com"
        );
    }

    #[test]
    fn status_mapping() {
        assert!(check_status(StatusCode::OK).is_ok());
        assert!(check_status(StatusCode::CREATED).is_ok());
        assert!(matches!(
            check_status(StatusCode::CONFLICT),
            Err(Error::Conflict)
        ));
        assert!(matches!(
            check_status(StatusCode::NOT_FOUND),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            check_status(StatusCode::INTERNAL_SERVER_ERROR),
            Err(Error::ServerError(500))
        ));
    }

    #[test]
    fn malformed_list_entries_are_skipped() {
        let entries = vec![
            serde_json::json!({
                "id": 1,
                "elderly_id": 5,
                "latitude": 23.8,
                "longitude": 90.4,
                "timestamp": 1000,
                "status": "active"
            }),
            serde_json::json!({ "id": "not-a-number" }),
            serde_json::json!({
                "id": 2,
                "elderly_id": 6,
                "latitude": 23.9,
                "longitude": 90.5,
                "timestamp": 2000,
                "status": "accepted",
                "volunteer_id": 9
            }),
        ];

        let records = parse_active_list(entries);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, 1);
        assert_eq!(records[1].volunteer_id, Some(9));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn calls_gated_on_oracle() {
        let client = HttpDispatchClient::new("http://127.0.0.1:9", offline_oracle()).unwrap();

        let emergency = Emergency::new(5, 23.8, 90.4);
        assert!(matches!(
            client.create_emergency(&emergency).await,
            Err(Error::Unreachable)
        ));
        assert!(matches!(
            client.list_active(None).await,
            Err(Error::Unreachable)
        ));
        assert!(matches!(
            client
                .update_status(1, EmergencyStatus::Cancelled, None)
                .await,
            Err(Error::Unreachable)
        ));
    }

    #[test]
    fn remote_record_converts_to_local() {
        let record = RemoteEmergency {
            id: 42,
            elderly_id: 5,
            latitude: 23.8,
            longitude: 90.4,
            timestamp: 1000,
            status: EmergencyStatus::Accepted,
            volunteer_id: Some(9),
        };

        let emergency = record.to_emergency();
        assert_eq!(emergency.server_id, Some(42));
        assert_eq!(emergency.created_at, 1000);
        assert_eq!(emergency.volunteer_id, Some(9));
        assert!(emergency.invariant_holds());
    }
}
