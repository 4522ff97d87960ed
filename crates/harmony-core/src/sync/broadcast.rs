//! Local broadcast channel - best-effort UDP peer propagation
//!
//! When no server is reachable but devices share a LAN segment, an
//! emergency is announced as a single fire-and-forget datagram: the magic
//! prefix followed by a minimal JSON snapshot. No acknowledgment, no
//! retransmission, no authentication.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::models::{Emergency, EmergencyStatus};
use crate::sync::connectivity::local_ipv4;

/// UDP port shared by all peers on the segment
pub const BROADCAST_PORT: u16 = 8888;

/// ASCII prefix identifying HarmonyCare datagrams
pub const MAGIC_PREFIX: &str = "HARMONYCARE_EMERGENCY:";

/// Largest datagram the listener will consider
const MAX_DATAGRAM: usize = 2048;

/// Minimal emergency snapshot carried in one datagram
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastFrame {
    pub elderly_id: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: i64,
    pub status: EmergencyStatus,
    /// Server-assigned id, when the origin already has one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emergency_id: Option<i64>,
}

impl BroadcastFrame {
    /// Snapshot an emergency for announcement
    #[must_use]
    pub fn from_emergency(emergency: &Emergency) -> Self {
        Self {
            elderly_id: emergency.elderly_id,
            latitude: emergency.latitude,
            longitude: emergency.longitude,
            timestamp: emergency.created_at,
            status: emergency.status,
            emergency_id: emergency.server_id,
        }
    }

    /// Encode as magic prefix + JSON
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut datagram = MAGIC_PREFIX.as_bytes().to_vec();
        datagram.extend_from_slice(&serde_json::to_vec(self)?);
        Ok(datagram)
    }

    /// Decode a received datagram, filtering by magic prefix
    pub fn decode(datagram: &[u8]) -> Result<Self> {
        let body = datagram
            .strip_prefix(MAGIC_PREFIX.as_bytes())
            .ok_or_else(|| Error::Malformed("missing magic prefix".to_string()))?;
        serde_json::from_slice(body)
            .map_err(|error| Error::Malformed(format!("invalid broadcast JSON: {error}")))
    }
}

/// Subnet broadcast address assuming a /24 mask.
///
/// Known simplification: misbehaves on non-/24 subnets, degrading to
/// "broadcast not delivered" rather than corruption.
#[must_use]
pub fn subnet_broadcast_addr(local: Ipv4Addr) -> Ipv4Addr {
    let octets = local.octets();
    Ipv4Addr::new(octets[0], octets[1], octets[2], 255)
}

/// One-shot peer announcement. Object safe so tests can record frames
/// instead of touching the network.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Send one datagram to the local segment; skip silently when no LAN
    /// transport is up
    async fn announce(&self, frame: &BroadcastFrame) -> Result<()>;
}

/// UDP implementation of `Broadcaster`
#[derive(Default)]
pub struct UdpBroadcaster {
    port: u16,
}

impl UdpBroadcaster {
    /// Create a broadcaster targeting the standard peer port
    #[must_use]
    pub const fn new() -> Self {
        Self {
            port: BROADCAST_PORT,
        }
    }

    /// Create a broadcaster targeting a custom port (tests)
    #[must_use]
    pub const fn with_port(port: u16) -> Self {
        Self { port }
    }
}

#[async_trait]
impl Broadcaster for UdpBroadcaster {
    async fn announce(&self, frame: &BroadcastFrame) -> Result<()> {
        let Some(local) = local_ipv4() else {
            debug!("no local IPv4 address, skipping broadcast");
            return Ok(());
        };

        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.set_broadcast(true)?;

        let target = SocketAddrV4::new(subnet_broadcast_addr(local), self.port);
        socket
            .send_to(&frame.encode()?, SocketAddr::V4(target))
            .await?;

        debug!(%target, elderly_id = frame.elderly_id, "broadcast emergency to local segment");
        Ok(())
    }
}

/// Long-lived background listener for peer datagrams.
///
/// Parsed frames are delivered over the channel handed to `bind`; frames
/// that fail the magic/JSON filter are dropped. `stop` is idempotent and
/// unblocks the receive loop deterministically.
pub struct BroadcastListener {
    local_addr: SocketAddr,
    shutdown: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BroadcastListener {
    /// Bind the listening socket and start the receive loop
    pub async fn bind(port: u16, frames: mpsc::Sender<BroadcastFrame>) -> Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
        let local_addr = socket.local_addr()?;
        let shutdown = Arc::new(Notify::new());

        let task = tokio::spawn(listen_loop(socket, frames, Arc::clone(&shutdown)));
        debug!(%local_addr, "broadcast listener started");

        Ok(Self {
            local_addr,
            shutdown,
            task: Mutex::new(Some(task)),
        })
    }

    /// The bound local address (useful when binding port 0)
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether the receive loop is still running
    pub fn is_listening(&self) -> bool {
        self.task
            .lock()
            .map(|task| task.as_ref().is_some_and(|handle| !handle.is_finished()))
            .unwrap_or(false)
    }

    /// Stop listening. Idempotent: calling while already stopped is a no-op.
    pub async fn stop(&self) {
        let handle = self.task.lock().ok().and_then(|mut task| task.take());
        let Some(handle) = handle else {
            return;
        };

        self.shutdown.notify_one();
        if let Err(error) = handle.await {
            // Shutdown races are expected; anything else is a real bug
            if !error.is_cancelled() {
                error!(%error, "broadcast listener task failed");
            }
        }
        debug!("broadcast listener stopped");
    }
}

async fn listen_loop(
    socket: UdpSocket,
    frames: mpsc::Sender<BroadcastFrame>,
    shutdown: Arc<Notify>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            () = shutdown.notified() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, peer)) => match BroadcastFrame::decode(&buf[..len]) {
                    Ok(frame) => {
                        if frames.send(frame).await.is_err() {
                            // Receiver side is gone, nothing left to deliver to
                            break;
                        }
                    }
                    Err(err) => debug!(%peer, %err, "discarding malformed datagram"),
                },
                Err(err) => {
                    // Unexpected while still supposed to be listening;
                    // restart policy belongs to the caller
                    error!(%err, "broadcast listener socket error, terminating");
                    break;
                }
            }
        }
    }
}
