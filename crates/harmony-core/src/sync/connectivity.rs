//! Connectivity oracle - reachability classification

use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::{Arc, RwLock};

/// Current reachability class, queried before every dispatch decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    /// A path to the authoritative server is available
    ServerReachable,
    /// A local network transport is active but no server path is confirmed
    LanOnly,
    /// No active transport
    Offline,
}

/// Cheap, synchronous, side-effect-free reachability query.
///
/// Never errors; the absence of any transport is simply `Offline`.
/// Injected into the coordinator and the dispatch client so tests can
/// substitute fakes.
pub trait ConnectivityOracle: Send + Sync {
    fn classify(&self) -> Reachability;
}

/// Oracle backed by kernel routing state.
///
/// A UDP `connect` assigns a route without sending any datagram: a route
/// to the server host classifies as `ServerReachable`, otherwise a local
/// IPv4 address classifies as `LanOnly`. Route presence is not liveness;
/// a dead server behind a live route still fails at request time, which
/// the coordinator converts into a queue-and-retry action.
pub struct RouteConnectivity {
    server_addr: SocketAddr,
}

impl RouteConnectivity {
    /// Create an oracle probing routes toward the given server address
    #[must_use]
    pub const fn new(server_addr: SocketAddr) -> Self {
        Self { server_addr }
    }
}

impl ConnectivityOracle for RouteConnectivity {
    fn classify(&self) -> Reachability {
        if probe_route(self.server_addr).is_some() {
            return Reachability::ServerReachable;
        }
        if local_ipv4().is_some() {
            return Reachability::LanOnly;
        }
        Reachability::Offline
    }
}

/// Oracle holding a reachability value set by platform glue.
///
/// Hosts with real connectivity events (mobile shells, tests) update the
/// shared value and trigger a queue drain on regain.
#[derive(Clone, Default)]
pub struct SharedConnectivity {
    state: Arc<RwLock<Option<Reachability>>>,
}

impl SharedConnectivity {
    /// Create a handle reporting the given initial reachability
    #[must_use]
    pub fn new(initial: Reachability) -> Self {
        Self {
            state: Arc::new(RwLock::new(Some(initial))),
        }
    }

    /// Record a reachability change observed by the platform
    pub fn set(&self, reachability: Reachability) {
        if let Ok(mut state) = self.state.write() {
            *state = Some(reachability);
        }
    }
}

impl ConnectivityOracle for SharedConnectivity {
    fn classify(&self) -> Reachability {
        self.state
            .read()
            .ok()
            .and_then(|state| *state)
            .unwrap_or(Reachability::Offline)
    }
}

/// Route probe via UDP connect; no datagrams are sent
fn probe_route(addr: SocketAddr) -> Option<SocketAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect(addr).ok()?;
    socket.local_addr().ok()
}

/// The device's own IPv4 address on its primary interface, if any
pub(crate) fn local_ipv4() -> Option<Ipv4Addr> {
    // Connecting to any external address selects the outbound interface
    let probe: SocketAddr = ([8, 8, 8, 8], 53).into();
    match probe_route(probe)? {
        SocketAddr::V4(addr) if !addr.ip().is_loopback() => Some(*addr.ip()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_connectivity_reports_updates() {
        let oracle = SharedConnectivity::new(Reachability::Offline);
        assert_eq!(oracle.classify(), Reachability::Offline);

        oracle.set(Reachability::LanOnly);
        assert_eq!(oracle.classify(), Reachability::LanOnly);

        oracle.set(Reachability::ServerReachable);
        assert_eq!(oracle.classify(), Reachability::ServerReachable);
    }

    #[test]
    fn shared_connectivity_defaults_offline() {
        let oracle = SharedConnectivity::default();
        assert_eq!(oracle.classify(), Reachability::Offline);
    }

    #[test]
    fn shared_connectivity_clones_share_state() {
        let oracle = SharedConnectivity::new(Reachability::Offline);
        let clone = oracle.clone();
        oracle.set(Reachability::ServerReachable);
        assert_eq!(clone.classify(), Reachability::ServerReachable);
    }

    #[test]
    fn route_connectivity_never_panics() {
        let oracle = RouteConnectivity::new(([192, 0, 2, 1], 443).into());
        // Classification depends on the host environment; it must simply
        // return one of the three classes without erroring.
        let _ = oracle.classify();
    }
}
