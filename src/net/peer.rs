//! Per-peer state: identity, announcement data, and the connection set
//!
//! A peer may be reachable through several (remote IP, local adapter) pairs.
//! Exactly one connection is the "latest" and receives regular sends; others
//! demote to redundant and are kept warm as fallbacks with slower pings.

use crate::types::{NodeId, PeerId};
use secp256k1::PublicKey;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

// =============================================================================
// TIMERS
// =============================================================================

/// No incoming packet for this long marks a connection inactive.
pub const CONNECTION_INVALIDATE: Duration = Duration::from_secs(22);

/// An inactive connection is removed after this long, provided the peer
/// keeps at least one active or two other inactive connections.
pub const CONNECTION_REMOVE: Duration = Duration::from_secs(120);

/// Ping cadence on the latest connection.
pub const PING_INTERVAL: Duration = Duration::from_secs(10);

/// Redundant connections run all timers at a quarter of the pace.
pub const REDUNDANT_MULTIPLIER: u32 = 4;

/// Liveness of one (remote IP, local adapter) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Active,
    Inactive,
    Removed,
    Redundant,
}

/// One path to the peer.
#[derive(Debug, Clone)]
pub struct Connection {
    /// Local adapter IP whose socket carries this connection.
    pub adapter: IpAddr,
    /// Observed remote endpoint.
    pub remote: SocketAddr,
    /// Remote-reported listening port. 0 = not yet known.
    pub internal_port: u16,
    /// Remote-reported forwarded external port. 0 = none.
    pub external_port: u16,
    pub status: ConnectionStatus,
    pub rtt: Option<Duration>,
    pub last_in: Instant,
    pub last_out: Instant,
    pub last_ping: Instant,
    /// Set while inactive; reaching it allows removal.
    pub expires: Option<Instant>,
    /// Relay peer for first-packet delivery through the remote's NAT.
    pub traversal_relay: Option<PeerId>,
    /// Created from a traverse hint; no direct packet seen yet.
    pub virtual_hint: bool,
}

impl Connection {
    fn new(adapter: IpAddr, remote: SocketAddr) -> Self {
        let now = Instant::now();
        Self {
            adapter,
            remote,
            internal_port: 0,
            external_port: 0,
            status: ConnectionStatus::Active,
            rtt: None,
            last_in: now,
            last_out: now,
            last_ping: now,
            expires: None,
            traversal_relay: None,
            virtual_hint: false,
        }
    }

    /// Behind NAT iff the reported listening port differs from what we see.
    pub fn is_behind_nat(&self) -> bool {
        self.internal_port != 0 && self.internal_port != self.remote.port()
    }

    pub fn has_port_forward(&self) -> bool {
        self.external_port != 0
    }

    fn invalidate_after(&self) -> Duration {
        match self.status {
            ConnectionStatus::Redundant => CONNECTION_INVALIDATE * REDUNDANT_MULTIPLIER,
            _ => CONNECTION_INVALIDATE,
        }
    }

    fn ping_interval(&self) -> Duration {
        match self.status {
            ConnectionStatus::Redundant => PING_INTERVAL * REDUNDANT_MULTIPLIER,
            _ => PING_INTERVAL,
        }
    }
}

/// Mutable peer state behind the per-peer lock.
#[derive(Debug, Default)]
pub struct PeerState {
    pub user_agent: String,
    pub features: u8,
    pub blockchain_height: u32,
    pub blockchain_version: u64,
    connections: Vec<Connection>,
    latest: Option<usize>,
}

/// A known peer: identity plus announcement data plus connections.
pub struct PeerInfo {
    pub public_key: PublicKey,
    pub peer_id: PeerId,
    pub node_id: NodeId,
    /// Bootstrap seed peers get contact priority.
    pub is_root: AtomicBool,
    /// Best RTT in microseconds, 0 = unmeasured. Lock-free mirror for the
    /// DHT eviction policy.
    rtt_cached_micros: AtomicU64,
    state: Mutex<PeerState>,
}

/// Endpoints that should be pinged now, produced by `maintain`.
pub struct PingDue {
    pub adapter: IpAddr,
    pub remote: SocketAddr,
}

impl PeerInfo {
    pub fn new(public_key: PublicKey) -> Self {
        Self {
            public_key,
            peer_id: public_key.serialize(),
            node_id: crate::crypto::node_id(&public_key),
            is_root: AtomicBool::new(false),
            rtt_cached_micros: AtomicU64::new(0),
            state: Mutex::new(PeerState::default()),
        }
    }

    /// Lock-free best-RTT snapshot.
    pub fn cached_rtt(&self) -> Option<Duration> {
        match self.rtt_cached_micros.load(Ordering::Relaxed) {
            0 => None,
            micros => Some(Duration::from_micros(micros)),
        }
    }

    pub fn set_root(&self) {
        self.is_root.store(true, Ordering::Relaxed);
    }

    pub fn is_root(&self) -> bool {
        self.is_root.load(Ordering::Relaxed)
    }

    /// Record an inbound packet on (adapter, remote). Creates the connection
    /// if the (remote IP, adapter) pair is new, reactivates it otherwise, and
    /// promotes it to latest. Returns true when a new connection appeared.
    pub async fn touch_incoming(&self, adapter: IpAddr, remote: SocketAddr) -> bool {
        let mut state = self.state.lock().await;
        let idx = state
            .connections
            .iter()
            .position(|c| c.remote.ip() == remote.ip() && c.adapter == adapter);

        let (idx, created) = match idx {
            Some(i) => {
                let conn = &mut state.connections[i];
                conn.remote = remote;
                conn.last_in = Instant::now();
                conn.expires = None;
                conn.virtual_hint = false;
                conn.status = ConnectionStatus::Active;
                (i, false)
            }
            None => {
                state.connections.push(Connection::new(adapter, remote));
                (state.connections.len() - 1, true)
            }
        };

        // The connection that last carried traffic becomes the single send
        // path; every other active connection turns redundant.
        for (i, conn) in state.connections.iter_mut().enumerate() {
            if i != idx && conn.status == ConnectionStatus::Active {
                conn.status = ConnectionStatus::Redundant;
            }
        }
        state.latest = Some(idx);
        created
    }

    /// Register a connection hint from a traverse relay: the remote's
    /// endpoint as the relay observed it. No packet has arrived on it yet.
    pub async fn add_virtual_connection(
        &self,
        adapter: IpAddr,
        remote: SocketAddr,
        relay: Option<PeerId>,
    ) {
        let mut state = self.state.lock().await;
        let exists = state
            .connections
            .iter()
            .any(|c| c.remote.ip() == remote.ip() && c.adapter == adapter);
        if exists {
            return;
        }
        let mut conn = Connection::new(adapter, remote);
        conn.virtual_hint = true;
        conn.traversal_relay = relay;
        conn.status = ConnectionStatus::Inactive;
        conn.expires = Some(Instant::now() + CONNECTION_REMOVE);
        state.connections.push(conn);
    }

    /// Apply announcement/response header fields. An empty user agent after
    /// the initial contact leaves the stored one untouched.
    pub async fn apply_header(&self, header: &super::message::MessageHeader) {
        let mut state = self.state.lock().await;
        if !header.user_agent.is_empty() {
            state.user_agent = header.user_agent.clone();
        }
        state.features = header.features;
        state.blockchain_height = header.blockchain_height;
        state.blockchain_version = header.blockchain_version;
    }

    /// Store the remote's self-reported ports on the connection the packet
    /// arrived on.
    pub async fn set_reported_ports(
        &self,
        remote: SocketAddr,
        internal_port: u16,
        external_port: u16,
    ) {
        let mut state = self.state.lock().await;
        if let Some(conn) = state
            .connections
            .iter_mut()
            .find(|c| c.remote.ip() == remote.ip())
        {
            if internal_port != 0 {
                conn.internal_port = internal_port;
            }
            if external_port != 0 {
                conn.external_port = external_port;
            }
        }
    }

    /// First matching response RTT lands on the connection it arrived on.
    pub async fn record_rtt(&self, remote: SocketAddr, rtt: Duration) {
        let micros = rtt.as_micros().max(1).min(u64::MAX as u128) as u64;
        let best = self.rtt_cached_micros.load(Ordering::Relaxed);
        if best == 0 || micros < best {
            self.rtt_cached_micros.store(micros, Ordering::Relaxed);
        }
        let mut state = self.state.lock().await;
        if let Some(conn) = state
            .connections
            .iter_mut()
            .find(|c| c.remote.ip() == remote.ip())
        {
            conn.rtt = Some(rtt);
        }
    }

    pub async fn mark_outbound(&self, remote: SocketAddr) {
        let mut state = self.state.lock().await;
        if let Some(conn) = state
            .connections
            .iter_mut()
            .find(|c| c.remote.ip() == remote.ip())
        {
            conn.last_out = Instant::now();
        }
    }

    /// A fatal send error demotes the connection immediately; the next send
    /// moves to another active connection.
    pub async fn send_fatal(&self, remote: SocketAddr, adapter: IpAddr) {
        let mut state = self.state.lock().await;
        let mut demoted = None;
        for (i, conn) in state.connections.iter_mut().enumerate() {
            if conn.remote.ip() == remote.ip() && conn.adapter == adapter {
                if matches!(conn.status, ConnectionStatus::Active | ConnectionStatus::Redundant) {
                    conn.status = ConnectionStatus::Inactive;
                    conn.expires = Some(Instant::now() + CONNECTION_REMOVE);
                    demoted = Some(i);
                }
            }
        }
        if state.latest == demoted {
            // Fall back to any remaining active connection.
            let fallback = state
                .connections
                .iter()
                .position(|c| c.status == ConnectionStatus::Active);
            if fallback.is_none() {
                // Promote a redundant one if available.
                if let Some(i) = state
                    .connections
                    .iter()
                    .position(|c| c.status == ConnectionStatus::Redundant)
                {
                    state.connections[i].status = ConnectionStatus::Active;
                    state.latest = Some(i);
                    return;
                }
            }
            state.latest = fallback;
        }
    }

    /// Advance the connection state machine. Returns endpoints due a ping.
    pub async fn maintain(&self) -> Vec<PingDue> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let mut pings = Vec::new();

        for conn in state.connections.iter_mut() {
            match conn.status {
                ConnectionStatus::Active | ConnectionStatus::Redundant => {
                    if now.duration_since(conn.last_in) > conn.invalidate_after() {
                        conn.status = ConnectionStatus::Inactive;
                        conn.expires = Some(now + CONNECTION_REMOVE);
                    } else if now.duration_since(conn.last_ping) > conn.ping_interval()
                        && now.duration_since(conn.last_in) > conn.ping_interval()
                    {
                        conn.last_ping = now;
                        pings.push(PingDue { adapter: conn.adapter, remote: conn.remote });
                    }
                }
                ConnectionStatus::Inactive => {}
                ConnectionStatus::Removed => {}
            }
        }

        // Removal requires the peer to survive it: one active connection, or
        // at least two other inactive ones.
        let active_count = state
            .connections
            .iter()
            .filter(|c| matches!(c.status, ConnectionStatus::Active | ConnectionStatus::Redundant))
            .count();
        let inactive_count = state
            .connections
            .iter()
            .filter(|c| c.status == ConnectionStatus::Inactive)
            .count();

        let latest_remote = state.latest.map(|i| state.connections[i].remote);
        let mut removed_any = false;
        state.connections.retain(|conn| {
            if conn.status != ConnectionStatus::Inactive {
                return true;
            }
            let expired = conn.expires.map(|e| now >= e).unwrap_or(false);
            if expired && (active_count >= 1 || inactive_count >= 3) {
                removed_any = true;
                false
            } else {
                true
            }
        });
        if removed_any {
            state.latest = latest_remote.and_then(|remote| {
                state.connections.iter().position(|c| c.remote == remote)
            });
        }

        pings
    }

    /// The connection outbound messages should use: the latest if still
    /// active, otherwise any active connection.
    pub async fn active_connection(&self) -> Option<Connection> {
        let state = self.state.lock().await;
        if let Some(i) = state.latest {
            if let Some(conn) = state.connections.get(i) {
                if conn.status == ConnectionStatus::Active {
                    return Some(conn.clone());
                }
            }
        }
        state
            .connections
            .iter()
            .find(|c| c.status == ConnectionStatus::Active)
            .cloned()
    }

    /// Connectable iff some non-removed connection has a known internal port
    /// on the requested address family.
    pub async fn is_connectable(&self, want_ipv4: bool, want_ipv6: bool) -> bool {
        let state = self.state.lock().await;
        state.connections.iter().any(|c| {
            c.status != ConnectionStatus::Removed
                && c.internal_port != 0
                && ((want_ipv4 && c.remote.is_ipv4()) || (want_ipv6 && c.remote.is_ipv6()))
        })
    }

    /// Lowest RTT across live connections.
    pub async fn min_rtt(&self) -> Option<Duration> {
        let state = self.state.lock().await;
        state
            .connections
            .iter()
            .filter(|c| c.status != ConnectionStatus::Removed)
            .filter_map(|c| c.rtt)
            .min()
    }

    pub async fn connections(&self) -> Vec<Connection> {
        self.state.lock().await.connections.clone()
    }

    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.connections.len()
    }

    /// Wire record for sharing this peer in a response, if connectable.
    pub async fn share_record(
        &self,
        want_ipv4: bool,
        want_ipv6: bool,
        reason: u8,
    ) -> Option<super::message::PeerRecord> {
        let state = self.state.lock().await;
        let conn = state.connections.iter().find(|c| {
            c.status != ConnectionStatus::Removed
                && c.internal_port != 0
                && ((want_ipv4 && c.remote.is_ipv4()) || (want_ipv6 && c.remote.is_ipv6()))
        })?;
        let last_contact = conn.last_in.elapsed().as_secs();
        Some(super::message::PeerRecord {
            peer_id: self.peer_id,
            addr: conn.remote,
            last_contact_secs: last_contact.min(u32::MAX as u64) as u32,
            reason,
        })
    }

    pub async fn blockchain_height(&self) -> u32 {
        self.state.lock().await.blockchain_height
    }

    pub async fn user_agent(&self) -> String {
        self.state.lock().await.user_agent.clone()
    }
}

impl crate::dht::NodeContact for std::sync::Arc<PeerInfo> {
    fn node_id(&self) -> NodeId {
        self.node_id
    }

    fn rtt(&self) -> Option<Duration> {
        self.cached_rtt()
    }
}

impl std::fmt::Debug for PeerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerInfo")
            .field("peer_id", &hex::encode(self.peer_id))
            .field("root", &self.is_root())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Identity;

    fn peer() -> PeerInfo {
        PeerInfo::new(*Identity::generate().public_key())
    }

    fn addr(last: u8, port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::from([127, 0, 0, last]), port)
    }

    const ADAPTER: IpAddr = IpAddr::V4(std::net::Ipv4Addr::new(127, 0, 0, 1));

    #[tokio::test]
    async fn incoming_creates_active_latest() {
        let p = peer();
        assert!(p.touch_incoming(ADAPTER, addr(2, 5000)).await);
        let conn = p.active_connection().await.unwrap();
        assert_eq!(conn.status, ConnectionStatus::Active);
        assert_eq!(conn.remote, addr(2, 5000));
    }

    #[tokio::test]
    async fn same_ip_new_port_reuses_connection() {
        let p = peer();
        assert!(p.touch_incoming(ADAPTER, addr(2, 5000)).await);
        assert!(!p.touch_incoming(ADAPTER, addr(2, 6000)).await);
        assert_eq!(p.connection_count().await, 1);
        assert_eq!(p.active_connection().await.unwrap().remote.port(), 6000);
    }

    #[tokio::test]
    async fn second_path_demotes_first_to_redundant() {
        let p = peer();
        p.touch_incoming(ADAPTER, addr(2, 5000)).await;
        p.touch_incoming(ADAPTER, addr(3, 5000)).await;

        let conns = p.connections().await;
        assert_eq!(conns.len(), 2);
        let statuses: Vec<_> = conns.iter().map(|c| (c.remote.ip(), c.status)).collect();
        assert!(statuses.contains(&(addr(2, 0).ip(), ConnectionStatus::Redundant)));
        assert!(statuses.contains(&(addr(3, 0).ip(), ConnectionStatus::Active)));

        // At most one latest, and it is active.
        assert_eq!(p.active_connection().await.unwrap().remote.ip(), addr(3, 0).ip());
    }

    #[tokio::test]
    async fn send_fatal_falls_back_to_redundant() {
        let p = peer();
        p.touch_incoming(ADAPTER, addr(2, 5000)).await;
        p.touch_incoming(ADAPTER, addr(3, 5000)).await;

        p.send_fatal(addr(3, 5000), ADAPTER).await;
        let conn = p.active_connection().await.unwrap();
        assert_eq!(conn.remote.ip(), addr(2, 0).ip());
        assert_eq!(conn.status, ConnectionStatus::Active);
    }

    #[tokio::test]
    async fn nat_detection() {
        let p = peer();
        p.touch_incoming(ADAPTER, addr(2, 35123)).await;
        p.set_reported_ports(addr(2, 35123), 55000, 0).await;
        let conn = p.active_connection().await.unwrap();
        assert!(conn.is_behind_nat());
        assert!(!conn.has_port_forward());
    }

    #[tokio::test]
    async fn connectable_requires_internal_port() {
        let p = peer();
        p.touch_incoming(ADAPTER, addr(2, 5000)).await;
        assert!(!p.is_connectable(true, false).await);
        p.set_reported_ports(addr(2, 5000), 5000, 0).await;
        assert!(p.is_connectable(true, false).await);
        assert!(!p.is_connectable(false, true).await);
    }

    #[tokio::test]
    async fn virtual_connection_not_active() {
        let p = peer();
        p.add_virtual_connection(ADAPTER, addr(9, 35123), Some([1u8; 33])).await;
        assert!(p.active_connection().await.is_none());
        // Real packet on the same pair upgrades it.
        p.touch_incoming(ADAPTER, addr(9, 35123)).await;
        let conn = p.active_connection().await.unwrap();
        assert!(!conn.virtual_hint);
    }
}
