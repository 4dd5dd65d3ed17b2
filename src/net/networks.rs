//! Per-adapter UDP sockets, local discovery, and the outbound fan-out
//!
//! Every non-loopback adapter IP gets its own socket and read loop. IPv4
//! additionally listens on a port-reuse discovery socket and may emit
//! directed broadcasts; IPv6 joins the site-local discovery multicast group.
//! Inbound datagrams funnel into one bounded queue drained by the decode
//! workers; the queue is the back-pressure point, excess datagrams stay in
//! the kernel buffer or drop.

use super::packet::{PacketRaw, PACKET_LENGTH_MIN};
use super::sequence::{SequenceManager, SequencePayload};
use crate::crypto::Identity;
use secp256k1::PublicKey;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Default UDP listening port (the character 'p'). Falls back to an
/// OS-assigned port when taken.
pub const DEFAULT_LISTEN_PORT: u16 = 112;

/// Well-known local discovery port for broadcast and multicast.
pub const DISCOVERY_PORT: u16 = 12912;

/// Site-local discovery multicast group.
pub const MULTICAST_GROUP_IPV6: Ipv6Addr = Ipv6Addr::new(0xff05, 0, 0, 0, 0, 0, 0, 0x0112);

/// Bounded inbound work queue.
pub const WORK_QUEUE_CAPACITY: usize = 1000;

/// Adapter change poll interval.
pub const ADAPTER_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Read buffer per datagram.
const READ_BUFFER_SIZE: usize = 65536;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("send failed")]
    SendFailed,
    #[error("fatal send error, adapter gone")]
    SendFatal,
    #[error("no successful send on any network")]
    NoSuccessfulSend,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A raw datagram off the wire, queued for the decode workers.
#[derive(Debug)]
pub struct InboundDatagram {
    /// Local adapter IP of the receiving socket.
    pub adapter: IpAddr,
    pub remote: SocketAddr,
    pub data: Vec<u8>,
    /// Arrived on a discovery socket; decode with the well-known key.
    pub discovery: bool,
}

/// How to number outbound packets across the socket fan-out.
pub enum SequenceSpec {
    /// Reuse one sequence on every socket (responses, stream data).
    Existing(u32),
    /// Allocate a fresh waiting sequence per socket.
    PerSocket {
        payload: SequencePayload,
        timeout: Duration,
        bidirectional: bool,
    },
}

/// One adapter's socket.
pub struct AdapterSocket {
    pub adapter: IpAddr,
    pub local_port: u16,
    socket: Arc<UdpSocket>,
}

impl AdapterSocket {
    pub async fn send_to(&self, remote: SocketAddr, data: &[u8]) -> Result<(), NetError> {
        match self.socket.send_to(data, remote).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NetworkDown => Err(NetError::SendFatal),
            Err(_) => Err(NetError::SendFailed),
        }
    }
}

struct NetworkSetState {
    sockets_v4: Vec<Arc<AdapterSocket>>,
    sockets_v6: Vec<Arc<AdapterSocket>>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

/// All sockets of this node plus the shared inbound queue.
pub struct NetworkSet {
    listen_port: u16,
    queue_tx: mpsc::Sender<InboundDatagram>,
    queue_rx: Mutex<Option<mpsc::Receiver<InboundDatagram>>>,
    local_addrs: Arc<RwLock<HashSet<SocketAddr>>>,
    state: RwLock<NetworkSetState>,
    shutdown: watch::Receiver<bool>,
}

impl NetworkSet {
    pub fn new(listen_port: u16, shutdown: watch::Receiver<bool>) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(WORK_QUEUE_CAPACITY);
        Self {
            listen_port,
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            local_addrs: Arc::new(RwLock::new(HashSet::new())),
            state: RwLock::new(NetworkSetState {
                sockets_v4: Vec::new(),
                sockets_v6: Vec::new(),
                tasks: Vec::new(),
            }),
            shutdown,
        }
    }

    /// Take the inbound queue receiver. One consumer pool only.
    pub async fn take_queue(&self) -> Option<mpsc::Receiver<InboundDatagram>> {
        self.queue_rx.lock().await.take()
    }

    /// Non-loopback adapter IPs currently on the machine.
    pub fn enumerate_adapters() -> Vec<IpAddr> {
        match local_ip_address::list_afinet_netifas() {
            Ok(list) => list
                .into_iter()
                .map(|(_, ip)| ip)
                .filter(|ip| !ip.is_loopback() && !ip.is_unspecified())
                .collect(),
            Err(e) => {
                warn!("adapter enumeration failed: {}", e);
                Vec::new()
            }
        }
    }

    /// Start sockets on the given IPs, or on every enumerated adapter when
    /// the list is empty.
    pub async fn start(&self, listen: &[SocketAddr]) -> Result<(), NetError> {
        if listen.is_empty() {
            for ip in Self::enumerate_adapters() {
                if let Err(e) = self.start_adapter(ip, self.listen_port).await {
                    warn!("failed to start adapter {}: {}", ip, e);
                }
            }
        } else {
            for addr in listen {
                self.start_adapter(addr.ip(), addr.port()).await?;
            }
        }

        self.start_discovery_listeners().await;
        Ok(())
    }

    /// Bind one adapter socket, with OS-assigned fallback when the preferred
    /// port is taken, and spawn its read loop.
    pub async fn start_adapter(&self, ip: IpAddr, port: u16) -> Result<(), NetError> {
        let socket = match bind_udp(ip, port, false).await {
            Ok(s) => s,
            Err(_) if port != 0 => {
                debug!("port {} taken on {}, falling back to os-assigned", port, ip);
                bind_udp(ip, 0, false).await?
            }
            Err(e) => return Err(e.into()),
        };
        let local = socket.local_addr()?;
        if ip.is_ipv4() {
            socket.set_broadcast(true)?;
        }

        let adapter = Arc::new(AdapterSocket {
            adapter: ip,
            local_port: local.port(),
            socket: Arc::new(socket),
        });

        self.local_addrs.write().await.insert(local);

        let task = self.spawn_read_loop(adapter.socket.clone(), ip, false);
        let mut state = self.state.write().await;
        state.tasks.push(task);
        if ip.is_ipv4() {
            state.sockets_v4.push(adapter);
        } else {
            state.sockets_v6.push(adapter);
        }
        info!("listening on {}", local);
        Ok(())
    }

    /// Stop the socket bound to an adapter IP that disappeared.
    pub async fn stop_adapter(&self, ip: IpAddr) {
        let mut state = self.state.write().await;
        let removed: Vec<_> = state
            .sockets_v4
            .iter()
            .chain(state.sockets_v6.iter())
            .filter(|s| s.adapter == ip)
            .map(|s| SocketAddr::new(s.adapter, s.local_port))
            .collect();
        state.sockets_v4.retain(|s| s.adapter != ip);
        state.sockets_v6.retain(|s| s.adapter != ip);
        drop(state);

        let mut local = self.local_addrs.write().await;
        for addr in removed {
            local.remove(&addr);
            info!("stopped listening on {}", addr);
        }
    }

    /// Discovery listeners: IPv4 broadcast and IPv6 multicast on the
    /// well-known port, port-reuse so several nodes coexist on one host.
    async fn start_discovery_listeners(&self) {
        match bind_udp(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DISCOVERY_PORT, true).await {
            Ok(socket) => {
                let _ = socket.set_broadcast(true);
                let task = self.spawn_read_loop(
                    Arc::new(socket),
                    IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                    true,
                );
                self.state.write().await.tasks.push(task);
            }
            Err(e) => debug!("ipv4 discovery listener unavailable: {}", e),
        }

        match bind_udp(IpAddr::V6(Ipv6Addr::UNSPECIFIED), DISCOVERY_PORT, true).await {
            Ok(socket) => {
                if let Err(e) = socket.join_multicast_v6(&MULTICAST_GROUP_IPV6, 0) {
                    debug!("multicast join failed: {}", e);
                }
                let task = self.spawn_read_loop(
                    Arc::new(socket),
                    IpAddr::V6(Ipv6Addr::UNSPECIFIED),
                    true,
                );
                self.state.write().await.tasks.push(task);
            }
            Err(e) => debug!("ipv6 discovery listener unavailable: {}", e),
        }
    }

    fn spawn_read_loop(
        &self,
        socket: Arc<UdpSocket>,
        adapter: IpAddr,
        discovery: bool,
    ) -> tokio::task::JoinHandle<()> {
        let queue = self.queue_tx.clone();
        let local_addrs = self.local_addrs.clone();
        let mut shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; READ_BUFFER_SIZE];
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return;
                        }
                    }
                    result = socket.recv_from(&mut buf) => {
                        let (len, remote) = match result {
                            Ok(ok) => ok,
                            Err(e) => {
                                debug!("recv error on {}: {}", adapter, e);
                                continue;
                            }
                        };
                        if len < PACKET_LENGTH_MIN {
                            continue;
                        }
                        // Our own broadcasts come back; drop anything from a
                        // local listen endpoint.
                        if local_addrs.read().await.contains(&remote) {
                            continue;
                        }
                        let datagram = InboundDatagram {
                            adapter,
                            remote,
                            data: buf[..len].to_vec(),
                            discovery,
                        };
                        if queue.try_send(datagram).is_err() {
                            debug!("inbound queue full, dropping datagram");
                        }
                    }
                }
            }
        })
    }

    pub async fn sockets(&self, ipv4: bool) -> Vec<Arc<AdapterSocket>> {
        let state = self.state.read().await;
        if ipv4 {
            state.sockets_v4.clone()
        } else {
            state.sockets_v6.clone()
        }
    }

    pub async fn socket_for_adapter(&self, adapter: IpAddr) -> Option<Arc<AdapterSocket>> {
        let state = self.state.read().await;
        state
            .sockets_v4
            .iter()
            .chain(state.sockets_v6.iter())
            .find(|s| s.adapter == adapter)
            .cloned()
    }

    pub async fn adapter_ips(&self) -> Vec<IpAddr> {
        let state = self.state.read().await;
        state
            .sockets_v4
            .iter()
            .chain(state.sockets_v6.iter())
            .map(|s| s.adapter)
            .collect()
    }

    pub async fn has_ipv4(&self) -> bool {
        !self.state.read().await.sockets_v4.is_empty()
    }

    pub async fn has_ipv6(&self) -> bool {
        !self.state.read().await.sockets_v6.is_empty()
    }

    /// Encode and send one command across every socket matching the remote's
    /// address family. Success is a pure disjunction: at least one socket
    /// must accept the datagram.
    #[allow(clippy::too_many_arguments)]
    pub async fn send_all_networks(
        &self,
        identity: &Identity,
        sequences: &SequenceManager,
        receiver: &PublicKey,
        command: u8,
        payload: &[u8],
        sequence: SequenceSpec,
        remote: SocketAddr,
    ) -> Result<usize, NetError> {
        let sockets = self.sockets(remote.is_ipv4()).await;
        let receiver_id = receiver.serialize();
        let mut successes = 0;

        for socket in sockets {
            if link_local(&socket.adapter) != link_local(&remote.ip()) {
                continue;
            }
            let seq = match &sequence {
                SequenceSpec::Existing(seq) => *seq,
                SequenceSpec::PerSocket { payload, timeout, bidirectional } => {
                    sequences
                        .new_sequence(&receiver_id, payload.clone(), *timeout, *bidirectional, None)
                        .await
                }
            };
            let packet = PacketRaw::new(command, seq, payload.to_vec());
            let wire = match packet.encode(identity, receiver) {
                Ok(wire) => wire,
                Err(e) => {
                    warn!("packet encode failed: {}", e);
                    continue;
                }
            };
            if socket.send_to(remote, &wire).await.is_ok() {
                successes += 1;
            }
        }

        if successes == 0 {
            return Err(NetError::NoSuccessfulSend);
        }
        Ok(successes)
    }

    /// Emit a local-discovery announcement: broadcast on IPv4, multicast on
    /// IPv6, encrypted to the well-known discovery keys.
    pub async fn send_discovery(
        &self,
        identity: &Identity,
        command: u8,
        payload: &[u8],
    ) -> usize {
        let mut sent = 0;

        for socket in self.sockets(true).await {
            let receiver = crate::crypto::discovery_identity_ipv4().public_key();
            let packet = PacketRaw::new(command, 0, payload.to_vec());
            if let Ok(wire) = packet.encode(identity, receiver) {
                for target in broadcast_targets(&socket.adapter) {
                    let remote = SocketAddr::new(IpAddr::V4(target), DISCOVERY_PORT);
                    if socket.send_to(remote, &wire).await.is_ok() {
                        sent += 1;
                    }
                }
            }
        }

        for socket in self.sockets(false).await {
            let receiver = crate::crypto::discovery_identity_ipv6().public_key();
            let packet = PacketRaw::new(command, 0, payload.to_vec());
            if let Ok(wire) = packet.encode(identity, receiver) {
                let remote = SocketAddr::new(IpAddr::V6(MULTICAST_GROUP_IPV6), DISCOVERY_PORT);
                if socket.send_to(remote, &wire).await.is_ok() {
                    sent += 1;
                }
            }
        }
        sent
    }

    /// Poll for adapter changes, starting and stopping sockets to match.
    /// Explicitly configured listens are never churned.
    pub async fn run_adapter_monitor(self: Arc<Self>, auto_adapters: bool) {
        if !auto_adapters {
            return;
        }
        let mut shutdown = self.shutdown.clone();
        let mut interval = tokio::time::interval(ADAPTER_POLL_INTERVAL);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
                _ = interval.tick() => {
                    let current: HashSet<IpAddr> = self.adapter_ips().await.into_iter().collect();
                    let present: HashSet<IpAddr> = Self::enumerate_adapters().into_iter().collect();

                    for gone in current.difference(&present) {
                        info!("adapter {} disappeared", gone);
                        self.stop_adapter(*gone).await;
                    }
                    for added in present.difference(&current) {
                        info!("adapter {} appeared", added);
                        if let Err(e) = self.start_adapter(*added, self.listen_port).await {
                            warn!("failed to start new adapter {}: {}", added, e);
                        }
                    }
                }
            }
        }
    }

    pub async fn shutdown_tasks(&self) {
        let mut state = self.state.write().await;
        for task in state.tasks.drain(..) {
            task.abort();
        }
    }
}

/// Bind a UDP socket, optionally with address reuse (discovery listeners).
async fn bind_udp(ip: IpAddr, port: u16, reuse: bool) -> std::io::Result<UdpSocket> {
    let domain = if ip.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    if reuse {
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::new(ip, port).into())?;
    UdpSocket::from_std(socket.into())
}

fn link_local(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

/// Broadcast targets for an IPv4 adapter: the limited broadcast plus the
/// directed broadcast of the conventional private-range masks.
fn broadcast_targets(adapter: &IpAddr) -> Vec<Ipv4Addr> {
    let mut targets = vec![Ipv4Addr::BROADCAST];
    if let IpAddr::V4(ip) = adapter {
        let o = ip.octets();
        let directed = match o {
            [10, ..] => Some(Ipv4Addr::new(10, 255, 255, 255)),
            [172, b, ..] if (16..32).contains(&b) => Some(Ipv4Addr::new(172, b, 255, 255)),
            [192, 168, c, _] => Some(Ipv4Addr::new(192, 168, c, 255)),
            _ => None,
        };
        if let Some(d) = directed {
            targets.push(d);
        }
    }
    targets
}
