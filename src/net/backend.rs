//! The backend: owner of every subsystem and home of the packet handlers
//!
//! There is no global state. `Backend::init` builds the peer list, DHT,
//! network set, correlation tables, and collaborator seams; `connect` starts
//! the sockets, the decode worker pool, and the cadence tasks; `shutdown`
//! signals all of them and aborts what remains. Handlers receive the backend
//! by Arc and may enqueue outbound messages, advance DHT state, or hand
//! payload to a virtual stream.

use super::bootstrap::{self, RecentContacts, SeedContact};
use super::filters::Filters;
use super::lite::{LiteRouter, StreamEvent, LITE_IDLE_FILE_TRANSFER};
use super::message::{
    Announcement, Command, EmbeddedFile, GetBlockBody, GetBlockFrame, Hash2Peer, MessageHeader,
    PeerRecord, Response, TransferBody, TransferControl, TransferFrame, Traverse,
    EMBEDDED_FILE_SIZE_MAX, PEER_REASON_CLOSEST, PEER_REASON_STORING, TRANSFER_TYPE_FILE,
};
use super::networks::{InboundDatagram, NetError, NetworkSet, SequenceSpec, DEFAULT_LISTEN_PORT};
use super::packet::PacketRaw;
use super::peer::{Connection, PeerInfo};
use super::peerlist::PeerList;
use super::sequence::{SequenceManager, SequencePayload, REPLY_TIMEOUT};
use super::stream::{
    decode_file_prelude, encode_file_prelude, BlockStreamRecord, FrameKind, OutboundFrame,
    StreamError, VirtualPacketConn,
};
use super::traverse;
use crate::config::Config;
use crate::crypto::{self, Identity};
use crate::dht::{
    iterative_search, RoutingTable, SearchAction, SearchConfig, SearchRegistry, SearchResult,
    SearchTransport,
};
use crate::external::{
    BlockchainCache, MemoryBlockchainCache, MemoryUserBlockchain, MemoryWarehouse, UserBlockchain,
    Warehouse,
};
use crate::types::{
    Hash, LiteId, NodeId, PeerId, FEATURE_FIREWALL, FEATURE_IPV4_LISTEN, FEATURE_IPV6_LISTEN,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tracing::{debug, info, warn};

/// Storage advertisements (INFO_STORE) are remembered this long.
const STORAGE_INDEX_TTL: Duration = Duration::from_secs(60 * 60);

/// Default DHT search knobs; `async_search` lets callers override.
const DHT_ALPHA: usize = 5;

/// Bucket refresh cadence.
const BUCKET_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);
const FULL_REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Housekeeping tick: connection maintenance, table expiry.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum InitError {
    #[error("bad private key")]
    BadPrivateKey,
    #[error("blockchain corrupt")]
    BlockchainCorrupt,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl InitError {
    pub fn exit_code(&self) -> i32 {
        match self {
            InitError::BlockchainCorrupt => crate::config::EXIT_BLOCKCHAIN_CORRUPT,
            _ => crate::config::EXIT_INIT_FAILURE,
        }
    }
}

/// Incoming chat line, delivered to subscribers.
#[derive(Debug, Clone)]
pub struct ChatEvent {
    pub from: PeerId,
    pub text: String,
}

/// External collaborators and hooks injected at init.
pub struct Collaborators {
    pub filters: Filters,
    pub warehouse: Arc<dyn Warehouse>,
    pub blockchain_cache: Arc<dyn BlockchainCache>,
    pub user_blockchain: Arc<dyn UserBlockchain>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            filters: Filters::default(),
            warehouse: Arc::new(MemoryWarehouse::new()),
            blockchain_cache: Arc::new(MemoryBlockchainCache::new()),
            user_blockchain: Arc::new(MemoryUserBlockchain::default()),
        }
    }
}

/// Result of `get_data`.
#[derive(Debug, Clone)]
pub struct DataFound {
    pub data: Vec<u8>,
    /// The serving peer; ourselves when the warehouse had it locally.
    pub owner: PeerId,
}

/// Handle on a running `async_search`.
pub struct SearchClient {
    result: tokio::task::JoinHandle<SearchResult<Arc<PeerInfo>>>,
}

impl SearchClient {
    pub async fn result(self) -> SearchResult<Arc<PeerInfo>> {
        match self.result.await {
            Ok(result) => result,
            Err(_) => SearchResult {
                closest: Vec::new(),
                value: None,
                value_from: None,
                termination: crate::dht::SearchTermination::TimedOut,
            },
        }
    }
}

pub struct Backend {
    pub config: Config,
    pub identity: Identity,
    pub filters: Filters,
    pub peers: PeerList,
    pub networks: Arc<NetworkSet>,
    pub sequences: SequenceManager,
    pub lites: LiteRouter,
    pub dht: RoutingTable<Arc<PeerInfo>>,
    pub searches: SearchRegistry<Arc<PeerInfo>>,
    recent_contacts: RecentContacts,
    seed_contacts: Vec<SeedContact>,
    warehouse: Arc<dyn Warehouse>,
    blockchain_cache: Arc<dyn BlockchainCache>,
    user_blockchain: Arc<dyn UserBlockchain>,
    /// hash → peers advertising storage of it, with freshness.
    storage_index: Mutex<HashMap<Hash, Vec<(PeerId, Instant)>>>,
    chat_tx: broadcast::Sender<ChatEvent>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    started: AtomicBool,
}

impl Backend {
    pub fn init(config: Config) -> Result<Arc<Self>, InitError> {
        Self::init_with(config, Collaborators::default())
    }

    pub fn init_with(config: Config, collab: Collaborators) -> Result<Arc<Self>, InitError> {
        let identity = if config.private_key.is_empty() {
            Identity::generate()
        } else {
            Identity::from_private_key_hex(&config.private_key)
                .map_err(|_| InitError::BadPrivateKey)?
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let networks = Arc::new(NetworkSet::new(DEFAULT_LISTEN_PORT, shutdown_rx.clone()));
        let seed_contacts = bootstrap::parse_seed_list(&config.seed_list);
        let (chat_tx, _) = broadcast::channel(64);

        Ok(Arc::new(Self {
            dht: RoutingTable::new(*identity.node_id()),
            identity,
            filters: collab.filters,
            peers: PeerList::new(),
            networks,
            sequences: SequenceManager::new(),
            lites: LiteRouter::new(),
            searches: SearchRegistry::new(),
            recent_contacts: RecentContacts::default(),
            seed_contacts,
            warehouse: collab.warehouse,
            blockchain_cache: collab.blockchain_cache,
            user_blockchain: collab.user_blockchain,
            storage_index: Mutex::new(HashMap::new()),
            chat_tx,
            shutdown_tx,
            shutdown_rx,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            config,
        }))
    }

    /// Start sockets, workers, and cadence tasks. Idempotent.
    pub async fn connect(self: &Arc<Self>) -> Result<(), NetError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let listen = self.config.listen_addrs(DEFAULT_LISTEN_PORT);
        let auto_adapters = listen.is_empty();
        self.networks.start(&listen).await?;

        // Decode worker pool draining the shared inbound queue.
        let queue = self.networks.take_queue().await;
        if let Some(queue) = queue {
            let queue = Arc::new(Mutex::new(queue));
            let workers = self.config.listen_workers.max(1);
            for _ in 0..workers {
                let backend = self.clone();
                let queue = queue.clone();
                self.spawn(async move {
                    loop {
                        let datagram = queue.lock().await.recv().await;
                        match datagram {
                            Some(datagram) => backend.handle_datagram(datagram).await,
                            None => return,
                        }
                    }
                })
                .await;
            }
        }

        // Cadence tasks.
        let backend = self.clone();
        self.spawn(async move { backend.run_bootstrap().await }).await;
        let backend = self.clone();
        self.spawn(async move { backend.run_local_discovery().await }).await;
        let backend = self.clone();
        self.spawn(async move { backend.run_maintenance().await }).await;
        let backend = self.clone();
        self.spawn(async move { backend.run_bucket_refresh().await }).await;

        let networks = self.networks.clone();
        self.spawn(async move { networks.run_adapter_monitor(auto_adapters).await })
            .await;

        info!("backend connected, node id {}", hex::encode(self.identity.node_id()));
        Ok(())
    }

    async fn spawn<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tasks.lock().await.push(tokio::spawn(future));
    }

    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.networks.shutdown_tasks().await;
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        info!("backend stopped");
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Subscribe to incoming chat messages.
    pub fn chat_events(&self) -> broadcast::Receiver<ChatEvent> {
        self.chat_tx.subscribe()
    }

    // =========================================================================
    // ANNOUNCEMENT CONSTRUCTION
    // =========================================================================

    /// Our own announcement header: reachability features, blockchain
    /// status, user agent, and self-reported ports.
    async fn own_header(&self, with_user_agent: bool) -> MessageHeader {
        let mut features = 0u8;
        if self.networks.has_ipv4().await {
            features |= FEATURE_IPV4_LISTEN;
        }
        if self.networks.has_ipv6().await {
            features |= FEATURE_IPV6_LISTEN;
        }
        if self.config.local_firewall {
            features |= FEATURE_FIREWALL;
        }
        let internal_port = self
            .networks
            .sockets(true)
            .await
            .first()
            .map(|s| s.local_port)
            .or(self.networks.sockets(false).await.first().map(|s| s.local_port))
            .unwrap_or(0);
        MessageHeader {
            protocol: 0,
            features,
            blockchain_height: self.user_blockchain.height(),
            blockchain_version: self.user_blockchain.version(),
            user_agent: if with_user_agent {
                format!("filament/{}", env!("CARGO_PKG_VERSION"))
            } else {
                String::new()
            },
            internal_port,
            external_port: self.config.port_forward,
        }
    }

    async fn own_announcement(&self, with_user_agent: bool) -> Announcement {
        Announcement { header: self.own_header(with_user_agent).await, ..Default::default() }
    }

    // =========================================================================
    // OUTBOUND
    // =========================================================================

    /// The connection to use for this peer: the latest active one, or any
    /// non-removed path we have been hinted about.
    async fn best_connection(&self, peer: &Arc<PeerInfo>) -> Option<Connection> {
        if let Some(conn) = peer.active_connection().await {
            return Some(conn);
        }
        peer.connections()
            .await
            .into_iter()
            .find(|c| c.status != super::peer::ConnectionStatus::Removed)
    }

    /// Send a command to a peer, retrying once over another connection after
    /// a fatal send error.
    pub async fn send_command(
        &self,
        peer: &Arc<PeerInfo>,
        command: Command,
        payload: &[u8],
        spec: SequenceSpec,
    ) -> Result<(), NetError> {
        let Some(conn) = self.best_connection(peer).await else {
            return Err(NetError::NoSuccessfulSend);
        };

        let result = self
            .networks
            .send_all_networks(
                &self.identity,
                &self.sequences,
                &peer.public_key,
                command as u8,
                payload,
                spec,
                conn.remote,
            )
            .await;

        match result {
            Ok(_) => {
                peer.mark_outbound(conn.remote).await;
                (self.filters.packet_out)(&conn.remote, command as u8, payload.len());
                Ok(())
            }
            Err(e) => {
                peer.send_fatal(conn.remote, conn.adapter).await;
                // One retry over whatever connection remains.
                if let Some(fallback) = peer.active_connection().await {
                    if fallback.remote != conn.remote {
                        let retry = self
                            .networks
                            .send_all_networks(
                                &self.identity,
                                &self.sequences,
                                &peer.public_key,
                                command as u8,
                                payload,
                                SequenceSpec::Existing(0),
                                fallback.remote,
                            )
                            .await;
                        if retry.is_ok() {
                            peer.mark_outbound(fallback.remote).await;
                            return Ok(());
                        }
                    }
                }
                Err(e)
            }
        }
    }

    /// Announce ourselves to an arbitrary endpoint, optionally punching
    /// through the remote's NAT via a relay. Used by bootstrap and by the
    /// FIND_SELF result handler.
    pub async fn contact_arbitrary_peer(
        &self,
        public_key: &secp256k1::PublicKey,
        addr: SocketAddr,
        relay: Option<PeerId>,
    ) -> bool {
        if public_key == self.identity.public_key() {
            return false;
        }
        let Some((peer, _)) = self.peers.upsert(public_key).await else {
            return false;
        };

        let mut announcement = self.own_announcement(true).await;
        announcement.find_self = true;
        let payload = announcement.encode();

        let sent = self
            .networks
            .send_all_networks(
                &self.identity,
                &self.sequences,
                public_key,
                Command::Announcement as u8,
                &payload,
                SequenceSpec::PerSocket {
                    payload: SequencePayload::BootstrapFindSelf,
                    timeout: REPLY_TIMEOUT,
                    bidirectional: false,
                },
                addr,
            )
            .await
            .is_ok();
        (self.filters.message_out_announcement)(&peer.peer_id, &announcement);

        // First-packet relay through the NAT, when we know who can do it.
        if let Some(relay_id) = relay {
            self.send_traverse(&peer, &relay_id).await;
        }

        if sent {
            self.recent_contacts.record(&peer.peer_id).await;
        }
        sent
    }

    /// Wrap our announcement in a traverse and hand it to the relay.
    async fn send_traverse(&self, target: &Arc<PeerInfo>, relay_id: &PeerId) {
        let Some(relay) = self.peers.get(relay_id).await else {
            return;
        };
        let mut announcement = self.own_announcement(true).await;
        announcement.find_self = true;
        let seq = self
            .sequences
            .new_sequence(&target.peer_id, SequencePayload::None, REPLY_TIMEOUT, false, None)
            .await;
        let inner = match PacketRaw::new(Command::Announcement as u8, seq, announcement.encode())
            .encode(&self.identity, &target.public_key)
        {
            Ok(wire) => wire,
            Err(e) => {
                warn!("traverse inner encode failed: {}", e);
                return;
            }
        };
        let t = traverse::build(&self.identity, &target.peer_id, relay_id, inner);
        let payload = t.encode();
        if self
            .send_command(
                &relay,
                Command::Traverse,
                &payload,
                SequenceSpec::PerSocket {
                    payload: SequencePayload::None,
                    timeout: REPLY_TIMEOUT,
                    bidirectional: false,
                },
            )
            .await
            .is_ok()
        {
            (self.filters.message_out_traverse)(&relay.peer_id, &t);
        }
    }

    // =========================================================================
    // INBOUND DISPATCH
    // =========================================================================

    pub async fn handle_datagram(self: &Arc<Self>, datagram: InboundDatagram) {
        let receiver: &Identity = if datagram.discovery {
            if datagram.remote.is_ipv4() {
                crypto::discovery_identity_ipv4()
            } else {
                crypto::discovery_identity_ipv6()
            }
        } else {
            &self.identity
        };

        let (packet, sender) = match PacketRaw::decode(receiver, &datagram.data) {
            Ok(decoded) => decoded,
            Err(e) => {
                (self.filters.log_error)("packet.decode", &e.to_string());
                return;
            }
        };
        if packet.protocol != 0 {
            (self.filters.log_error)("packet.protocol", "unsupported version");
            return;
        }
        if sender == *self.identity.public_key() {
            return;
        }
        (self.filters.packet_in)(&datagram.remote, packet.command, packet.payload.len());

        let Some((peer, is_new_peer)) = self.peers.upsert(&sender).await else {
            debug!("dropping packet from blacklisted peer");
            return;
        };
        if is_new_peer {
            (self.filters.new_peer)(&peer.peer_id);
        }
        let new_connection = peer.touch_incoming(datagram.adapter, datagram.remote).await;
        if new_connection {
            (self.filters.new_peer_connection)(&peer.peer_id, &datagram.remote);
        }
        self.dht.upsert(peer.clone()).await;

        let command = match Command::from_u8(packet.command) {
            Ok(command) => command,
            Err(e) => {
                (self.filters.log_error)("message.command", &e.to_string());
                return;
            }
        };
        (self.filters.message_in)(&peer.peer_id, command);

        match command {
            Command::Announcement | Command::LocalDiscovery => {
                self.handle_announcement(&peer, &datagram, &packet, is_new_peer).await;
            }
            Command::Response => self.handle_response(&peer, &datagram, &packet).await,
            Command::Ping => self.handle_ping(&peer, &datagram, &packet).await,
            Command::Pong => self.handle_pong(&peer, &datagram, &packet).await,
            Command::Traverse => self.handle_traverse(&peer, &datagram, &packet).await,
            Command::GetBlock => self.handle_getblock(&peer, &packet).await,
            Command::Transfer => self.handle_transfer(&peer, &packet).await,
            Command::Chat => self.handle_chat(&peer, &packet).await,
        }
    }

    async fn handle_announcement(
        self: &Arc<Self>,
        peer: &Arc<PeerInfo>,
        datagram: &InboundDatagram,
        packet: &PacketRaw,
        is_new_peer: bool,
    ) {
        let announcement = match Announcement::decode(&packet.payload) {
            Ok(a) => a,
            Err(e) => {
                (self.filters.log_error)("announcement.decode", &e.to_string());
                return;
            }
        };
        // The first contact must identify its software.
        if is_new_peer && announcement.header.user_agent.is_empty() {
            (self.filters.log_error)("announcement.decode", "initial contact without user agent");
            return;
        }
        (self.filters.incoming_request)(&peer.peer_id, Command::Announcement);

        peer.apply_header(&announcement.header).await;
        peer.set_reported_ports(
            datagram.remote,
            announcement.header.internal_port,
            announcement.header.external_port,
        )
        .await;
        (self.filters.blockchain_cache_statistics)(
            &peer.peer_id,
            announcement.header.blockchain_height,
            announcement.header.blockchain_version,
        );
        self.blockchain_cache.new_header(
            &peer.peer_id,
            announcement.header.blockchain_height,
            announcement.header.blockchain_version,
        );

        // Remember storage advertisements.
        if !announcement.info_store.is_empty() {
            let mut index = self.storage_index.lock().await;
            for record in &announcement.info_store {
                let entry = index.entry(record.hash).or_default();
                entry.retain(|(id, _)| id != &peer.peer_id);
                entry.push((peer.peer_id, Instant::now()));
            }
        }

        let wants_answer = announcement.find_self
            || !announcement.find_peer.is_empty()
            || !announcement.find_value.is_empty();
        if !wants_answer {
            return;
        }

        let mut response = Response { header: self.own_header(true).await, ..Default::default() };

        let want_ipv4 = datagram.remote.is_ipv4();
        let want_ipv6 = datagram.remote.is_ipv6();

        if announcement.find_self {
            let group = self
                .close_peer_group(&peer.node_id, &peer.peer_id, want_ipv4, want_ipv6)
                .await;
            response.hash2peers.push(group);
        }
        for hash in &announcement.find_peer {
            let group = self
                .close_peer_group(hash, &peer.peer_id, want_ipv4, want_ipv6)
                .await;
            response.hash2peers.push(group);
        }
        for hash in &announcement.find_value {
            if let Some(data) = self.warehouse.read_file(hash, 0, 0) {
                if data.len() <= EMBEDDED_FILE_SIZE_MAX {
                    response.files_embed.push(EmbeddedFile { hash: *hash, data });
                    continue;
                }
            }
            let mut group = self
                .close_peer_group(hash, &peer.peer_id, want_ipv4, want_ipv6)
                .await;
            let storing = self.storing_peers(hash, want_ipv4, want_ipv6).await;
            if storing.is_empty() && group.peers.is_empty() {
                response.hashes_not_found.push(*hash);
                continue;
            }
            group.peers.extend(storing);
            response.hash2peers.push(group);
        }

        let payload = response.encode();
        let _ = self
            .send_command(
                peer,
                Command::Response,
                &payload,
                SequenceSpec::Existing(packet.sequence),
            )
            .await;
        (self.filters.message_out_response)(&peer.peer_id, &response);
    }

    /// Up to five closest connectable peers for one queried hash.
    async fn close_peer_group(
        &self,
        hash: &NodeId,
        asker: &PeerId,
        want_ipv4: bool,
        want_ipv6: bool,
    ) -> Hash2Peer {
        let mut peers = Vec::new();
        for node in self.dht.closest(hash, DHT_ALPHA + 1).await {
            if &node.contact.peer_id == asker {
                continue;
            }
            if let Some(record) = node
                .contact
                .share_record(want_ipv4, want_ipv6, PEER_REASON_CLOSEST)
                .await
            {
                peers.push(record);
            }
            if peers.len() >= DHT_ALPHA {
                break;
            }
        }
        Hash2Peer { hash: *hash, peers, last: true }
    }

    /// Peers that advertised storing this hash, rendered as share records.
    async fn storing_peers(&self, hash: &Hash, want_ipv4: bool, want_ipv6: bool) -> Vec<PeerRecord> {
        let advertisers: Vec<PeerId> = {
            let index = self.storage_index.lock().await;
            match index.get(hash) {
                Some(entries) => entries
                    .iter()
                    .filter(|(_, at)| at.elapsed() < STORAGE_INDEX_TTL)
                    .map(|(id, _)| *id)
                    .collect(),
                None => Vec::new(),
            }
        };
        let mut records = Vec::new();
        for id in advertisers {
            if let Some(peer) = self.peers.get(&id).await {
                if let Some(record) = peer
                    .share_record(want_ipv4, want_ipv6, PEER_REASON_STORING)
                    .await
                {
                    records.push(record);
                }
            }
        }
        records
    }

    async fn handle_response(
        self: &Arc<Self>,
        peer: &Arc<PeerInfo>,
        datagram: &InboundDatagram,
        packet: &PacketRaw,
    ) {
        let response = match Response::decode(&packet.payload) {
            Ok(r) => r,
            Err(e) => {
                (self.filters.log_error)("response.decode", &e.to_string());
                return;
            }
        };
        peer.apply_header(&response.header).await;
        peer.set_reported_ports(
            datagram.remote,
            response.header.internal_port,
            response.header.external_port,
        )
        .await;

        let Some(matched) = self.sequences.match_incoming(&peer.peer_id, packet.sequence).await
        else {
            (self.filters.log_error)("response.sequence", "unsolicited response");
            return;
        };
        if let Some(rtt) = matched.rtt {
            peer.record_rtt(datagram.remote, rtt).await;
        }

        match matched.payload {
            SequencePayload::BootstrapFindSelf => {
                self.handle_find_self_results(peer, &response).await;
            }
            SequencePayload::InformationRequest(handle) => {
                self.handle_information_response(peer, &response, handle).await;
            }
            SequencePayload::Stream(_) | SequencePayload::None => {}
        }
    }

    /// Bootstrap FIND_SELF results: vet each returned close-peer and, unless
    /// contacted recently, announce ourselves to it.
    async fn handle_find_self_results(self: &Arc<Self>, from: &Arc<PeerInfo>, response: &Response) {
        for group in &response.hash2peers {
            for record in &group.peers {
                if !bootstrap::returned_peer_usable(record, &self.identity.peer_id()) {
                    continue;
                }
                let Ok(public_key) = crypto::parse_peer_id(&record.peer_id) else {
                    continue;
                };
                if !self.recent_contacts.should_contact(&record.peer_id).await {
                    continue;
                }
                // The reporter becomes the traversal relay for peers it
                // claims are storing/behind NAT.
                self.contact_arbitrary_peer(&public_key, record.addr, Some(from.peer_id))
                    .await;
            }
        }
    }

    /// Streamed DHT response: convert to a search update and deliver.
    async fn handle_information_response(
        self: &Arc<Self>,
        from: &Arc<PeerInfo>,
        response: &Response,
        handle: u64,
    ) {
        for group in &response.hash2peers {
            let mut contacts = Vec::new();
            for record in &group.peers {
                let Ok(public_key) = crypto::parse_peer_id(&record.peer_id) else {
                    continue;
                };
                let Some((candidate, _)) = self.peers.upsert(&public_key).await else {
                    continue;
                };
                // Remember how to reach it; the reporter can relay.
                let adapter = self
                    .networks
                    .adapter_ips()
                    .await
                    .into_iter()
                    .find(|ip| ip.is_ipv4() == record.addr.is_ipv4());
                if let Some(adapter) = adapter {
                    candidate
                        .add_virtual_connection(adapter, record.addr, Some(from.peer_id))
                        .await;
                }
                contacts.push(candidate);
            }
            let update = crate::dht::SearchUpdate {
                from: from.node_id,
                contacts,
                value: None,
                last: group.last,
            };
            self.searches.deliver(handle, update).await;
        }
        for file in &response.files_embed {
            let update = crate::dht::SearchUpdate {
                from: from.node_id,
                contacts: Vec::new(),
                value: Some(file.data.clone()),
                last: true,
            };
            self.searches.deliver(handle, update).await;
        }
        if !response.hashes_not_found.is_empty() {
            let update = crate::dht::SearchUpdate {
                from: from.node_id,
                contacts: Vec::new(),
                value: None,
                last: true,
            };
            self.searches.deliver(handle, update).await;
        }
    }

    async fn handle_ping(&self, peer: &Arc<PeerInfo>, datagram: &InboundDatagram, packet: &PacketRaw) {
        // A ping on a connection whose internal port we never learned means
        // the peers never exchanged announcements; answer with one instead
        // of a pong to break the stalemate.
        let internal_known = peer
            .connections()
            .await
            .iter()
            .any(|c| c.remote.ip() == datagram.remote.ip() && c.internal_port != 0);
        if !internal_known {
            let announcement = self.own_announcement(true).await;
            let payload = announcement.encode();
            let _ = self
                .send_command(
                    peer,
                    Command::Announcement,
                    &payload,
                    SequenceSpec::PerSocket {
                        payload: SequencePayload::None,
                        timeout: REPLY_TIMEOUT,
                        bidirectional: false,
                    },
                )
                .await;
            (self.filters.message_out_announcement)(&peer.peer_id, &announcement);
            return;
        }
        let _ = self
            .send_command(peer, Command::Pong, &[], SequenceSpec::Existing(packet.sequence))
            .await;
        (self.filters.message_out_pong)(&peer.peer_id);
    }

    async fn handle_pong(&self, peer: &Arc<PeerInfo>, datagram: &InboundDatagram, packet: &PacketRaw) {
        let Some(matched) = self.sequences.match_incoming(&peer.peer_id, packet.sequence).await
        else {
            (self.filters.log_error)("pong.sequence", "unsolicited pong");
            return;
        };
        if let Some(rtt) = matched.rtt {
            peer.record_rtt(datagram.remote, rtt).await;
        }
    }

    async fn handle_traverse(
        self: &Arc<Self>,
        peer: &Arc<PeerInfo>,
        datagram: &InboundDatagram,
        packet: &PacketRaw,
    ) {
        let mut message = match Traverse::decode(&packet.payload) {
            Ok(t) => t,
            Err(e) => {
                (self.filters.log_error)("traverse.decode", &e.to_string());
                return;
            }
        };

        if message.authorized_relay == self.identity.peer_id() {
            // Relay role: verify, stamp the signer's observed endpoint,
            // forward to the target if we actually know it.
            if let Err(e) = traverse::validate_at_relay(&message, &peer.public_key, &self.identity)
            {
                (self.filters.log_error)("traverse.relay", &e.to_string());
                return;
            }
            let Some(target) = self.peers.get(&message.target).await else {
                debug!("traverse target unknown, dropping");
                return;
            };
            traverse::fill_observed(&mut message, datagram.remote);
            let payload = message.encode();
            let _ = self
                .send_command(
                    &target,
                    Command::Traverse,
                    &payload,
                    SequenceSpec::PerSocket {
                        payload: SequencePayload::None,
                        timeout: REPLY_TIMEOUT,
                        bidirectional: false,
                    },
                )
                .await;
            (self.filters.message_out_traverse)(&target.peer_id, &message);
            return;
        }

        if message.target == self.identity.peer_id() {
            let (inner, inner_sender) =
                match traverse::validate_at_target(&message, &peer.public_key, &self.identity) {
                    Ok(ok) => ok,
                    Err(e) => {
                        (self.filters.log_error)("traverse.target", &e.to_string());
                        return;
                    }
                };
            let Some((signer, is_new)) = self.peers.upsert(&inner_sender).await else {
                return;
            };
            if is_new {
                (self.filters.new_peer)(&signer.peer_id);
            }

            // The relay-stamped endpoint is our hole-punch hint back to the
            // signer.
            let hinted = SocketAddr::new(message.receiver_ip, message.receiver_port);
            if message.receiver_port != 0 {
                let adapter = self
                    .networks
                    .adapter_ips()
                    .await
                    .into_iter()
                    .find(|ip| ip.is_ipv4() == hinted.is_ipv4());
                if let Some(adapter) = adapter {
                    signer.add_virtual_connection(adapter, hinted, Some(peer.peer_id)).await;
                }
            }

            if inner.command == Command::Announcement as u8
                || inner.command == Command::LocalDiscovery as u8
            {
                if let Ok(announcement) = Announcement::decode(&inner.payload) {
                    signer.apply_header(&announcement.header).await;
                }
                // Open our NAT towards the signer with a direct announcement.
                let mut own = self.own_announcement(true).await;
                own.find_self = true;
                let payload = own.encode();
                if message.receiver_port != 0 {
                    let _ = self
                        .networks
                        .send_all_networks(
                            &self.identity,
                            &self.sequences,
                            &inner_sender,
                            Command::Announcement as u8,
                            &payload,
                            SequenceSpec::PerSocket {
                                payload: SequencePayload::None,
                                timeout: REPLY_TIMEOUT,
                                bidirectional: false,
                            },
                            hinted,
                        )
                        .await;
                    (self.filters.message_out_announcement)(&signer.peer_id, &own);
                }
            }
            return;
        }

        (self.filters.log_error)("traverse", "neither relay nor target");
    }

    async fn handle_chat(&self, peer: &Arc<PeerInfo>, packet: &PacketRaw) {
        match super::message::decode_chat(&packet.payload) {
            Ok(text) => {
                let _ = self.chat_tx.send(ChatEvent { from: peer.peer_id, text });
            }
            Err(e) => (self.filters.log_error)("chat.decode", &e.to_string()),
        }
    }

    // =========================================================================
    // STREAMS
    // =========================================================================

    /// Spawn the task that moves a stream's outbound frames onto the wire,
    /// all carrying the stream's sequence.
    async fn spawn_stream_sender(
        self: &Arc<Self>,
        peer: Arc<PeerInfo>,
        sequence: u32,
        mut out_rx: mpsc::Receiver<OutboundFrame>,
    ) {
        let backend = self.clone();
        self.spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let command = match frame.kind {
                    FrameKind::Transfer { .. } => Command::Transfer,
                    FrameKind::GetBlock => Command::GetBlock,
                };
                if backend
                    .send_command(&peer, command, &frame.payload, SequenceSpec::Existing(sequence))
                    .await
                    .is_err()
                {
                    return;
                }
            }
        })
        .await;
    }

    /// Open a virtual stream towards a peer. Registers the lite ID, arms the
    /// bi-directional sequence, and wires the send task.
    async fn open_stream(
        self: &Arc<Self>,
        peer: &Arc<PeerInfo>,
        kind: FrameKind,
        lite_id: LiteId,
        idle: Duration,
    ) -> (Arc<VirtualPacketConn>, u32) {
        let in_rx = self.lites.register(lite_id, &peer.peer_id, idle).await;
        let sequence = self
            .sequences
            .new_sequence(
                &peer.peer_id,
                SequencePayload::Stream(lite_id),
                idle,
                true,
                None,
            )
            .await;
        let (out_tx, out_rx) = mpsc::channel(64);
        let conn = Arc::new(VirtualPacketConn::new(kind, peer.peer_id, lite_id, out_tx, in_rx));
        self.spawn_stream_sender(peer.clone(), sequence, out_rx).await;
        (conn, sequence)
    }

    async fn handle_transfer(self: &Arc<Self>, peer: &Arc<PeerInfo>, packet: &PacketRaw) {
        let frame = match TransferFrame::decode(&packet.payload) {
            Ok(f) => f,
            Err(e) => {
                (self.filters.log_error)("transfer.decode", &e.to_string());
                return;
            }
        };

        match frame.control {
            TransferControl::RequestStart => {
                (self.filters.incoming_request)(&peer.peer_id, Command::Transfer);
                let TransferBody::Request { hash, offset, limit } = frame.body else {
                    return;
                };
                self.serve_file_transfer(peer, frame.lite_id, packet.sequence, hash, offset, limit)
                    .await;
            }
            TransferControl::Active => {
                let delivered = self
                    .lites
                    .deliver(
                        &frame.lite_id,
                        &peer.peer_id,
                        match frame.body {
                            TransferBody::Data(data) => StreamEvent::Data(data),
                            _ => return,
                        },
                    )
                    .await;
                if delivered {
                    self.sequences
                        .touch(&peer.peer_id, packet.sequence, LITE_IDLE_FILE_TRANSFER)
                        .await;
                }
            }
            control => {
                self.lites
                    .deliver(&frame.lite_id, &peer.peer_id, StreamEvent::Control(control))
                    .await;
            }
        }
    }

    /// Responder side of a file transfer.
    async fn serve_file_transfer(
        self: &Arc<Self>,
        peer: &Arc<PeerInfo>,
        lite_id: LiteId,
        sequence: u32,
        hash: Hash,
        offset: u64,
        limit: u64,
    ) {
        let kind = FrameKind::Transfer { transfer_type: TRANSFER_TYPE_FILE };

        let Some(total_size) = self.warehouse.file_size(&hash) else {
            // 404: control frame only, no stream.
            let frame = TransferFrame {
                control: TransferControl::NotAvailable,
                transfer_type: TRANSFER_TYPE_FILE,
                lite_id,
                body: TransferBody::None,
            };
            let _ = self
                .send_command(
                    peer,
                    Command::Transfer,
                    &frame.encode(),
                    SequenceSpec::Existing(sequence),
                )
                .await;
            return;
        };
        let Some(data) = self.warehouse.read_file(&hash, offset, limit) else {
            return;
        };
        if data.is_empty() {
            let frame = TransferFrame {
                control: TransferControl::Empty,
                transfer_type: TRANSFER_TYPE_FILE,
                lite_id,
                body: TransferBody::None,
            };
            let _ = self
                .send_command(
                    peer,
                    Command::Transfer,
                    &frame.encode(),
                    SequenceSpec::Existing(sequence),
                )
                .await;
            return;
        }

        let in_rx = self.lites.register(lite_id, &peer.peer_id, LITE_IDLE_FILE_TRANSFER).await;
        let (out_tx, out_rx) = mpsc::channel(64);
        let conn = Arc::new(VirtualPacketConn::new(kind, peer.peer_id, lite_id, out_tx, in_rx));
        self.spawn_stream_sender(peer.clone(), sequence, out_rx).await;

        let backend = self.clone();
        self.spawn(async move {
            let prelude = encode_file_prelude(total_size, data.len() as u64);
            let mut first = prelude.to_vec();
            first.extend_from_slice(&data[..data.len().min(1024)]);
            if conn.write(&first).await.is_err() {
                return;
            }
            if data.len() > 1024 {
                if conn.write(&data[1024..]).await.is_err() {
                    return;
                }
            }
            conn.terminate(TransferControl::Terminate).await;
            backend.lites.unregister(&conn.lite_id).await;
        })
        .await;
    }

    /// Request a ranged file transfer from a peer. Returns the stream; the
    /// first datagram carries the 16-byte prelude.
    pub async fn file_transfer_request(
        self: &Arc<Self>,
        peer: &Arc<PeerInfo>,
        hash: Hash,
        offset: u64,
        limit: u64,
    ) -> Result<Arc<VirtualPacketConn>, NetError> {
        let lite_id = super::lite::new_lite_id();
        let kind = FrameKind::Transfer { transfer_type: TRANSFER_TYPE_FILE };
        let (conn, sequence) = self
            .open_stream(peer, kind, lite_id, LITE_IDLE_FILE_TRANSFER)
            .await;

        let frame = TransferFrame {
            control: TransferControl::RequestStart,
            transfer_type: TRANSFER_TYPE_FILE,
            lite_id,
            body: TransferBody::Request { hash, offset, limit },
        };
        self.send_command(
            peer,
            Command::Transfer,
            &frame.encode(),
            SequenceSpec::Existing(sequence),
        )
        .await?;
        Ok(conn)
    }

    /// Read a whole file transfer: prelude, bytes, then normal termination.
    pub async fn receive_file(conn: &VirtualPacketConn) -> Result<(u64, Vec<u8>), StreamError> {
        let first = conn.read().await?;
        let Some((total_size, transfer_size)) = decode_file_prelude(&first) else {
            return Err(StreamError::Terminated(super::stream::STREAM_REASON_EMPTY));
        };
        let mut data = first[16..].to_vec();
        while (data.len() as u64) < transfer_size {
            match conn.read().await {
                Ok(chunk) => data.extend_from_slice(&chunk),
                Err(StreamError::Terminated(r))
                    if r == super::stream::STREAM_REASON_REMOTE_TERMINATE =>
                {
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok((total_size, data))
    }

    async fn handle_getblock(self: &Arc<Self>, peer: &Arc<PeerInfo>, packet: &PacketRaw) {
        let frame = match GetBlockFrame::decode(&packet.payload) {
            Ok(f) => f,
            Err(e) => {
                (self.filters.log_error)("getblock.decode", &e.to_string());
                return;
            }
        };

        match frame.control {
            TransferControl::RequestStart => {
                (self.filters.incoming_request)(&peer.peer_id, Command::GetBlock);
                let GetBlockBody::Request { owner, max_block_size, limit_blocks, ranges } =
                    frame.body
                else {
                    return;
                };
                self.serve_blocks(
                    peer,
                    frame.lite_id,
                    packet.sequence,
                    owner,
                    max_block_size,
                    limit_blocks,
                    ranges,
                )
                .await;
            }
            TransferControl::Active => {
                let GetBlockBody::Data(data) = frame.body else { return };
                let delivered = self
                    .lites
                    .deliver(&frame.lite_id, &peer.peer_id, StreamEvent::Data(data))
                    .await;
                if delivered {
                    self.sequences
                        .touch(&peer.peer_id, packet.sequence, LITE_IDLE_FILE_TRANSFER)
                        .await;
                }
            }
            control => {
                self.lites
                    .deliver(&frame.lite_id, &peer.peer_id, StreamEvent::Control(control))
                    .await;
            }
        }
    }

    /// Responder side of a block download: stream the requested ranges from
    /// our own chain or from the cache of the named owner.
    #[allow(clippy::too_many_arguments)]
    async fn serve_blocks(
        self: &Arc<Self>,
        peer: &Arc<PeerInfo>,
        lite_id: LiteId,
        sequence: u32,
        owner: PeerId,
        max_block_size: u64,
        limit_blocks: u64,
        ranges: Vec<super::message::BlockRange>,
    ) {
        let in_rx = self.lites.register(lite_id, &peer.peer_id, LITE_IDLE_FILE_TRANSFER).await;
        let (out_tx, out_rx) = mpsc::channel(64);
        let conn = Arc::new(VirtualPacketConn::new(
            FrameKind::GetBlock,
            peer.peer_id,
            lite_id,
            out_tx,
            in_rx,
        ));
        self.spawn_stream_sender(peer.clone(), sequence, out_rx).await;

        let backend = self.clone();
        let own_id = self.identity.peer_id();
        self.spawn(async move {
            let mut sent_blocks = 0u64;
            'ranges: for range in ranges {
                for number in range.offset..range.offset.saturating_add(range.limit) {
                    if limit_blocks != 0 && sent_blocks >= limit_blocks {
                        break 'ranges;
                    }
                    let block = if owner == own_id {
                        backend.user_blockchain.read_block(number)
                    } else {
                        backend.blockchain_cache.read_block(&owner, number)
                    };
                    let record = match block {
                        Some(data)
                            if max_block_size == 0 || (data.len() as u64) <= max_block_size =>
                        {
                            BlockStreamRecord::Block { number, data }
                        }
                        _ => BlockStreamRecord::NotAvailable { offset: number },
                    };
                    if conn.write(&record.encode()).await.is_err() {
                        return;
                    }
                    sent_blocks += 1;
                }
            }
            conn.terminate(TransferControl::Terminate).await;
            backend.lites.unregister(&conn.lite_id).await;
        })
        .await;
    }

    /// Download blocks of `owner`'s chain from a peer, invoking `on_block`
    /// per streamed record. Completes on normal stream termination.
    pub async fn block_download<F>(
        self: &Arc<Self>,
        peer: &Arc<PeerInfo>,
        owner: PeerId,
        limit_blocks: u64,
        max_block_size: u64,
        ranges: Vec<super::message::BlockRange>,
        mut on_block: F,
    ) -> Result<usize, NetError>
    where
        F: FnMut(BlockStreamRecord) + Send,
    {
        let lite_id = super::lite::new_lite_id();
        let (conn, sequence) = self
            .open_stream(peer, FrameKind::GetBlock, lite_id, LITE_IDLE_FILE_TRANSFER)
            .await;

        let frame = GetBlockFrame {
            control: TransferControl::RequestStart,
            lite_id,
            body: GetBlockBody::Request { owner, max_block_size, limit_blocks, ranges },
        };
        self.send_command(
            peer,
            Command::GetBlock,
            &frame.encode(),
            SequenceSpec::Existing(sequence),
        )
        .await?;

        let mut records = 0;
        loop {
            match conn.read().await {
                Ok(data) => {
                    if let Some(record) = BlockStreamRecord::decode(&data) {
                        records += 1;
                        on_block(record);
                    }
                }
                Err(StreamError::Terminated(reason))
                    if reason == super::stream::STREAM_REASON_REMOTE_TERMINATE =>
                {
                    break;
                }
                Err(_) => break,
            }
        }
        self.lites.unregister(&lite_id).await;
        self.sequences.remove(&peer.peer_id, sequence).await;
        Ok(records)
    }

    // =========================================================================
    // CALLER API
    // =========================================================================

    /// Broadcast a chat line to every connected peer.
    pub async fn send_chat_all(self: &Arc<Self>, text: &str) -> usize {
        let mut sent = 0;
        for peer in self.peers.snapshot().await {
            if peer.active_connection().await.is_none() {
                continue;
            }
            if self
                .send_command(
                    &peer,
                    Command::Chat,
                    text.as_bytes(),
                    SequenceSpec::PerSocket {
                        payload: SequencePayload::None,
                        timeout: REPLY_TIMEOUT,
                        bidirectional: false,
                    },
                )
                .await
                .is_ok()
            {
                sent += 1;
            }
        }
        sent
    }

    /// Store bytes locally and advertise the hash to the `fanout` closest
    /// peers.
    pub async fn store_data_dht(self: &Arc<Self>, data: &[u8], fanout: usize) -> Hash {
        let hash = self.warehouse.store_file(data);
        let mut announcement = self.own_announcement(false).await;
        announcement.info_store.push(super::message::InfoStore {
            hash,
            size: data.len() as u64,
            file_type: 0,
        });
        let payload = announcement.encode();

        for node in self.dht.closest(&hash, fanout).await {
            let _ = self
                .send_command(
                    &node.contact,
                    Command::Announcement,
                    &payload,
                    SequenceSpec::PerSocket {
                        payload: SequencePayload::None,
                        timeout: REPLY_TIMEOUT,
                        bidirectional: false,
                    },
                )
                .await;
        }
        hash
    }

    /// Store bytes locally without advertising.
    pub fn store_data_local(&self, data: &[u8]) -> Hash {
        self.warehouse.store_file(data)
    }

    /// Fetch by hash: warehouse first, then a FIND_VALUE search.
    pub async fn get_data(self: &Arc<Self>, hash: &Hash) -> Option<DataFound> {
        if let Some(data) = self.warehouse.read_file(hash, 0, 0) {
            return Some(DataFound { data, owner: self.identity.peer_id() });
        }
        let client = self
            .async_search(SearchAction::FindValue, *hash, SearchConfig::default())
            .await;
        let result = client.result().await;
        let data = result.value?;
        if crypto::hash(&data) != *hash {
            return None;
        }
        let owner = match result.value_from {
            Some(node_id) => self
                .peers
                .get_by_node_id(&node_id)
                .await
                .map(|p| p.peer_id)
                .unwrap_or_else(|| self.identity.peer_id()),
            None => self.identity.peer_id(),
        };
        Some(DataFound { data, owner })
    }

    /// Iterative FIND_NODE for a node ID.
    pub async fn find_node(self: &Arc<Self>, node_id: NodeId, timeout: Duration) -> SearchResult<Arc<PeerInfo>> {
        let config = SearchConfig { timeout, ..Default::default() };
        self.async_search(SearchAction::FindNode, node_id, config)
            .await
            .result()
            .await
    }

    /// Launch an asynchronous iterative search and return its client handle.
    pub async fn async_search(
        self: &Arc<Self>,
        action: SearchAction,
        key: NodeId,
        config: SearchConfig,
    ) -> SearchClient {
        let seeds: Vec<Arc<PeerInfo>> = self
            .dht
            .closest(&key, config.k)
            .await
            .into_iter()
            .map(|n| n.contact)
            .collect();
        let backend = self.clone();
        let result = tokio::spawn(async move {
            (backend.filters.dht_search_status)(0, "search started");
            let transport = BackendSearchTransport { backend: Arc::downgrade(&backend) };
            let result = iterative_search(
                &transport,
                &backend.searches,
                seeds,
                action,
                key,
                config,
            )
            .await;
            (backend.filters.dht_search_status)(0, "search finished");
            result
        });
        SearchClient { result }
    }

    /// Drop a cached remote blockchain and tell the observer.
    pub async fn delete_blockchain_cache(&self, peer_id: &PeerId) {
        self.blockchain_cache.delete_blockchain(peer_id);
        (self.filters.blockchain_cache_delete)(peer_id);
    }

    // =========================================================================
    // CADENCE LOOPS
    // =========================================================================

    async fn contact_seeds(self: &Arc<Self>) {
        for seed in &self.seed_contacts {
            if let Some((peer, _)) = self.peers.upsert(&seed.public_key).await {
                peer.set_root();
            }
            for addr in &seed.addresses {
                self.contact_arbitrary_peer(&seed.public_key, *addr, None).await;
            }
        }
    }

    /// Seed bootstrap: phase 1 fast until enough roots answer, phase 2 slow.
    async fn run_bootstrap(self: Arc<Self>) {
        if self.seed_contacts.is_empty() {
            return;
        }
        let mut shutdown = self.shutdown_rx.clone();

        let phase1_deadline = Instant::now() + bootstrap::PHASE1_DURATION;
        loop {
            self.contact_seeds().await;
            if self.peers.connected_root_count().await >= bootstrap::PHASE1_TARGET_ROOT_PEERS {
                debug!("bootstrap phase 1 satisfied");
                return;
            }
            if Instant::now() > phase1_deadline {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => { if *shutdown.borrow() { return; } }
                _ = tokio::time::sleep(bootstrap::PHASE1_INTERVAL) => {}
            }
        }

        let phase2_deadline = Instant::now() + bootstrap::PHASE2_DURATION;
        while Instant::now() < phase2_deadline {
            tokio::select! {
                _ = shutdown.changed() => { if *shutdown.borrow() { return; } }
                _ = tokio::time::sleep(bootstrap::PHASE2_INTERVAL) => {}
            }
            if self.peers.connected_root_count().await >= bootstrap::PHASE1_TARGET_ROOT_PEERS {
                return;
            }
            self.contact_seeds().await;
        }
    }

    /// Local discovery cadence: fast until a peer appears, then slow.
    async fn run_local_discovery(self: Arc<Self>) {
        let mut shutdown = self.shutdown_rx.clone();
        loop {
            let mut announcement = self.own_announcement(true).await;
            announcement.find_self = true;
            self.networks
                .send_discovery(&self.identity, Command::LocalDiscovery as u8, &announcement.encode())
                .await;

            let interval = if self.peers.connected_count().await >= 1 {
                bootstrap::DISCOVERY_INTERVAL_SETTLED
            } else {
                bootstrap::DISCOVERY_INTERVAL_SEARCHING
            };
            tokio::select! {
                _ = shutdown.changed() => { if *shutdown.borrow() { return; } }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Housekeeping: connection state machine, pings, table expiry.
    async fn run_maintenance(self: Arc<Self>) {
        let mut shutdown = self.shutdown_rx.clone();
        let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
        let mut sweep_counter = 0u32;
        loop {
            tokio::select! {
                _ = shutdown.changed() => { if *shutdown.borrow() { return; } }
                _ = interval.tick() => {}
            }

            for peer in self.peers.snapshot().await {
                let pings = peer.maintain().await;
                for ping in pings {
                    let _ = self
                        .networks
                        .send_all_networks(
                            &self.identity,
                            &self.sequences,
                            &peer.public_key,
                            Command::Ping as u8,
                            &[],
                            SequenceSpec::PerSocket {
                                payload: SequencePayload::None,
                                timeout: REPLY_TIMEOUT,
                                bidirectional: false,
                            },
                            ping.remote,
                        )
                        .await;
                    (self.filters.message_out_ping)(&peer.peer_id);
                }
                // Peers that lost every connection leave the routing table.
                if peer.connection_count().await == 0 {
                    self.dht.remove(&peer.node_id).await;
                }
            }

            self.sequences.expire().await;
            self.lites.expire().await;

            sweep_counter += 1;
            if sweep_counter % 60 == 0 {
                self.recent_contacts.sweep().await;
                let mut index = self.storage_index.lock().await;
                for entries in index.values_mut() {
                    entries.retain(|(_, at)| at.elapsed() < STORAGE_INDEX_TTL);
                }
                index.retain(|_, entries| !entries.is_empty());
            }
        }
    }

    /// Bucket refresh: thin buckets every 5 minutes, a broad sweep hourly.
    async fn run_bucket_refresh(self: Arc<Self>) {
        let mut shutdown = self.shutdown_rx.clone();
        let mut refresh = tokio::time::interval(BUCKET_REFRESH_INTERVAL);
        refresh.tick().await; // skip the immediate tick
        let mut last_full = Instant::now();
        loop {
            tokio::select! {
                _ = shutdown.changed() => { if *shutdown.borrow() { return; } }
                _ = refresh.tick() => {}
            }
            if self.dht.is_empty().await {
                continue;
            }

            let full = last_full.elapsed() >= FULL_REFRESH_INTERVAL;
            let threshold = if full { crate::dht::BUCKET_SIZE } else { DHT_ALPHA };
            if full {
                last_full = Instant::now();
            }

            let candidates = self.dht.buckets_below(threshold).await;
            // Only refresh near the occupied region of the table; an almost
            // empty table would otherwise fire hundreds of no-op searches.
            for index in candidates.into_iter().rev().take(8) {
                let target = self.dht.random_id_in_bucket(index);
                let client = self
                    .async_search(SearchAction::FindNode, target, SearchConfig::default())
                    .await;
                let _ = client.result().await;
            }
        }
    }
}

/// Search legs ride announcements with FIND_PEER / FIND_VALUE actions.
struct BackendSearchTransport {
    backend: Weak<Backend>,
}

impl SearchTransport<Arc<PeerInfo>> for BackendSearchTransport {
    fn request(&self, contact: &Arc<PeerInfo>, action: SearchAction, target: NodeId, handle: u64) {
        let Some(backend) = self.backend.upgrade() else {
            return;
        };
        let contact = contact.clone();
        tokio::spawn(async move {
            let mut announcement = backend.own_announcement(false).await;
            match action {
                SearchAction::FindNode => announcement.find_peer.push(target),
                SearchAction::FindValue => announcement.find_value.push(target),
            }
            let payload = announcement.encode();
            let _ = backend
                .send_command(
                    &contact,
                    Command::Announcement,
                    &payload,
                    SequenceSpec::PerSocket {
                        payload: SequencePayload::InformationRequest(handle),
                        timeout: REPLY_TIMEOUT,
                        bidirectional: false,
                    },
                )
                .await;
            (backend.filters.message_out_announcement)(&contact.peer_id, &announcement);
        });
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("peer_id", &hex::encode(self.identity.peer_id()))
            .finish_non_exhaustive()
    }
}
