//! Message codec: typed commands riding on the packet layer
//!
//! A message is a decoded packet plus the recovered sender key and, where
//! applicable, a sequence linking it to a prior outbound request. Command
//! numbers are stable wire values; gaps are reserved by retired commands.
//!
//! Any decode failure here is fatal for the packet, never for the
//! connection: the caller drops the packet and fires the error hook.

use crate::crypto;
use crate::types::{Hash, LiteId, PeerId};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use thiserror::Error;

/// Stable wire command numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Announcement = 0,
    Response = 1,
    Ping = 2,
    Pong = 3,
    LocalDiscovery = 4,
    Traverse = 5,
    GetBlock = 6,
    Transfer = 8,
    Chat = 10,
}

impl Command {
    pub fn from_u8(value: u8) -> Result<Self, MessageError> {
        Ok(match value {
            0 => Command::Announcement,
            1 => Command::Response,
            2 => Command::Ping,
            3 => Command::Pong,
            4 => Command::LocalDiscovery,
            5 => Command::Traverse,
            6 => Command::GetBlock,
            8 => Command::Transfer,
            10 => Command::Chat,
            other => return Err(MessageError::UnknownCommand(other)),
        })
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("payload truncated")]
    TooShort,
    #[error("bad length field")]
    BadLengthField,
    #[error("invalid utf-8")]
    BadUtf8,
    #[error("embedded file hash mismatch")]
    HashMismatch,
    #[error("unknown command {0}")]
    UnknownCommand(u8),
    #[error("bad public key field")]
    BadKey,
}

/// Bounds-checked little-endian reader over a payload slice.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], MessageError> {
        if self.data.len() - self.pos < n {
            return Err(MessageError::TooShort);
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn rest(&mut self) -> &'a [u8] {
        let out = &self.data[self.pos..];
        self.pos = self.data.len();
        out
    }

    fn u8(&mut self) -> Result<u8, MessageError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, MessageError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, MessageError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, MessageError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn hash(&mut self) -> Result<Hash, MessageError> {
        let mut out = [0u8; 32];
        out.copy_from_slice(self.take(32)?);
        Ok(out)
    }

    fn peer_id(&mut self) -> Result<PeerId, MessageError> {
        let mut out = [0u8; 33];
        out.copy_from_slice(self.take(33)?);
        Ok(out)
    }
}

fn encode_ip(addr: &IpAddr, out: &mut Vec<u8>) {
    let v6 = match addr {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => *v6,
    };
    out.extend_from_slice(&v6.octets());
}

fn decode_ip(bytes: &[u8]) -> IpAddr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(bytes);
    let v6 = Ipv6Addr::from(octets);
    match v6.to_ipv4_mapped() {
        Some(v4) => IpAddr::V4(v4),
        None => IpAddr::V6(v6),
    }
}

// =============================================================================
// ANNOUNCEMENT / RESPONSE
// =============================================================================

/// Shared header of Announcement and Response payloads: the fixed 16 bytes
/// (protocol, features, actions, height, block version, UA length), the UA,
/// then the sender's self-reported listening and forwarded ports. The ports
/// are what make a peer shareable; without them nobody could be told how to
/// reach the sender behind its observed endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageHeader {
    pub protocol: u8,
    pub features: u8,
    pub blockchain_height: u32,
    pub blockchain_version: u64,
    /// Required on the initial contact with a peer; may be empty afterwards.
    pub user_agent: String,
    /// Port the sender's socket listens on. 0 = undisclosed.
    pub internal_port: u16,
    /// Manually or UPnP-forwarded external port. 0 = none.
    pub external_port: u16,
}

impl MessageHeader {
    fn encode(&self, actions: u8, out: &mut Vec<u8>) {
        out.push(self.protocol);
        out.push(self.features);
        out.push(actions);
        out.extend_from_slice(&self.blockchain_height.to_le_bytes());
        out.extend_from_slice(&self.blockchain_version.to_le_bytes());
        let ua = self.user_agent.as_bytes();
        let ua_len = ua.len().min(u8::MAX as usize);
        out.push(ua_len as u8);
        out.extend_from_slice(&ua[..ua_len]);
        out.extend_from_slice(&self.internal_port.to_le_bytes());
        out.extend_from_slice(&self.external_port.to_le_bytes());
    }

    fn decode(r: &mut Reader) -> Result<(Self, u8), MessageError> {
        let protocol = r.u8()?;
        let features = r.u8()?;
        let actions = r.u8()?;
        let blockchain_height = r.u32()?;
        let blockchain_version = r.u64()?;
        let ua_len = r.u8()? as usize;
        let ua_bytes = r.take(ua_len)?;
        let user_agent = std::str::from_utf8(ua_bytes)
            .map_err(|_| MessageError::BadUtf8)?
            .to_string();
        let internal_port = r.u16()?;
        let external_port = r.u16()?;
        Ok((
            Self {
                protocol,
                features,
                blockchain_height,
                blockchain_version,
                user_agent,
                internal_port,
                external_port,
            },
            actions,
        ))
    }
}

/// Record advertised via INFO_STORE: data the sender claims to store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InfoStore {
    pub hash: Hash,
    pub size: u64,
    pub file_type: u8,
}

/// Announcement payload: presence plus optional DHT actions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Announcement {
    pub header: MessageHeader,
    pub find_self: bool,
    pub find_peer: Vec<Hash>,
    pub find_value: Vec<Hash>,
    pub info_store: Vec<InfoStore>,
}

impl Announcement {
    pub fn actions(&self) -> u8 {
        let mut actions = 0;
        if self.find_self {
            actions |= crate::types::ACTION_FIND_SELF;
        }
        if !self.find_peer.is_empty() {
            actions |= crate::types::ACTION_FIND_PEER;
        }
        if !self.find_value.is_empty() {
            actions |= crate::types::ACTION_FIND_VALUE;
        }
        if !self.info_store.is_empty() {
            actions |= crate::types::ACTION_INFO_STORE;
        }
        actions
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        self.header.encode(self.actions(), &mut out);

        for list in [&self.find_peer, &self.find_value] {
            if !list.is_empty() {
                out.extend_from_slice(&(list.len() as u16).to_le_bytes());
                for hash in list {
                    out.extend_from_slice(hash);
                }
            }
        }
        if !self.info_store.is_empty() {
            out.extend_from_slice(&(self.info_store.len() as u16).to_le_bytes());
            for record in &self.info_store {
                out.extend_from_slice(&record.hash);
                out.extend_from_slice(&record.size.to_le_bytes());
                out.push(record.file_type);
            }
        }
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self, MessageError> {
        let mut r = Reader::new(payload);
        let (header, actions) = MessageHeader::decode(&mut r)?;

        let mut announcement = Self {
            header,
            find_self: actions & crate::types::ACTION_FIND_SELF != 0,
            ..Default::default()
        };

        if actions & crate::types::ACTION_FIND_PEER != 0 {
            let count = r.u16()? as usize;
            for _ in 0..count {
                announcement.find_peer.push(r.hash()?);
            }
        }
        if actions & crate::types::ACTION_FIND_VALUE != 0 {
            let count = r.u16()? as usize;
            for _ in 0..count {
                announcement.find_value.push(r.hash()?);
            }
        }
        if actions & crate::types::ACTION_INFO_STORE != 0 {
            let count = r.u16()? as usize;
            for _ in 0..count {
                let hash = r.hash()?;
                let size = r.u64()?;
                let file_type = r.u8()?;
                announcement.info_store.push(InfoStore { hash, size, file_type });
            }
        }
        Ok(announcement)
    }
}

/// Why a peer appears in a response record.
pub const PEER_REASON_CLOSEST: u8 = 0;
pub const PEER_REASON_STORING: u8 = 1;

/// One shared peer inside a Hash2Peer group. 56 bytes on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub addr: SocketAddr,
    pub last_contact_secs: u32,
    pub reason: u8,
}

pub const PEER_RECORD_SIZE: usize = 33 + 16 + 2 + 4 + 1;

/// Peers answering one queried hash. `last` marks the end of the streamed
/// results for that hash (top bit of the wire count).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hash2Peer {
    pub hash: Hash,
    pub peers: Vec<PeerRecord>,
    pub last: bool,
}

/// File bytes answered inline for a FIND_VALUE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddedFile {
    pub hash: Hash,
    pub data: Vec<u8>,
}

/// Room for one embedded file after the response header and counts.
pub const EMBEDDED_FILE_SIZE_MAX: usize =
    super::packet::PAYLOAD_MAX - 16 - 255 - 6 - 32 - 4;

/// Response payload: answers to announcement actions, streamable across
/// multiple packets bearing the same sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    pub header: MessageHeader,
    pub hash2peers: Vec<Hash2Peer>,
    pub files_embed: Vec<EmbeddedFile>,
    pub hashes_not_found: Vec<Hash>,
}

impl Response {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        self.header.encode(0, &mut out);

        out.extend_from_slice(&(self.hash2peers.len() as u16).to_le_bytes());
        out.extend_from_slice(&(self.files_embed.len() as u16).to_le_bytes());
        out.extend_from_slice(&(self.hashes_not_found.len() as u16).to_le_bytes());

        for group in &self.hash2peers {
            out.extend_from_slice(&group.hash);
            let mut count = group.peers.len() as u16;
            if group.last {
                count |= 0x8000;
            }
            out.extend_from_slice(&count.to_le_bytes());
            for peer in &group.peers {
                out.extend_from_slice(&peer.peer_id);
                encode_ip(&peer.addr.ip(), &mut out);
                out.extend_from_slice(&peer.addr.port().to_le_bytes());
                out.extend_from_slice(&peer.last_contact_secs.to_le_bytes());
                out.push(peer.reason);
            }
        }
        for file in &self.files_embed {
            out.extend_from_slice(&file.hash);
            out.extend_from_slice(&(file.data.len() as u32).to_le_bytes());
            out.extend_from_slice(&file.data);
        }
        for hash in &self.hashes_not_found {
            out.extend_from_slice(hash);
        }
        out
    }

    /// Decode and verify. Embedded files are re-hashed; a mismatch rejects
    /// the whole payload.
    pub fn decode(payload: &[u8]) -> Result<Self, MessageError> {
        let mut r = Reader::new(payload);
        let (header, _) = MessageHeader::decode(&mut r)?;

        let group_count = r.u16()? as usize;
        let file_count = r.u16()? as usize;
        let not_found_count = r.u16()? as usize;

        let mut response = Self { header, ..Default::default() };

        for _ in 0..group_count {
            let hash = r.hash()?;
            let raw_count = r.u16()?;
            let last = raw_count & 0x8000 != 0;
            let count = (raw_count & 0x7fff) as usize;
            let mut peers = Vec::with_capacity(count);
            for _ in 0..count {
                let peer_id = r.peer_id()?;
                let ip = decode_ip(r.take(16)?);
                let port = r.u16()?;
                let last_contact_secs = r.u32()?;
                let reason = r.u8()?;
                peers.push(PeerRecord {
                    peer_id,
                    addr: SocketAddr::new(ip, port),
                    last_contact_secs,
                    reason,
                });
            }
            response.hash2peers.push(Hash2Peer { hash, peers, last });
        }
        for _ in 0..file_count {
            let hash = r.hash()?;
            let size = r.u32()? as usize;
            let data = r.take(size)?.to_vec();
            if crypto::hash(&data) != hash {
                return Err(MessageError::HashMismatch);
            }
            response.files_embed.push(EmbeddedFile { hash, data });
        }
        for _ in 0..not_found_count {
            response.hashes_not_found.push(r.hash()?);
        }
        Ok(response)
    }
}

// =============================================================================
// TRAVERSE
// =============================================================================

/// Relayed, signed hole-punch coordination message.
///
/// The signer asks the authorized relay to hand the target an inner packet
/// (an announcement encrypted to the target). The relay writes the signer's
/// observed endpoint into the payload before forwarding so the target knows
/// where to answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Traverse {
    pub signer: PeerId,
    pub target: PeerId,
    pub authorized_relay: PeerId,
    /// Unix seconds after which the message must be discarded.
    pub expires: u64,
    /// Filled in by the relay: the signer's endpoint as the relay sees it.
    pub receiver_ip: IpAddr,
    pub receiver_port: u16,
    /// Inner packet, encrypted to the target.
    pub inner: Vec<u8>,
}

impl Traverse {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(125 + self.inner.len());
        out.extend_from_slice(&self.signer);
        out.extend_from_slice(&self.target);
        out.extend_from_slice(&self.authorized_relay);
        out.extend_from_slice(&self.expires.to_le_bytes());
        encode_ip(&self.receiver_ip, &mut out);
        out.extend_from_slice(&self.receiver_port.to_le_bytes());
        out.extend_from_slice(&self.inner);
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self, MessageError> {
        let mut r = Reader::new(payload);
        let signer = r.peer_id()?;
        let target = r.peer_id()?;
        let authorized_relay = r.peer_id()?;
        let expires = r.u64()?;
        let receiver_ip = decode_ip(r.take(16)?);
        let receiver_port = r.u16()?;
        let inner = r.rest().to_vec();
        Ok(Self {
            signer,
            target,
            authorized_relay,
            expires,
            receiver_ip,
            receiver_port,
            inner,
        })
    }
}

// =============================================================================
// GETBLOCK / TRANSFER
// =============================================================================

/// Control byte driving the stream state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransferControl {
    RequestStart = 0,
    Active = 1,
    Terminate = 2,
    NotAvailable = 3,
    Empty = 4,
}

impl TransferControl {
    pub fn from_u8(value: u8) -> Result<Self, MessageError> {
        Ok(match value {
            0 => TransferControl::RequestStart,
            1 => TransferControl::Active,
            2 => TransferControl::Terminate,
            3 => TransferControl::NotAvailable,
            4 => TransferControl::Empty,
            other => return Err(MessageError::UnknownCommand(other)),
        })
    }
}

/// File transfer type. Only whole-or-ranged file bytes today.
pub const TRANSFER_TYPE_FILE: u8 = 0;

/// Transfer command payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferFrame {
    pub control: TransferControl,
    pub transfer_type: u8,
    pub lite_id: LiteId,
    pub body: TransferBody,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferBody {
    /// RequestStart: which bytes of which file.
    Request { hash: Hash, offset: u64, limit: u64 },
    /// Active: a slice of the embedded stream.
    Data(Vec<u8>),
    /// Control-only frames.
    None,
}

impl TransferFrame {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.push(self.control as u8);
        out.push(self.transfer_type);
        out.extend_from_slice(&self.lite_id);
        match &self.body {
            TransferBody::Request { hash, offset, limit } => {
                out.extend_from_slice(hash);
                out.extend_from_slice(&offset.to_le_bytes());
                out.extend_from_slice(&limit.to_le_bytes());
            }
            TransferBody::Data(data) => out.extend_from_slice(data),
            TransferBody::None => {}
        }
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self, MessageError> {
        let mut r = Reader::new(payload);
        let control = TransferControl::from_u8(r.u8()?)?;
        let transfer_type = r.u8()?;
        let mut lite_id = [0u8; 16];
        lite_id.copy_from_slice(r.take(16)?);
        let body = match control {
            TransferControl::RequestStart => {
                let hash = r.hash()?;
                let offset = r.u64()?;
                let limit = r.u64()?;
                TransferBody::Request { hash, offset, limit }
            }
            TransferControl::Active => TransferBody::Data(r.rest().to_vec()),
            _ => TransferBody::None,
        };
        Ok(Self { control, transfer_type, lite_id, body })
    }
}

/// Requested block range of a remote blockchain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    pub offset: u64,
    pub limit: u64,
}

/// GetBlock command payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetBlockFrame {
    pub control: TransferControl,
    pub lite_id: LiteId,
    pub body: GetBlockBody,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetBlockBody {
    Request {
        owner: PeerId,
        max_block_size: u64,
        limit_blocks: u64,
        ranges: Vec<BlockRange>,
    },
    Data(Vec<u8>),
    None,
}

impl GetBlockFrame {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.push(self.control as u8);
        out.extend_from_slice(&self.lite_id);
        match &self.body {
            GetBlockBody::Request { owner, max_block_size, limit_blocks, ranges } => {
                out.extend_from_slice(owner);
                out.extend_from_slice(&max_block_size.to_le_bytes());
                out.extend_from_slice(&limit_blocks.to_le_bytes());
                out.extend_from_slice(&(ranges.len() as u16).to_le_bytes());
                for range in ranges {
                    out.extend_from_slice(&range.offset.to_le_bytes());
                    out.extend_from_slice(&range.limit.to_le_bytes());
                }
            }
            GetBlockBody::Data(data) => out.extend_from_slice(data),
            GetBlockBody::None => {}
        }
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self, MessageError> {
        let mut r = Reader::new(payload);
        let control = TransferControl::from_u8(r.u8()?)?;
        let mut lite_id = [0u8; 16];
        lite_id.copy_from_slice(r.take(16)?);
        let body = match control {
            TransferControl::RequestStart => {
                let owner = r.peer_id()?;
                let max_block_size = r.u64()?;
                let limit_blocks = r.u64()?;
                let count = r.u16()? as usize;
                let mut ranges = Vec::with_capacity(count);
                for _ in 0..count {
                    let offset = r.u64()?;
                    let limit = r.u64()?;
                    ranges.push(BlockRange { offset, limit });
                }
                GetBlockBody::Request { owner, max_block_size, limit_blocks, ranges }
            }
            TransferControl::Active => GetBlockBody::Data(r.rest().to_vec()),
            _ => GetBlockBody::None,
        };
        Ok(Self { control, lite_id, body })
    }
}

// =============================================================================
// CHAT
// =============================================================================

/// Decode a Chat payload. UTF-8 only.
pub fn decode_chat(payload: &[u8]) -> Result<String, MessageError> {
    std::str::from_utf8(payload)
        .map(|s| s.to_string())
        .map_err(|_| MessageError::BadUtf8)
}
