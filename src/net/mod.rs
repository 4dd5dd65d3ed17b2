//! Peer networking stack

pub mod backend;
pub mod bootstrap;
pub mod filters;
pub mod lite;
pub mod message;
pub mod networks;
pub mod packet;
pub mod peer;
pub mod peerlist;
pub mod sequence;
pub mod stream;
pub mod traverse;

// Re-exports
pub use backend::{Backend, ChatEvent, Collaborators, DataFound, InitError, SearchClient};
pub use bootstrap::{parse_seed_list, RecentContacts, SeedContact};
pub use filters::Filters;
pub use lite::{new_lite_id, LiteRouter, StreamEvent, LITE_IDLE_FILE_TRANSFER, LITE_IDLE_STREAM};
pub use message::{
    Announcement, BlockRange, Command, EmbeddedFile, GetBlockBody, GetBlockFrame, Hash2Peer,
    InfoStore, MessageError, MessageHeader, PeerRecord, Response, TransferBody, TransferControl,
    TransferFrame, Traverse, PEER_REASON_CLOSEST, PEER_REASON_STORING,
};
pub use networks::{
    InboundDatagram, NetError, NetworkSet, SequenceSpec, DEFAULT_LISTEN_PORT, DISCOVERY_PORT,
    MULTICAST_GROUP_IPV6,
};
pub use packet::{PacketError, PacketRaw, PACKET_LENGTH_MIN, PAYLOAD_MAX, UDP_MAX_PACKET_SIZE};
pub use peer::{Connection, ConnectionStatus, PeerInfo};
pub use peerlist::{Blacklist, BlacklistEntry, PeerList};
pub use sequence::{SequenceManager, SequencePayload, REPLY_TIMEOUT};
pub use stream::{
    BlockStreamRecord, StreamError, VirtualPacketConn, STREAM_REASON_EMPTY,
    STREAM_REASON_EXPIRED, STREAM_REASON_LOCAL_CLOSE, STREAM_REASON_NOT_AVAILABLE,
    STREAM_REASON_REMOTE_TERMINATE, TRANSFER_MAX_EMBED_SIZE_LITE,
};
pub use traverse::{TraverseError, TRAVERSE_EXPIRATION_SECS};
