//! Filament: the peer networking core of a signed file-metadata mesh
//!
//! Every participant owns a secp256k1 identity and publishes an append-only
//! signed chain of file metadata. This crate is the network: the UDP wire
//! protocol, the Kademlia DHT of node records, the peer and connection
//! lifecycle with NAT traversal, and the sequence/lite multiplexer that
//! carries reliable streams over datagrams. Storage engines, the search
//! index, and the reliable-stream internals are external collaborators
//! behind the traits in [`external`].

pub mod block;
pub mod config;
pub mod crypto;
pub mod dht;
pub mod external;
pub mod net;
pub mod types;

pub use block::{Block, BlockRecord, DecodedBlock, FileRecord};
pub use config::{Config, SeedPeer, EXIT_BLOCKCHAIN_CORRUPT, EXIT_INIT_FAILURE};
pub use crypto::{CryptoError, Identity};
pub use net::{Backend, ChatEvent, Collaborators, Filters, InitError};
pub use types::{Hash, LiteId, NodeId, PeerId};
