//! Kademlia-style DHT over node records
//!
//! The table and search are generic over a contact type so the routing logic
//! never reaches into peer internals: a contact exposes its node ID and a
//! cached round-trip time, and the transport trait turns search legs into
//! wire requests. The backend instantiates both with real peers; tests run
//! them against in-memory transports.

pub mod search;
pub mod table;

pub use search::{
    iterative_search, SearchAction, SearchConfig, SearchRegistry, SearchResult, SearchTermination,
    SearchTransport, SearchUpdate,
};
pub use table::{Node, RoutingTable, BUCKET_SIZE};

use crate::types::NodeId;
use std::time::Duration;

/// Capability surface the DHT needs from a node record.
pub trait NodeContact: Clone + Send + Sync + 'static {
    fn node_id(&self) -> NodeId;
    /// Best known round-trip time, if any response was ever measured.
    fn rtt(&self) -> Option<Duration>;
}
