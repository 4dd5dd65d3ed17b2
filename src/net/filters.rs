//! Caller-supplied observability hooks
//!
//! Every hook defaults to a no-op. Hooks run inline on the networking tasks
//! and must not block; anything slow belongs on a caller-managed worker fed
//! from the hook.

use super::message::{Announcement, Command, Response, Traverse};
use crate::types::PeerId;
use std::net::SocketAddr;

type PeerHook = Box<dyn Fn(&PeerId) + Send + Sync>;
type ConnectionHook = Box<dyn Fn(&PeerId, &SocketAddr) + Send + Sync>;
type PacketHook = Box<dyn Fn(&SocketAddr, u8, usize) + Send + Sync>;
type MessageInHook = Box<dyn Fn(&PeerId, Command) + Send + Sync>;
type AnnouncementHook = Box<dyn Fn(&PeerId, &Announcement) + Send + Sync>;
type ResponseHook = Box<dyn Fn(&PeerId, &Response) + Send + Sync>;
type TraverseHook = Box<dyn Fn(&PeerId, &Traverse) + Send + Sync>;
type ErrorHook = Box<dyn Fn(&str, &str) + Send + Sync>;
type SearchStatusHook = Box<dyn Fn(u64, &str) + Send + Sync>;
type CacheStatsHook = Box<dyn Fn(&PeerId, u32, u64) + Send + Sync>;

pub struct Filters {
    pub new_peer: PeerHook,
    pub new_peer_connection: ConnectionHook,
    /// A decoded request (announcement or stream open) from any peer.
    pub incoming_request: MessageInHook,
    pub packet_in: PacketHook,
    pub packet_out: PacketHook,
    pub message_in: MessageInHook,
    pub message_out_announcement: AnnouncementHook,
    pub message_out_response: ResponseHook,
    pub message_out_traverse: TraverseHook,
    pub message_out_ping: PeerHook,
    pub message_out_pong: PeerHook,
    /// (context, error text); fired for every locally-recovered error.
    pub log_error: ErrorHook,
    pub dht_search_status: SearchStatusHook,
    /// Blockchain-cache statistics update: (peer, height, version).
    pub blockchain_cache_statistics: CacheStatsHook,
    pub blockchain_cache_delete: PeerHook,
}

impl Default for Filters {
    fn default() -> Self {
        Self {
            new_peer: Box::new(|_| {}),
            new_peer_connection: Box::new(|_, _| {}),
            incoming_request: Box::new(|_, _| {}),
            packet_in: Box::new(|_, _, _| {}),
            packet_out: Box::new(|_, _, _| {}),
            message_in: Box::new(|_, _| {}),
            message_out_announcement: Box::new(|_, _| {}),
            message_out_response: Box::new(|_, _| {}),
            message_out_traverse: Box::new(|_, _| {}),
            message_out_ping: Box::new(|_| {}),
            message_out_pong: Box::new(|_| {}),
            log_error: Box::new(|_, _| {}),
            dht_search_status: Box::new(|_, _| {}),
            blockchain_cache_statistics: Box::new(|_, _, _| {}),
            blockchain_cache_delete: Box::new(|_| {}),
        }
    }
}

impl std::fmt::Debug for Filters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Filters { .. }")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn hooks_are_replaceable() {
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let filters = Filters {
            log_error: Box::new(move |_, _| {
                count2.fetch_add(1, Ordering::SeqCst);
            }),
            ..Default::default()
        };
        (filters.log_error)("packet", "too short");
        (filters.log_error)("packet", "bad signature");
        assert_eq!(count.load(Ordering::SeqCst), 2);

        // Defaults are callable no-ops.
        (filters.new_peer)(&[0u8; 33]);
        (filters.message_in)(&[0u8; 33], Command::Ping);
    }
}
