//! Lite router: correlation for high-throughput data packets
//!
//! Streams allocate a random 16-byte ID per direction. Inbound packets with a
//! known lite ID are handed to the virtual stream's channel without touching
//! the per-peer sequence table, keeping the hot data path off that lock.

use super::message::TransferControl;
use crate::types::{LiteId, PeerId};
use rand::RngCore;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// Idle expiry for embedded stream lite records.
pub const LITE_IDLE_STREAM: Duration = Duration::from_secs(10);

/// Idle expiry for file-transfer lite records.
pub const LITE_IDLE_FILE_TRANSFER: Duration = Duration::from_secs(60);

/// Inbound channel depth per stream. Excess packets are dropped; the embedded
/// reliable-stream protocol retransmits.
const STREAM_CHANNEL_CAPACITY: usize = 512;

/// What the router delivers to a virtual stream endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Payload bytes from an Active frame.
    Data(Vec<u8>),
    /// A control frame from the remote side.
    Control(TransferControl),
    /// The lite record idled out locally.
    Expired,
}

struct LiteRecord {
    peer_id: PeerId,
    sender: mpsc::Sender<StreamEvent>,
    idle: Duration,
    last_activity: Instant,
}

/// Lite-ID → virtual stream endpoint table.
#[derive(Default)]
pub struct LiteRouter {
    records: Mutex<HashMap<LiteId, LiteRecord>>,
}

pub fn new_lite_id() -> LiteId {
    let mut id = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut id);
    id
}

impl LiteRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stream endpoint. Returns the receiving half.
    pub async fn register(
        &self,
        id: LiteId,
        peer: &PeerId,
        idle: Duration,
    ) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let record = LiteRecord {
            peer_id: *peer,
            sender: tx,
            idle,
            last_activity: Instant::now(),
        };
        self.records.lock().await.insert(id, record);
        rx
    }

    /// Deliver an inbound event to the stream owning this lite ID.
    /// Rejects IDs bound to a different peer. Returns false when unknown.
    pub async fn deliver(&self, id: &LiteId, from: &PeerId, event: StreamEvent) -> bool {
        let mut records = self.records.lock().await;
        let Some(record) = records.get_mut(id) else {
            return false;
        };
        if record.peer_id != *from {
            debug!("lite id reuse from wrong peer, dropping");
            return false;
        }
        record.last_activity = Instant::now();
        if record.sender.try_send(event).is_err() {
            debug!("stream channel full, dropping packet");
        }
        true
    }

    pub async fn known(&self, id: &LiteId) -> bool {
        self.records.lock().await.contains_key(id)
    }

    pub async fn unregister(&self, id: &LiteId) {
        self.records.lock().await.remove(id);
    }

    /// Remove idle records, notifying their streams.
    pub async fn expire(&self) {
        let now = Instant::now();
        let mut records = self.records.lock().await;
        let expired: Vec<_> = records
            .iter()
            .filter(|(_, r)| now.duration_since(r.last_activity) > r.idle)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(record) = records.remove(&id) {
                let _ = record.sender.try_send(StreamEvent::Expired);
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(n: u8) -> PeerId {
        [n; 33]
    }

    #[tokio::test]
    async fn delivers_to_registered_stream() {
        let router = LiteRouter::new();
        let id = new_lite_id();
        let mut rx = router.register(id, &peer(1), LITE_IDLE_STREAM).await;

        assert!(router.deliver(&id, &peer(1), StreamEvent::Data(vec![1, 2])).await);
        assert_eq!(rx.recv().await.unwrap(), StreamEvent::Data(vec![1, 2]));
    }

    #[tokio::test]
    async fn unknown_id_not_delivered() {
        let router = LiteRouter::new();
        assert!(!router.deliver(&new_lite_id(), &peer(1), StreamEvent::Data(vec![])).await);
    }

    #[tokio::test]
    async fn wrong_peer_rejected() {
        let router = LiteRouter::new();
        let id = new_lite_id();
        let _rx = router.register(id, &peer(1), LITE_IDLE_STREAM).await;
        assert!(!router.deliver(&id, &peer(2), StreamEvent::Data(vec![])).await);
    }

    #[tokio::test]
    async fn idle_records_expire_with_notice() {
        let router = LiteRouter::new();
        let id = new_lite_id();
        let mut rx = router.register(id, &peer(1), Duration::from_millis(0)).await;

        tokio::time::sleep(Duration::from_millis(5)).await;
        router.expire().await;

        assert_eq!(rx.recv().await.unwrap(), StreamEvent::Expired);
        assert!(!router.known(&id).await);
    }

    #[tokio::test]
    async fn activity_defers_expiry() {
        let router = LiteRouter::new();
        let id = new_lite_id();
        let _rx = router.register(id, &peer(1), Duration::from_secs(10)).await;

        router.deliver(&id, &peer(1), StreamEvent::Data(vec![])).await;
        router.expire().await;
        assert!(router.known(&id).await);
    }
}
