//! Per-peer sequence correlation
//!
//! Every outbound request carries a 32-bit sequence from a per-peer counter
//! seeded randomly at first contact. A waiting record pairs the eventual
//! response with caller context and yields the round-trip time. Bi-directional
//! records survive their first match and accept peer-initiated reuse; they are
//! how the stream embedding keeps a long-lived exchange on one sequence.

use crate::types::{LiteId, PeerId};
use rand::Rng;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Default reply deadline for a waiting sequence.
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(20);

/// Caller context attached to a waiting sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequencePayload {
    /// Plain request, nothing to resume on reply.
    None,
    /// FIND_SELF issued during bootstrap; replies feed the peer list.
    BootstrapFindSelf,
    /// A DHT information request; the handle keys the running search.
    InformationRequest(u64),
    /// A virtual stream; replies reusing the sequence belong to it.
    Stream(LiteId),
}

/// Callback invoked when a sequence expires unanswered.
pub type TimeoutHook = Box<dyn FnOnce(SequencePayload) + Send>;

struct SequenceRecord {
    payload: SequencePayload,
    created: Instant,
    deadline: Instant,
    bidirectional: bool,
    replied: bool,
    on_timeout: Option<TimeoutHook>,
}

/// Result of matching an inbound message against the waiting table.
pub struct SequenceMatch {
    pub payload: SequencePayload,
    /// Set on the first matching response only.
    pub rtt: Option<Duration>,
}

/// The waiting-record table plus per-peer counters.
#[derive(Default)]
pub struct SequenceManager {
    counters: Mutex<HashMap<PeerId, u32>>,
    waiting: Mutex<HashMap<(PeerId, u32), SequenceRecord>>,
}

impl SequenceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next sequence number for the peer, seeding the counter randomly on
    /// first contact.
    async fn next_number(&self, peer: &PeerId) -> u32 {
        let mut counters = self.counters.lock().await;
        let counter = counters
            .entry(*peer)
            .or_insert_with(|| rand::thread_rng().gen());
        *counter = counter.wrapping_add(1);
        *counter
    }

    /// Allocate a sequence and store its waiting record.
    pub async fn new_sequence(
        &self,
        peer: &PeerId,
        payload: SequencePayload,
        timeout: Duration,
        bidirectional: bool,
        on_timeout: Option<TimeoutHook>,
    ) -> u32 {
        let number = self.next_number(peer).await;
        let now = Instant::now();
        let record = SequenceRecord {
            payload,
            created: now,
            deadline: now + timeout,
            bidirectional,
            replied: false,
            on_timeout,
        };
        self.waiting.lock().await.insert((*peer, number), record);
        number
    }

    /// Match an inbound message. Consumes the record unless bi-directional.
    /// Returns None for unsolicited sequences.
    pub async fn match_incoming(&self, peer: &PeerId, sequence: u32) -> Option<SequenceMatch> {
        let mut waiting = self.waiting.lock().await;
        let key = (*peer, sequence);
        let record = waiting.get_mut(&key)?;

        if Instant::now() > record.deadline {
            return None;
        }

        let rtt = if record.replied {
            None
        } else {
            record.replied = true;
            Some(record.created.elapsed())
        };
        let payload = record.payload.clone();

        if !record.bidirectional {
            waiting.remove(&key);
        }
        Some(SequenceMatch { payload, rtt })
    }

    /// Extend a bi-directional sequence's deadline while its stream is live.
    pub async fn touch(&self, peer: &PeerId, sequence: u32, timeout: Duration) {
        if let Some(record) = self.waiting.lock().await.get_mut(&(*peer, sequence)) {
            record.deadline = Instant::now() + timeout;
        }
    }

    /// Drop a sequence without firing its timeout hook.
    pub async fn remove(&self, peer: &PeerId, sequence: u32) {
        self.waiting.lock().await.remove(&(*peer, sequence));
    }

    /// Garbage-collect expired records, firing timeout hooks outside the lock.
    pub async fn expire(&self) {
        let now = Instant::now();
        let mut fired = Vec::new();
        {
            let mut waiting = self.waiting.lock().await;
            let expired: Vec<_> = waiting
                .iter()
                .filter(|(_, r)| now > r.deadline)
                .map(|(k, _)| *k)
                .collect();
            for key in expired {
                if let Some(mut record) = waiting.remove(&key) {
                    if let Some(hook) = record.on_timeout.take() {
                        fired.push((hook, record.payload));
                    }
                }
            }
        }
        for (hook, payload) in fired {
            hook(payload);
        }
    }

    pub async fn waiting_count(&self) -> usize {
        self.waiting.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn peer(n: u8) -> PeerId {
        [n; 33]
    }

    #[tokio::test]
    async fn sequences_increase_per_peer() {
        let mgr = SequenceManager::new();
        let a = mgr
            .new_sequence(&peer(1), SequencePayload::None, REPLY_TIMEOUT, false, None)
            .await;
        let b = mgr
            .new_sequence(&peer(1), SequencePayload::None, REPLY_TIMEOUT, false, None)
            .await;
        assert_eq!(b, a.wrapping_add(1));
    }

    #[tokio::test]
    async fn first_match_consumes_and_reports_rtt() {
        let mgr = SequenceManager::new();
        let seq = mgr
            .new_sequence(
                &peer(1),
                SequencePayload::BootstrapFindSelf,
                REPLY_TIMEOUT,
                false,
                None,
            )
            .await;
        let m = mgr.match_incoming(&peer(1), seq).await.unwrap();
        assert_eq!(m.payload, SequencePayload::BootstrapFindSelf);
        assert!(m.rtt.is_some());
        assert!(mgr.match_incoming(&peer(1), seq).await.is_none());
    }

    #[tokio::test]
    async fn unsolicited_sequence_is_none() {
        let mgr = SequenceManager::new();
        assert!(mgr.match_incoming(&peer(1), 42).await.is_none());
    }

    #[tokio::test]
    async fn wrong_peer_does_not_match() {
        let mgr = SequenceManager::new();
        let seq = mgr
            .new_sequence(&peer(1), SequencePayload::None, REPLY_TIMEOUT, false, None)
            .await;
        assert!(mgr.match_incoming(&peer(2), seq).await.is_none());
        assert!(mgr.match_incoming(&peer(1), seq).await.is_some());
    }

    #[tokio::test]
    async fn bidirectional_survives_matches_and_reports_rtt_once() {
        let mgr = SequenceManager::new();
        let seq = mgr
            .new_sequence(
                &peer(1),
                SequencePayload::Stream([7u8; 16]),
                REPLY_TIMEOUT,
                true,
                None,
            )
            .await;
        let first = mgr.match_incoming(&peer(1), seq).await.unwrap();
        assert!(first.rtt.is_some());
        let second = mgr.match_incoming(&peer(1), seq).await.unwrap();
        assert!(second.rtt.is_none());
        assert_eq!(second.payload, SequencePayload::Stream([7u8; 16]));
    }

    #[tokio::test]
    async fn expiry_fires_hook_and_removes() {
        let mgr = SequenceManager::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        mgr.new_sequence(
            &peer(3),
            SequencePayload::None,
            Duration::from_millis(0),
            false,
            Some(Box::new(move |_| fired2.store(true, Ordering::SeqCst))),
        )
        .await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        mgr.expire().await;
        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(mgr.waiting_count().await, 0);
    }

    #[tokio::test]
    async fn expired_record_does_not_match() {
        let mgr = SequenceManager::new();
        let seq = mgr
            .new_sequence(
                &peer(1),
                SequencePayload::None,
                Duration::from_millis(0),
                false,
                None,
            )
            .await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(mgr.match_incoming(&peer(1), seq).await.is_none());
    }
}
