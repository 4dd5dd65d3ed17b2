//! k-bucket routing table
//!
//! Buckets are indexed by the shared-prefix length with the local node ID and
//! hold up to BUCKET_SIZE records ordered by recency. When a bucket is full,
//! the caller-supplied eviction policy decides whether the stalest record
//! makes way for the candidate; the default favours lower RTT.

use super::NodeContact;
use crate::types::{shared_prefix_len, xor_distance, NodeId};
use rand::Rng;
use std::time::Instant;
use tokio::sync::RwLock;

/// Records per bucket (Kademlia k).
pub const BUCKET_SIZE: usize = 20;

/// A stored contact with recency bookkeeping.
#[derive(Debug, Clone)]
pub struct Node<C> {
    pub id: NodeId,
    pub contact: C,
    pub last_seen: Instant,
}

/// Eviction policy: return true to replace `old` with `new`.
pub type ShouldEvict<C> = Box<dyn Fn(&Node<C>, &Node<C>) -> bool + Send + Sync>;

/// Default policy: a measured, lower RTT wins; an unmeasured incumbent loses
/// to a measured candidate.
fn default_should_evict<C: NodeContact>(old: &Node<C>, new: &Node<C>) -> bool {
    match (old.contact.rtt(), new.contact.rtt()) {
        (Some(old_rtt), Some(new_rtt)) => new_rtt < old_rtt,
        (None, Some(_)) => true,
        _ => false,
    }
}

pub struct RoutingTable<C> {
    self_id: NodeId,
    buckets: RwLock<Vec<Vec<Node<C>>>>,
    should_evict: ShouldEvict<C>,
}

impl<C: NodeContact> RoutingTable<C> {
    pub fn new(self_id: NodeId) -> Self {
        Self::with_eviction(self_id, Box::new(default_should_evict))
    }

    pub fn with_eviction(self_id: NodeId, should_evict: ShouldEvict<C>) -> Self {
        Self {
            self_id,
            buckets: RwLock::new((0..256).map(|_| Vec::new()).collect()),
            should_evict,
        }
    }

    pub fn self_id(&self) -> &NodeId {
        &self.self_id
    }

    fn bucket_index(&self, id: &NodeId) -> usize {
        shared_prefix_len(&self.self_id, id).min(255)
    }

    /// Insert or refresh a contact. Returns false when the bucket is full
    /// and the policy kept the incumbent.
    pub async fn upsert(&self, contact: C) -> bool {
        let id = contact.node_id();
        if id == self.self_id {
            return false;
        }
        let index = self.bucket_index(&id);
        let mut buckets = self.buckets.write().await;
        let bucket = &mut buckets[index];

        if let Some(pos) = bucket.iter().position(|n| n.id == id) {
            let mut node = bucket.remove(pos);
            node.last_seen = Instant::now();
            node.contact = contact;
            bucket.push(node);
            return true;
        }

        let node = Node { id, contact, last_seen: Instant::now() };
        if bucket.len() < BUCKET_SIZE {
            bucket.push(node);
            return true;
        }

        // Bucket full: the stalest record is the eviction candidate.
        let stalest = match bucket
            .iter()
            .enumerate()
            .min_by_key(|(_, n)| n.last_seen)
            .map(|(i, _)| i)
        {
            Some(i) => i,
            None => return false,
        };
        if (self.should_evict)(&bucket[stalest], &node) {
            bucket.remove(stalest);
            bucket.push(node);
            true
        } else {
            false
        }
    }

    pub async fn remove(&self, id: &NodeId) -> bool {
        let index = self.bucket_index(id);
        let mut buckets = self.buckets.write().await;
        let bucket = &mut buckets[index];
        let before = bucket.len();
        bucket.retain(|n| &n.id != id);
        bucket.len() != before
    }

    /// The `count` contacts closest to `target` by XOR distance.
    pub async fn closest(&self, target: &NodeId, count: usize) -> Vec<Node<C>> {
        let buckets = self.buckets.read().await;
        let mut all: Vec<&Node<C>> = buckets.iter().flatten().collect();
        all.sort_by(|a, b| xor_distance(&a.id, target).cmp(&xor_distance(&b.id, target)));
        all.into_iter().take(count).cloned().collect()
    }

    pub async fn contains(&self, id: &NodeId) -> bool {
        let index = self.bucket_index(id);
        self.buckets.read().await[index].iter().any(|n| &n.id == id)
    }

    pub async fn len(&self) -> usize {
        self.buckets.read().await.iter().map(|b| b.len()).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Indexes of non-empty-range buckets holding fewer than `threshold`
    /// contacts; candidates for refresh.
    pub async fn buckets_below(&self, threshold: usize) -> Vec<usize> {
        self.buckets
            .read()
            .await
            .iter()
            .enumerate()
            .filter(|(_, b)| b.len() < threshold)
            .map(|(i, _)| i)
            .collect()
    }

    /// A random ID falling into bucket `index`: shares exactly `index`
    /// prefix bits with the local ID.
    pub fn random_id_in_bucket(&self, index: usize) -> NodeId {
        let index = index.min(255);
        let mut id: NodeId = rand::thread_rng().gen();
        for bit in 0..index {
            let byte = bit / 8;
            let mask = 0x80u8 >> (bit % 8);
            id[byte] = (id[byte] & !mask) | (self.self_id[byte] & mask);
        }
        let byte = index / 8;
        let mask = 0x80u8 >> (index % 8);
        id[byte] = (id[byte] & !mask) | (!self.self_id[byte] & mask);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Clone)]
    struct TestContact {
        id: NodeId,
        rtt: Option<Duration>,
    }

    impl NodeContact for TestContact {
        fn node_id(&self) -> NodeId {
            self.id
        }
        fn rtt(&self) -> Option<Duration> {
            self.rtt
        }
    }

    fn contact(seed: u8, rtt_ms: Option<u64>) -> TestContact {
        TestContact {
            id: crate::crypto::hash(&[seed]),
            rtt: rtt_ms.map(Duration::from_millis),
        }
    }

    #[tokio::test]
    async fn upsert_and_lookup() {
        let table = RoutingTable::new([0u8; 32]);
        assert!(table.upsert(contact(1, None)).await);
        assert!(table.contains(&crypto_id(1)).await);
        assert_eq!(table.len().await, 1);
    }

    fn crypto_id(seed: u8) -> NodeId {
        crate::crypto::hash(&[seed])
    }

    #[tokio::test]
    async fn self_id_never_stored() {
        let self_id = crypto_id(9);
        let table = RoutingTable::new(self_id);
        let c = TestContact { id: self_id, rtt: None };
        assert!(!table.upsert(c).await);
        assert_eq!(table.len().await, 0);
    }

    #[tokio::test]
    async fn closest_is_distance_sorted() {
        let table = RoutingTable::new([0u8; 32]);
        for seed in 1..40u8 {
            table.upsert(contact(seed, None)).await;
        }
        let target = crypto_id(1);
        let closest = table.closest(&target, 5).await;
        assert_eq!(closest.len(), 5);
        assert_eq!(closest[0].id, target);
        for pair in closest.windows(2) {
            assert!(
                xor_distance(&pair[0].id, &target) <= xor_distance(&pair[1].id, &target)
            );
        }
    }

    #[tokio::test]
    async fn full_bucket_evicts_by_rtt() {
        // Self ID far from the generated contacts so they share bucket 0.
        let mut self_id = [0xffu8; 32];
        self_id[0] = 0xff;
        let table = RoutingTable::new(self_id);

        // Fill one bucket with slow contacts.
        let mut filled = 0;
        let mut seed = 0u16;
        while filled < BUCKET_SIZE {
            seed += 1;
            let c = TestContact {
                id: crate::crypto::hash(&seed.to_le_bytes()),
                rtt: Some(Duration::from_millis(500)),
            };
            if shared_prefix_len(&self_id, &c.id) == 0 && table.upsert(c).await {
                filled += 1;
            }
        }

        // A faster candidate in the same bucket displaces a slow one.
        loop {
            seed += 1;
            let c = TestContact {
                id: crate::crypto::hash(&seed.to_le_bytes()),
                rtt: Some(Duration::from_millis(5)),
            };
            if shared_prefix_len(&self_id, &c.id) == 0 {
                assert!(table.upsert(c).await);
                break;
            }
        }

        // A slower candidate is refused.
        loop {
            seed += 1;
            let c = TestContact {
                id: crate::crypto::hash(&seed.to_le_bytes()),
                rtt: Some(Duration::from_millis(900)),
            };
            if shared_prefix_len(&self_id, &c.id) == 0 {
                assert!(!table.upsert(c).await);
                break;
            }
        }
    }

    #[tokio::test]
    async fn random_id_lands_in_bucket() {
        let self_id = crypto_id(3);
        let table: RoutingTable<TestContact> = RoutingTable::new(self_id);
        for index in [0usize, 1, 7, 100, 255] {
            let id = table.random_id_in_bucket(index);
            assert_eq!(shared_prefix_len(&self_id, &id).min(255), index);
        }
    }
}
