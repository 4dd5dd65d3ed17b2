//! Iterative FIND_NODE / FIND_VALUE search
//!
//! A search keeps a distance-sorted shortlist and holds at most alpha
//! information requests in flight. Responses are streamed: one request may
//! answer across several packets, the last flagged by the sender. The search
//! ends when the k closest known contacts have all been queried, when the
//! value arrives, or when the total timeout elapses; a per-leg timeout bounds
//! each request independently.

use super::NodeContact;
use crate::types::{xor_distance, NodeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchAction {
    FindNode,
    FindValue,
}

#[derive(Debug, Clone, Copy)]
pub struct SearchConfig {
    /// Parallel in-flight information requests.
    pub alpha: usize,
    /// Result set size and query horizon.
    pub k: usize,
    /// Total time allowed for the search.
    pub timeout: Duration,
    /// Time allowed per information request.
    pub per_leg_timeout: Duration,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            alpha: 5,
            k: super::BUCKET_SIZE,
            timeout: Duration::from_secs(10),
            per_leg_timeout: Duration::from_secs(3),
        }
    }
}

/// Wire-agnostic transport for search legs. Implementations fire the request
/// and route streamed responses back through the registry under `handle`.
pub trait SearchTransport<C>: Send + Sync {
    fn request(&self, contact: &C, action: SearchAction, target: NodeId, handle: u64);
}

/// One streamed slice of a response to an information request.
#[derive(Debug, Clone)]
pub struct SearchUpdate<C> {
    pub from: NodeId,
    pub contacts: Vec<C>,
    pub value: Option<Vec<u8>>,
    /// The sender marked this as its final slice for the queried hash.
    pub last: bool,
}

/// Routes streamed response slices to the search that requested them.
pub struct SearchRegistry<C> {
    next_handle: AtomicU64,
    active: Mutex<HashMap<u64, mpsc::Sender<SearchUpdate<C>>>>,
}

impl<C: Send + 'static> SearchRegistry<C> {
    pub fn new() -> Self {
        Self { next_handle: AtomicU64::new(1), active: Mutex::new(HashMap::new()) }
    }

    pub async fn allocate(&self) -> (u64, mpsc::Receiver<SearchUpdate<C>>) {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(64);
        self.active.lock().await.insert(handle, tx);
        (handle, rx)
    }

    /// Deliver a response slice; false when the search is gone.
    pub async fn deliver(&self, handle: u64, update: SearchUpdate<C>) -> bool {
        let active = self.active.lock().await;
        match active.get(&handle) {
            Some(tx) => tx.try_send(update).is_ok(),
            None => false,
        }
    }

    pub async fn release(&self, handle: u64) {
        self.active.lock().await.remove(&handle);
    }
}

impl<C: Send + 'static> Default for SearchRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchTermination {
    ValueFound,
    Exhausted,
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct SearchResult<C> {
    /// Up to k closest responsive contacts, distance-sorted.
    pub closest: Vec<C>,
    pub value: Option<Vec<u8>>,
    /// Who supplied the value, when one was found.
    pub value_from: Option<NodeId>,
    pub termination: SearchTermination,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LegState {
    New,
    InFlight,
    Responded,
    Failed,
}

struct Entry<C> {
    contact: C,
    id: NodeId,
    state: LegState,
    deadline: Option<Instant>,
}

/// Run one iterative search to completion.
pub async fn iterative_search<C, T>(
    transport: &T,
    registry: &SearchRegistry<C>,
    seeds: Vec<C>,
    action: SearchAction,
    target: NodeId,
    config: SearchConfig,
) -> SearchResult<C>
where
    C: NodeContact,
    T: SearchTransport<C> + ?Sized,
{
    let (handle, mut rx) = registry.allocate().await;
    let deadline = Instant::now() + config.timeout;

    let mut shortlist: Vec<Entry<C>> = Vec::new();
    for contact in seeds {
        merge_contact(&mut shortlist, contact, &target);
    }

    let mut value = None;
    let mut value_from = None;
    let termination = loop {
        // Fail legs that ran past their own deadline.
        let now = Instant::now();
        for entry in shortlist.iter_mut() {
            if entry.state == LegState::InFlight
                && entry.deadline.map(|d| now > d).unwrap_or(false)
            {
                entry.state = LegState::Failed;
            }
        }

        // Keep alpha requests in flight across the k-closest horizon.
        let in_flight = shortlist
            .iter()
            .filter(|e| e.state == LegState::InFlight)
            .count();
        if in_flight < config.alpha {
            let mut to_launch = config.alpha - in_flight;
            for entry in shortlist.iter_mut().take(config.k) {
                if to_launch == 0 {
                    break;
                }
                if entry.state == LegState::New {
                    entry.state = LegState::InFlight;
                    entry.deadline = Some(Instant::now() + config.per_leg_timeout);
                    transport.request(&entry.contact, action, target, handle);
                    to_launch -= 1;
                }
            }
        }

        let still_in_flight = shortlist
            .iter()
            .filter(|e| e.state == LegState::InFlight)
            .count();
        let unqueried = shortlist
            .iter()
            .take(config.k)
            .filter(|e| e.state == LegState::New)
            .count();
        if still_in_flight == 0 && unqueried == 0 {
            break SearchTermination::Exhausted;
        }
        if Instant::now() > deadline {
            break SearchTermination::TimedOut;
        }

        let tick = Duration::from_millis(50);
        match tokio::time::timeout(tick, rx.recv()).await {
            Ok(Some(update)) => {
                if let Some(entry) = shortlist.iter_mut().find(|e| e.id == update.from) {
                    if update.last {
                        entry.state = LegState::Responded;
                        entry.deadline = None;
                    }
                }
                for contact in update.contacts {
                    merge_contact(&mut shortlist, contact, &target);
                }
                if action == SearchAction::FindValue {
                    if let Some(found) = update.value {
                        value = Some(found);
                        value_from = Some(update.from);
                        break SearchTermination::ValueFound;
                    }
                }
            }
            Ok(None) => break SearchTermination::TimedOut,
            Err(_) => {} // tick elapsed; loop re-checks deadlines
        }
    };

    registry.release(handle).await;
    debug!(?termination, "search finished");

    let closest = shortlist
        .iter()
        .filter(|e| e.state == LegState::Responded)
        .take(config.k)
        .map(|e| e.contact.clone())
        .collect();
    SearchResult { closest, value, value_from, termination }
}

fn merge_contact<C: NodeContact>(shortlist: &mut Vec<Entry<C>>, contact: C, target: &NodeId) {
    let id = contact.node_id();
    if shortlist.iter().any(|e| e.id == id) {
        return;
    }
    shortlist.push(Entry { contact, id, state: LegState::New, deadline: None });
    shortlist.sort_by(|a, b| xor_distance(&a.id, target).cmp(&xor_distance(&b.id, target)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use std::sync::Arc;

    #[derive(Clone)]
    struct TestContact {
        id: NodeId,
    }

    impl NodeContact for TestContact {
        fn node_id(&self) -> NodeId {
            self.id
        }
        fn rtt(&self) -> Option<Duration> {
            None
        }
    }

    fn cid(seed: u8) -> NodeId {
        crate::crypto::hash(&[seed])
    }

    /// In-memory network: each node knows some other nodes and possibly
    /// holds the value.
    struct TestNet {
        registry: Arc<SearchRegistry<TestContact>>,
        topology: StdHashMap<NodeId, Vec<NodeId>>,
        value_holder: Option<NodeId>,
    }

    impl SearchTransport<TestContact> for TestNet {
        fn request(
            &self,
            contact: &TestContact,
            action: SearchAction,
            _target: NodeId,
            handle: u64,
        ) {
            let from = contact.id;
            let known = self.topology.get(&from).cloned().unwrap_or_default();
            let value = if action == SearchAction::FindValue && self.value_holder == Some(from)
            {
                Some(b"the value".to_vec())
            } else {
                None
            };
            let registry = self.registry.clone();
            tokio::spawn(async move {
                let update = SearchUpdate {
                    from,
                    contacts: known.into_iter().map(|id| TestContact { id }).collect(),
                    value,
                    last: true,
                };
                registry.deliver(handle, update).await;
            });
        }
    }

    fn quick_config() -> SearchConfig {
        SearchConfig {
            alpha: 3,
            k: 20,
            timeout: Duration::from_secs(2),
            per_leg_timeout: Duration::from_millis(300),
        }
    }

    #[tokio::test]
    async fn search_walks_the_topology() {
        let registry = Arc::new(SearchRegistry::new());
        // 1 knows 2 and 3; 2 knows 4; nobody else answers.
        let mut topology = StdHashMap::new();
        topology.insert(cid(1), vec![cid(2), cid(3)]);
        topology.insert(cid(2), vec![cid(4)]);
        topology.insert(cid(3), vec![]);
        topology.insert(cid(4), vec![]);
        let net = TestNet { registry: registry.clone(), topology, value_holder: None };

        let result = iterative_search(
            &net,
            &registry,
            vec![TestContact { id: cid(1) }],
            SearchAction::FindNode,
            cid(4),
            quick_config(),
        )
        .await;

        assert_eq!(result.termination, SearchTermination::Exhausted);
        let ids: Vec<_> = result.closest.iter().map(|c| c.id).collect();
        assert!(ids.contains(&cid(4)));
        assert!(ids.contains(&cid(1)));
    }

    #[tokio::test]
    async fn find_value_terminates_early() {
        let registry = Arc::new(SearchRegistry::new());
        let mut topology = StdHashMap::new();
        topology.insert(cid(1), vec![cid(2)]);
        topology.insert(cid(2), vec![]);
        let net = TestNet {
            registry: registry.clone(),
            topology,
            value_holder: Some(cid(2)),
        };

        let result = iterative_search(
            &net,
            &registry,
            vec![TestContact { id: cid(1) }],
            SearchAction::FindValue,
            cid(2),
            quick_config(),
        )
        .await;

        assert_eq!(result.termination, SearchTermination::ValueFound);
        assert_eq!(result.value.unwrap(), b"the value");
    }

    #[tokio::test]
    async fn dead_end_seed_exhausts() {
        let registry = Arc::new(SearchRegistry::new());
        // Seed answers with zero contacts; nothing further to query.
        let net = TestNet {
            registry: registry.clone(),
            topology: StdHashMap::new(),
            value_holder: None,
        };
        let result = iterative_search(
            &net,
            &registry,
            vec![TestContact { id: cid(1) }],
            SearchAction::FindNode,
            cid(9),
            quick_config(),
        )
        .await;
        assert_eq!(result.termination, SearchTermination::Exhausted);
    }

    #[tokio::test]
    async fn closeness_invariant_holds() {
        let registry = Arc::new(SearchRegistry::new());
        let mut topology = StdHashMap::new();
        let all: Vec<NodeId> = (1..30u8).map(cid).collect();
        for id in &all {
            topology.insert(*id, all.clone());
        }
        let net = TestNet { registry: registry.clone(), topology, value_holder: None };
        let target = cid(200);

        let result = iterative_search(
            &net,
            &registry,
            vec![TestContact { id: cid(1) }],
            SearchAction::FindNode,
            target,
            quick_config(),
        )
        .await;

        // No returned node is farther than any known-but-unreturned node
        // would allow: the result is the distance-sorted head of everything
        // reachable.
        let mut sorted = all.clone();
        sorted.sort_by(|a, b| xor_distance(a, &target).cmp(&xor_distance(b, &target)));
        let expect: Vec<_> = sorted.into_iter().take(result.closest.len()).collect();
        let got: Vec<_> = result.closest.iter().map(|c| c.id).collect();
        assert_eq!(got, expect);
    }

    #[tokio::test]
    async fn registry_drops_unknown_handles() {
        let registry: SearchRegistry<TestContact> = SearchRegistry::new();
        let delivered = registry
            .deliver(
                999,
                SearchUpdate { from: cid(1), contacts: vec![], value: None, last: true },
            )
            .await;
        assert!(!delivered);
    }
}
