//! Bootstrap: seed contact cadence and FIND_SELF result vetting
//!
//! Phase 1 hammers the seed list every few seconds until enough root peers
//! answer; phase 2 slows to a trickle. Local discovery broadcasts run their
//! own cadence. Returned close-peers from FIND_SELF are quality-checked and
//! rate-limited through a recent-contacts cache so a hostile response cannot
//! turn the node into an amplifier.

use super::message::PeerRecord;
use crate::config::SeedPeer;
use crate::crypto;
use crate::types::PeerId;
use secp256k1::PublicKey;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::warn;

// =============================================================================
// CADENCE
// =============================================================================

/// Phase 1: contact every seed at this interval...
pub const PHASE1_INTERVAL: Duration = Duration::from_secs(7);

/// ...for at most this long...
pub const PHASE1_DURATION: Duration = Duration::from_secs(10 * 60);

/// ...stopping early once this many root peers are connected.
pub const PHASE1_TARGET_ROOT_PEERS: usize = 2;

/// Phase 2 cadence and duration.
pub const PHASE2_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const PHASE2_DURATION: Duration = Duration::from_secs(60 * 60);

/// Local discovery: every 10 s until a peer appears, then every 10 min.
pub const DISCOVERY_INTERVAL_SEARCHING: Duration = Duration::from_secs(10);
pub const DISCOVERY_INTERVAL_SETTLED: Duration = Duration::from_secs(10 * 60);

/// TTL of the recent-contacts cache gating re-announcements.
pub const RECENT_CONTACT_TTL: Duration = Duration::from_secs(5 * 60);

/// A parsed bootstrap seed.
#[derive(Debug, Clone)]
pub struct SeedContact {
    pub public_key: PublicKey,
    pub peer_id: PeerId,
    pub addresses: Vec<SocketAddr>,
}

/// Parse the configured seed list, skipping malformed entries.
pub fn parse_seed_list(seeds: &[SeedPeer]) -> Vec<SeedContact> {
    let mut out = Vec::with_capacity(seeds.len());
    for seed in seeds {
        let key_bytes = match hex::decode(seed.public_key.trim()) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("seed with bad public key hex: {}", e);
                continue;
            }
        };
        let public_key = match crypto::parse_peer_id(&key_bytes) {
            Ok(key) => key,
            Err(e) => {
                warn!("seed with invalid public key: {}", e);
                continue;
            }
        };
        let addresses: Vec<SocketAddr> = seed
            .addresses
            .iter()
            .filter_map(|a| a.parse().ok())
            .collect();
        if addresses.is_empty() {
            warn!("seed {} has no usable addresses", &seed.public_key);
            continue;
        }
        out.push(SeedContact { peer_id: public_key.serialize(), public_key, addresses });
    }
    out
}

/// Quality gate for a peer record returned by FIND_SELF: it must carry an
/// address with a real port and must not be ourselves.
pub fn returned_peer_usable(record: &PeerRecord, self_id: &PeerId) -> bool {
    if record.peer_id == *self_id {
        return false;
    }
    if record.addr.port() == 0 {
        return false;
    }
    !record.addr.ip().is_unspecified()
}

/// Per-target cache preventing announcement amplification: a peer is
/// contacted at most once per TTL through the bootstrap path.
pub struct RecentContacts {
    ttl: Duration,
    seen: Mutex<HashMap<PeerId, Instant>>,
}

impl RecentContacts {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, seen: Mutex::new(HashMap::new()) }
    }

    /// True when the peer was not contacted within the TTL. Does not record;
    /// call `record` after the send actually happened.
    pub async fn should_contact(&self, peer: &PeerId) -> bool {
        let seen = self.seen.lock().await;
        match seen.get(peer) {
            Some(at) => at.elapsed() >= self.ttl,
            None => true,
        }
    }

    /// Record a completed contact attempt.
    pub async fn record(&self, peer: &PeerId) {
        self.seen.lock().await.insert(*peer, Instant::now());
    }

    /// Drop entries past the TTL.
    pub async fn sweep(&self) {
        let ttl = self.ttl;
        self.seen.lock().await.retain(|_, at| at.elapsed() < ttl);
    }

    pub async fn len(&self) -> usize {
        self.seen.lock().await.len()
    }
}

impl Default for RecentContacts {
    fn default() -> Self {
        Self::new(RECENT_CONTACT_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Identity;
    use crate::net::message::PEER_REASON_CLOSEST;

    #[test]
    fn parses_valid_seeds_and_skips_garbage() {
        let good = Identity::generate();
        let seeds = vec![
            SeedPeer {
                public_key: hex::encode(good.peer_id()),
                addresses: vec!["198.51.100.1:112".into(), "bogus".into()],
            },
            SeedPeer { public_key: "zz".into(), addresses: vec!["1.2.3.4:112".into()] },
            SeedPeer { public_key: hex::encode(good.peer_id()), addresses: vec![] },
        ];
        let parsed = parse_seed_list(&seeds);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].peer_id, good.peer_id());
        assert_eq!(parsed[0].addresses.len(), 1);
    }

    #[test]
    fn returned_peer_quality_gate() {
        let me = Identity::generate().peer_id();
        let other = Identity::generate().peer_id();
        let record = |peer_id, addr: &str| PeerRecord {
            peer_id,
            addr: addr.parse().unwrap(),
            last_contact_secs: 1,
            reason: PEER_REASON_CLOSEST,
        };

        assert!(returned_peer_usable(&record(other, "9.9.9.9:112"), &me));
        assert!(!returned_peer_usable(&record(me, "9.9.9.9:112"), &me));
        assert!(!returned_peer_usable(&record(other, "9.9.9.9:0"), &me));
        assert!(!returned_peer_usable(&record(other, "0.0.0.0:112"), &me));
    }

    #[tokio::test]
    async fn recent_contacts_gate_and_expire() {
        let cache = RecentContacts::new(Duration::from_millis(20));
        let peer = [5u8; 33];

        assert!(cache.should_contact(&peer).await);
        // Not yet recorded: still contactable until the send is recorded.
        assert!(cache.should_contact(&peer).await);

        cache.record(&peer).await;
        assert!(!cache.should_contact(&peer).await);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.should_contact(&peer).await);

        cache.sweep().await;
        assert_eq!(cache.len().await, 0);
    }
}
