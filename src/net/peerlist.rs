//! The peer list: public key → peer record, plus the admission blacklist
//!
//! Readers dominate, so the map sits behind a reader/writer lock and each
//! peer guards its own connection set. The blacklist persists across runs
//! the same way the rest of the crate persists small tables: bincode in a
//! size-capped file.

use super::peer::PeerInfo;
use crate::types::{now, NodeId, PeerId};
use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::info;

/// Size cap for the blacklist file. Entries are small; anything larger is
/// a corrupt or hostile file.
const MAX_BLACKLIST_FILE_SIZE: u64 = 1024 * 1024;

/// Denied-admission entry keyed by compressed public key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlacklistEntry {
    pub peer_id: Vec<u8>,
    pub reason: String,
    pub added_at: u64,
}

/// Persistent admission blacklist.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Blacklist {
    entries: HashMap<Vec<u8>, BlacklistEntry>,
}

impl Blacklist {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let data = std::fs::read(&path)?;
        if data.len() as u64 > MAX_BLACKLIST_FILE_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("blacklist file too large: {} bytes", data.len()),
            ));
        }
        bincode::deserialize(&data)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let data = bincode::serialize(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, data)
    }

    pub fn add(&mut self, peer_id: &PeerId, reason: String) {
        info!("blacklisting {} ({})", hex::encode(peer_id), reason);
        self.entries.insert(
            peer_id.to_vec(),
            BlacklistEntry { peer_id: peer_id.to_vec(), reason, added_at: now() },
        );
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.entries.contains_key(peer_id.as_slice())
    }

    pub fn remove(&mut self, peer_id: &PeerId) -> bool {
        self.entries.remove(peer_id.as_slice()).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn list(&self) -> Vec<&BlacklistEntry> {
        self.entries.values().collect()
    }
}

/// All peers this node knows, keyed by compressed public key.
#[derive(Default)]
pub struct PeerList {
    peers: RwLock<HashMap<PeerId, Arc<PeerInfo>>>,
    blacklist: Mutex<Blacklist>,
}

impl PeerList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find or create the record for a public key. Blacklisted keys are
    /// denied admission and return None.
    pub async fn upsert(&self, public_key: &PublicKey) -> Option<(Arc<PeerInfo>, bool)> {
        let peer_id = public_key.serialize();
        if self.blacklist.lock().await.contains(&peer_id) {
            return None;
        }

        {
            let peers = self.peers.read().await;
            if let Some(peer) = peers.get(&peer_id) {
                return Some((peer.clone(), false));
            }
        }
        let mut peers = self.peers.write().await;
        // Racing inserts resolve to whichever landed first.
        if let Some(peer) = peers.get(&peer_id) {
            return Some((peer.clone(), false));
        }
        let peer = Arc::new(PeerInfo::new(*public_key));
        peers.insert(peer_id, peer.clone());
        Some((peer, true))
    }

    pub async fn get(&self, peer_id: &PeerId) -> Option<Arc<PeerInfo>> {
        self.peers.read().await.get(peer_id).cloned()
    }

    pub async fn get_by_node_id(&self, node_id: &NodeId) -> Option<Arc<PeerInfo>> {
        let peers = self.peers.read().await;
        peers.values().find(|p| &p.node_id == node_id).cloned()
    }

    pub async fn remove(&self, peer_id: &PeerId) -> bool {
        self.peers.write().await.remove(peer_id).is_some()
    }

    pub async fn snapshot(&self) -> Vec<Arc<PeerInfo>> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Peers with at least one active connection.
    pub async fn connected_count(&self) -> usize {
        let peers = self.snapshot().await;
        let mut count = 0;
        for peer in peers {
            if peer.active_connection().await.is_some() {
                count += 1;
            }
        }
        count
    }

    /// Connected peers flagged as bootstrap seeds.
    pub async fn connected_root_count(&self) -> usize {
        let peers = self.snapshot().await;
        let mut count = 0;
        for peer in peers {
            if peer.is_root() && peer.active_connection().await.is_some() {
                count += 1;
            }
        }
        count
    }

    pub async fn blacklist_add(&self, peer_id: &PeerId, reason: String) {
        self.blacklist.lock().await.add(peer_id, reason);
        // An already-admitted peer is evicted as well.
        self.peers.write().await.remove(peer_id);
    }

    pub async fn is_blacklisted(&self, peer_id: &PeerId) -> bool {
        self.blacklist.lock().await.contains(peer_id)
    }

    pub async fn blacklist_load<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        *self.blacklist.lock().await = Blacklist::load(path)?;
        Ok(())
    }

    pub async fn blacklist_save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        self.blacklist.lock().await.save(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Identity;

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let list = PeerList::new();
        let key = *Identity::generate().public_key();
        let (_, created) = list.upsert(&key).await.unwrap();
        assert!(created);
        let (_, created) = list.upsert(&key).await.unwrap();
        assert!(!created);
        assert_eq!(list.len().await, 1);
    }

    #[tokio::test]
    async fn blacklist_denies_admission() {
        let list = PeerList::new();
        let key = *Identity::generate().public_key();
        let peer_id = key.serialize();

        list.blacklist_add(&peer_id, "spam".into()).await;
        assert!(list.upsert(&key).await.is_none());
        assert!(list.is_blacklisted(&peer_id).await);
    }

    #[tokio::test]
    async fn blacklist_evicts_existing_peer() {
        let list = PeerList::new();
        let key = *Identity::generate().public_key();
        list.upsert(&key).await.unwrap();
        list.blacklist_add(&key.serialize(), "late ban".into()).await;
        assert_eq!(list.len().await, 0);
    }

    #[tokio::test]
    async fn blacklist_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blacklist.dat");

        let list = PeerList::new();
        let peer_id = Identity::generate().peer_id();
        list.blacklist_add(&peer_id, "test".into()).await;
        list.blacklist_save(&path).await.unwrap();

        let list2 = PeerList::new();
        list2.blacklist_load(&path).await.unwrap();
        assert!(list2.is_blacklisted(&peer_id).await);
    }

    #[tokio::test]
    async fn node_id_lookup() {
        let list = PeerList::new();
        let id = Identity::generate();
        let (peer, _) = list.upsert(id.public_key()).await.unwrap();
        assert_eq!(
            list.get_by_node_id(id.node_id()).await.unwrap().peer_id,
            peer.peer_id
        );
    }
}
