//! Trait seams for the external collaborators
//!
//! File storage, the per-peer blockchain cache, and the node's own
//! blockchain live outside this crate. The backend talks to them through
//! these narrow interfaces; tests plug in the in-memory implementations.

use crate::types::{Hash, PeerId};
use std::collections::HashMap;
use std::sync::Mutex;

/// Verdict on a remote peer's announced blockchain header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheAssessment {
    /// Header matches what we have; nothing to do.
    Current,
    /// Remote is ahead; blocks should be fetched.
    Behind,
    /// Version changed; the cached chain is stale and must be replaced.
    Replace,
}

/// The on-disk store of file bytes.
pub trait Warehouse: Send + Sync {
    fn file_exists(&self, hash: &Hash) -> bool;
    fn file_size(&self, hash: &Hash) -> Option<u64>;
    /// Read `limit` bytes from `offset`; limit 0 means to the end.
    fn read_file(&self, hash: &Hash, offset: u64, limit: u64) -> Option<Vec<u8>>;
    /// Store bytes, returning their content hash.
    fn store_file(&self, data: &[u8]) -> Hash;
}

/// Per-remote-peer append-only block cache.
pub trait BlockchainCache: Send + Sync {
    fn assess_header(&self, peer: &PeerId, height: u32, version: u64) -> CacheAssessment;
    fn new_header(&self, peer: &PeerId, height: u32, version: u64);
    fn ingest_block(&self, peer: &PeerId, number: u64, data: &[u8]);
    fn read_block(&self, peer: &PeerId, number: u64) -> Option<Vec<u8>>;
    fn delete_blockchain(&self, peer: &PeerId);
}

/// The node's own signed chain, served to others via GetBlock.
pub trait UserBlockchain: Send + Sync {
    fn height(&self) -> u32;
    fn version(&self) -> u64;
    fn read_block(&self, number: u64) -> Option<Vec<u8>>;
}

// =============================================================================
// IN-MEMORY IMPLEMENTATIONS
// =============================================================================

/// Hash-addressed in-memory warehouse. The default until a real store is
/// injected, and the workhorse of the integration tests.
#[derive(Default)]
pub struct MemoryWarehouse {
    files: Mutex<HashMap<Hash, Vec<u8>>>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Warehouse for MemoryWarehouse {
    fn file_exists(&self, hash: &Hash) -> bool {
        self.files.lock().unwrap().contains_key(hash)
    }

    fn file_size(&self, hash: &Hash) -> Option<u64> {
        self.files.lock().unwrap().get(hash).map(|d| d.len() as u64)
    }

    fn read_file(&self, hash: &Hash, offset: u64, limit: u64) -> Option<Vec<u8>> {
        let files = self.files.lock().unwrap();
        let data = files.get(hash)?;
        let start = (offset as usize).min(data.len());
        let end = if limit == 0 {
            data.len()
        } else {
            (start + limit as usize).min(data.len())
        };
        Some(data[start..end].to_vec())
    }

    fn store_file(&self, data: &[u8]) -> Hash {
        let hash = crate::crypto::hash(data);
        self.files.lock().unwrap().insert(hash, data.to_vec());
        hash
    }
}

/// Cache that remembers headers and blocks in memory.
#[derive(Default)]
pub struct MemoryBlockchainCache {
    headers: Mutex<HashMap<PeerId, (u32, u64)>>,
    blocks: Mutex<HashMap<(PeerId, u64), Vec<u8>>>,
}

impl MemoryBlockchainCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlockchainCache for MemoryBlockchainCache {
    fn assess_header(&self, peer: &PeerId, height: u32, version: u64) -> CacheAssessment {
        match self.headers.lock().unwrap().get(peer) {
            Some((_, v)) if *v != version => CacheAssessment::Replace,
            Some((h, _)) if height > *h => CacheAssessment::Behind,
            Some(_) => CacheAssessment::Current,
            None if height > 0 => CacheAssessment::Behind,
            None => CacheAssessment::Current,
        }
    }

    fn new_header(&self, peer: &PeerId, height: u32, version: u64) {
        self.headers.lock().unwrap().insert(*peer, (height, version));
    }

    fn ingest_block(&self, peer: &PeerId, number: u64, data: &[u8]) {
        self.blocks.lock().unwrap().insert((*peer, number), data.to_vec());
    }

    fn read_block(&self, peer: &PeerId, number: u64) -> Option<Vec<u8>> {
        self.blocks.lock().unwrap().get(&(*peer, number)).cloned()
    }

    fn delete_blockchain(&self, peer: &PeerId) {
        self.headers.lock().unwrap().remove(peer);
        self.blocks.lock().unwrap().retain(|(p, _), _| p != peer);
    }
}

/// A fixed in-memory chain of encoded blocks.
#[derive(Default)]
pub struct MemoryUserBlockchain {
    pub blocks: Vec<Vec<u8>>,
    pub version: u64,
}

impl MemoryUserBlockchain {
    pub fn new(version: u64, blocks: Vec<Vec<u8>>) -> Self {
        Self { blocks, version }
    }
}

impl UserBlockchain for MemoryUserBlockchain {
    fn height(&self) -> u32 {
        self.blocks.len() as u32
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn read_block(&self, number: u64) -> Option<Vec<u8>> {
        self.blocks.get(number as usize).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warehouse_reads_ranges() {
        let w = MemoryWarehouse::new();
        let hash = w.store_file(b"0123456789");
        assert!(w.file_exists(&hash));
        assert_eq!(w.file_size(&hash), Some(10));
        assert_eq!(w.read_file(&hash, 0, 0).unwrap(), b"0123456789");
        assert_eq!(w.read_file(&hash, 2, 3).unwrap(), b"234");
        assert_eq!(w.read_file(&hash, 8, 10).unwrap(), b"89");
        assert!(w.read_file(&[0u8; 32], 0, 0).is_none());
    }

    #[test]
    fn cache_assessment_tracks_versions() {
        let c = MemoryBlockchainCache::new();
        let peer = [1u8; 33];
        assert_eq!(c.assess_header(&peer, 0, 1), CacheAssessment::Current);
        assert_eq!(c.assess_header(&peer, 3, 1), CacheAssessment::Behind);

        c.new_header(&peer, 3, 1);
        assert_eq!(c.assess_header(&peer, 3, 1), CacheAssessment::Current);
        assert_eq!(c.assess_header(&peer, 5, 1), CacheAssessment::Behind);
        assert_eq!(c.assess_header(&peer, 3, 2), CacheAssessment::Replace);
    }

    #[test]
    fn cache_deletion_removes_blocks() {
        let c = MemoryBlockchainCache::new();
        let peer = [1u8; 33];
        c.ingest_block(&peer, 0, b"block0");
        assert!(c.read_block(&peer, 0).is_some());
        c.delete_blockchain(&peer);
        assert!(c.read_block(&peer, 0).is_none());
    }
}
