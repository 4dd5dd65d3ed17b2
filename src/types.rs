//! Core types shared across the crate

use std::time::{SystemTime, UNIX_EPOCH};

/// 32-byte blake3 hash. Content hashes, node IDs, and DHT keys all use this.
pub type Hash = [u8; 32];

/// Kademlia coordinate: blake3 of the compressed public key.
pub type NodeId = [u8; 32];

/// Compressed secp256k1 public key bytes. The peer identifier on the wire.
pub type PeerId = [u8; 33];

/// Random 16-byte identifier correlating high-throughput data packets with
/// a virtual stream, bypassing the per-peer sequence table.
pub type LiteId = [u8; 16];

/// Unix time in seconds.
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// =============================================================================
// FEATURE FLAGS
// =============================================================================
// Advertised in the Announcement header to describe reachability.

/// Node listens on at least one IPv4 address.
pub const FEATURE_IPV4_LISTEN: u8 = 1 << 0;

/// Node listens on at least one IPv6 address.
pub const FEATURE_IPV6_LISTEN: u8 = 1 << 1;

/// Node believes it is behind a firewall or NAT without port forwarding.
pub const FEATURE_FIREWALL: u8 = 1 << 2;

// =============================================================================
// ANNOUNCEMENT ACTIONS
// =============================================================================

/// Ask the receiver for peers close to the sender's own node ID.
pub const ACTION_FIND_SELF: u8 = 1 << 0;

/// Ask for peers close to listed target hashes.
pub const ACTION_FIND_PEER: u8 = 1 << 1;

/// Ask for values (or peers storing them) for listed target hashes.
pub const ACTION_FIND_VALUE: u8 = 1 << 2;

/// Advertise data stored by the sender: {hash, size, type} records.
pub const ACTION_INFO_STORE: u8 = 1 << 3;

/// XOR distance between two 32-byte IDs.
pub fn xor_distance(a: &Hash, b: &Hash) -> [u8; 32] {
    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = a[i] ^ b[i];
    }
    out
}

/// Number of leading bits shared by two IDs. 256 when equal.
pub fn shared_prefix_len(a: &Hash, b: &Hash) -> usize {
    for i in 0..32 {
        let x = a[i] ^ b[i];
        if x != 0 {
            return i * 8 + x.leading_zeros() as usize;
        }
    }
    256
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_len_counts_bits() {
        let a = [0u8; 32];
        let mut b = [0u8; 32];
        assert_eq!(shared_prefix_len(&a, &b), 256);

        b[0] = 0b1000_0000;
        assert_eq!(shared_prefix_len(&a, &b), 0);

        b[0] = 0b0000_0001;
        assert_eq!(shared_prefix_len(&a, &b), 7);

        b[0] = 0;
        b[31] = 1;
        assert_eq!(shared_prefix_len(&a, &b), 255);
    }

    #[test]
    fn xor_distance_is_symmetric() {
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        a[0] = 0xf0;
        b[0] = 0x0f;
        assert_eq!(xor_distance(&a, &b), xor_distance(&b, &a));
        assert_eq!(xor_distance(&a, &b)[0], 0xff);
    }
}
