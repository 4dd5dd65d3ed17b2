//! Identity keys, packet signatures, and the packet stream cipher
//!
//! Every peer is a secp256k1 keypair. The compressed public key is the peer
//! identifier; blake3 of it is the Kademlia node ID. Packets carry a 65-byte
//! recoverable signature, so the wire never transmits the sender key
//! explicitly.

use crate::types::{Hash, NodeId, PeerId};
use salsa20::cipher::{KeyIvInit, StreamCipher};
use salsa20::Salsa20;
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, PublicKey, SecretKey, SECP256K1};
use std::sync::OnceLock;
use thiserror::Error;

/// Recoverable signature size: 1 header byte + 64-byte compact signature.
pub const SIGNATURE_SIZE: usize = 65;

/// Header byte base for compressed-key recoverable signatures.
/// header = 27 + 4 + recovery_id, recovery_id in 0..4.
const SIG_HEADER_BASE: u8 = 27 + 4;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("bad signature")]
    BadSignature,
    #[error("bad key")]
    BadKey,
    #[error("bad hash")]
    BadHash,
}

/// Node identity: a secp256k1 keypair plus the derived node ID.
#[derive(Clone)]
pub struct Identity {
    secret: SecretKey,
    public: PublicKey,
    node_id: NodeId,
}

impl Identity {
    pub fn generate() -> Self {
        let secret = SecretKey::new(&mut rand::thread_rng());
        Self::from_secret(secret)
    }

    pub fn from_private_key_hex(hex_key: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(hex_key.trim()).map_err(|_| CryptoError::BadKey)?;
        let secret = SecretKey::from_slice(&bytes).map_err(|_| CryptoError::BadKey)?;
        Ok(Self::from_secret(secret))
    }

    fn from_secret(secret: SecretKey) -> Self {
        let public = secret.public_key(SECP256K1);
        let node_id = node_id(&public);
        Self { secret, public, node_id }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn peer_id(&self) -> PeerId {
        self.public.serialize()
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn private_key_hex(&self) -> String {
        hex::encode(self.secret.secret_bytes())
    }

    /// Sign a 32-byte digest. The signature recovers to the public key.
    pub fn sign_recoverable(&self, digest: &Hash) -> [u8; SIGNATURE_SIZE] {
        let msg = Message::from_digest(*digest);
        let sig = SECP256K1.sign_ecdsa_recoverable(&msg, &self.secret);
        let (rec, compact) = sig.serialize_compact();
        let mut out = [0u8; SIGNATURE_SIZE];
        out[0] = SIG_HEADER_BASE + rec.to_i32() as u8;
        out[1..].copy_from_slice(&compact);
        out
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("peer_id", &hex::encode(self.peer_id()))
            .finish_non_exhaustive()
    }
}

/// Recover the signer's public key from a 65-byte recoverable signature.
pub fn verify_recover(digest: &Hash, signature: &[u8]) -> Result<PublicKey, CryptoError> {
    if signature.len() != SIGNATURE_SIZE {
        return Err(CryptoError::BadSignature);
    }
    let header = signature[0];
    if !(SIG_HEADER_BASE..SIG_HEADER_BASE + 4).contains(&header) {
        return Err(CryptoError::BadSignature);
    }
    let rec = RecoveryId::from_i32((header - SIG_HEADER_BASE) as i32)
        .map_err(|_| CryptoError::BadSignature)?;
    let sig = RecoverableSignature::from_compact(&signature[1..], rec)
        .map_err(|_| CryptoError::BadSignature)?;
    let msg = Message::from_digest(*digest);
    SECP256K1
        .recover_ecdsa(&msg, &sig)
        .map_err(|_| CryptoError::BadSignature)
}

/// Parse a compressed public key from wire bytes.
pub fn parse_peer_id(bytes: &[u8]) -> Result<PublicKey, CryptoError> {
    PublicKey::from_slice(bytes).map_err(|_| CryptoError::BadKey)
}

/// blake3 content hash.
pub fn hash(data: &[u8]) -> Hash {
    *blake3::hash(data).as_bytes()
}

/// Node ID: blake3 of the compressed public key.
pub fn node_id(public: &PublicKey) -> NodeId {
    hash(&public.serialize())
}

/// Apply the packet stream cipher in place.
///
/// Key: the receiver's compressed public key minus the leading prefix byte
/// (32 bytes). Nonce: the 4-byte packet nonce repeated twice. Symmetric, so
/// the same call encrypts and decrypts.
pub fn packet_cipher(receiver: &PublicKey, nonce: &[u8; 4], data: &mut [u8]) {
    let compressed = receiver.serialize();
    let mut key = [0u8; 32];
    key.copy_from_slice(&compressed[1..33]);

    let mut iv = [0u8; 8];
    iv[..4].copy_from_slice(nonce);
    iv[4..].copy_from_slice(nonce);

    let mut cipher = Salsa20::new(&key.into(), &iv.into());
    cipher.apply_keystream(data);
}

// =============================================================================
// DISCOVERY KEYPAIRS
// =============================================================================
// Broadcast and multicast packets must be decryptable without prior contact,
// so local discovery uses well-known keypairs as the receiver. The real
// sender key still travels via the recoverable signature.

const DISCOVERY_PRIVATE_IPV4: &str =
    "5e27ecc8e2b1c1f1a6f1d4a9c3b7e5d2048c96a1f3b58d74c2e90f167a3d5b21";

const DISCOVERY_PRIVATE_IPV6: &str =
    "016ad30b614578d97a6e1c52b03dce84f29a7b6d4c15e3f8029b8e67d1a40c35";

static DISCOVERY_IPV4: OnceLock<Identity> = OnceLock::new();
static DISCOVERY_IPV6: OnceLock<Identity> = OnceLock::new();

/// Well-known identity used as the receiver of IPv4 broadcast discovery.
pub fn discovery_identity_ipv4() -> &'static Identity {
    DISCOVERY_IPV4.get_or_init(|| {
        Identity::from_private_key_hex(DISCOVERY_PRIVATE_IPV4).expect("well-known ipv4 key")
    })
}

/// Well-known identity used as the receiver of IPv6 multicast discovery.
pub fn discovery_identity_ipv6() -> &'static Identity {
    DISCOVERY_IPV6.get_or_init(|| {
        Identity::from_private_key_hex(DISCOVERY_PRIVATE_IPV6).expect("well-known ipv6 key")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_recovers_to_signer() {
        let id = Identity::generate();
        let digest = hash(b"payload");
        let sig = id.sign_recoverable(&digest);
        let recovered = verify_recover(&digest, &sig).unwrap();
        assert_eq!(recovered, *id.public_key());
    }

    #[test]
    fn signature_changes_with_message() {
        let id = Identity::generate();
        let a = id.sign_recoverable(&hash(b"a"));
        let b = id.sign_recoverable(&hash(b"b"));
        assert_ne!(a[..], b[..]);
    }

    #[test]
    fn tampered_signature_rejected_or_wrong_key() {
        let id = Identity::generate();
        let digest = hash(b"payload");
        let mut sig = id.sign_recoverable(&digest);
        sig[10] ^= 0x01;
        match verify_recover(&digest, &sig) {
            Err(CryptoError::BadSignature) => {}
            Ok(pk) => assert_ne!(pk, *id.public_key()),
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    #[test]
    fn cipher_round_trips() {
        let id = Identity::generate();
        let nonce = [1, 2, 3, 4];
        let mut data = b"hello mesh".to_vec();
        packet_cipher(id.public_key(), &nonce, &mut data);
        assert_ne!(&data[..], b"hello mesh");
        packet_cipher(id.public_key(), &nonce, &mut data);
        assert_eq!(&data[..], b"hello mesh");
    }

    #[test]
    fn private_key_hex_round_trips() {
        let id = Identity::generate();
        let id2 = Identity::from_private_key_hex(&id.private_key_hex()).unwrap();
        assert_eq!(id.peer_id(), id2.peer_id());
    }

    #[test]
    fn discovery_keys_parse() {
        assert_ne!(
            discovery_identity_ipv4().peer_id(),
            discovery_identity_ipv6().peer_id()
        );
    }

    #[test]
    fn bad_key_hex_rejected() {
        assert_eq!(
            Identity::from_private_key_hex("zz").unwrap_err(),
            CryptoError::BadKey
        );
        assert_eq!(
            Identity::from_private_key_hex("00").unwrap_err(),
            CryptoError::BadKey
        );
    }
}
