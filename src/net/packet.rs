//! Packet codec: the smallest wire unit
//!
//! Layout (little-endian multi-byte fields):
//!
//! ```text
//! Offset  Size   Field
//! 0       4      Nonce
//! 4       1      Protocol version = 0
//! 5       1      Command
//! 6       4      Sequence
//! 10      2      Size of payload
//! 12      ?      Payload
//!         0-19   Randomized garbage
//!         65     Recoverable signature
//! ```
//!
//! Everything after the nonce is stream-ciphered with a key derived from the
//! receiver's public key; the signature is ciphered in a separate pass. The
//! signature covers the nonce plus the ciphered body, so the wire bytes are
//! fully opaque and the sender is recovered rather than transmitted.

use crate::crypto::{self, CryptoError, Identity, SIGNATURE_SIZE};
use rand::Rng;
use secp256k1::PublicKey;
use thiserror::Error;

/// Early length gate for inbound datagrams.
pub const PACKET_LENGTH_MIN: usize = 73;

/// Largest UDP payload we will ever emit.
pub const UDP_MAX_PACKET_SIZE: usize = 65507;

/// Fixed header: nonce 4 + protocol 1 + command 1 + sequence 4 + size 2.
pub const PACKET_HEADER_SIZE: usize = 12;

/// Header plus signature; subtract from the datagram size for payload room.
pub const PACKET_OVERHEAD: usize = PACKET_HEADER_SIZE + SIGNATURE_SIZE;

/// Maximum payload bytes per packet.
pub const PAYLOAD_MAX: usize = UDP_MAX_PACKET_SIZE - PACKET_OVERHEAD;

/// Garbage padding is drawn uniformly from [0, GARBAGE_MAX).
const GARBAGE_MAX: usize = 20;

/// Total packet lengths the padding rule steers away from. 508 is the
/// conservative never-fragmented size, 1472 the common Ethernet path MTU
/// payload; landing exactly on either would make the traffic shape easy to
/// probe for.
const AVOIDED_PACKET_SIZES: [usize; 2] = [508, 1472];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet too short")]
    TooShort,
    #[error("bad signature")]
    BadSignature,
    #[error("bad length field")]
    BadLengthField,
    #[error("payload overflows packet")]
    OverflowPayload,
}

impl From<CryptoError> for PacketError {
    fn from(_: CryptoError) -> Self {
        PacketError::BadSignature
    }
}

/// A decoded (or to-be-encoded) packet before message interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketRaw {
    pub protocol: u8,
    pub command: u8,
    pub sequence: u32,
    pub payload: Vec<u8>,
}

impl PacketRaw {
    pub fn new(command: u8, sequence: u32, payload: Vec<u8>) -> Self {
        Self { protocol: 0, command, sequence, payload }
    }

    /// Encode, cipher, and sign the packet for the given receiver.
    pub fn encode(&self, sender: &Identity, receiver: &PublicKey) -> Result<Vec<u8>, PacketError> {
        if self.payload.len() > PAYLOAD_MAX {
            return Err(PacketError::OverflowPayload);
        }

        let mut rng = rand::thread_rng();
        let nonce: [u8; 4] = rng.gen();

        let base = PACKET_OVERHEAD + self.payload.len();
        let mut garbage = rng.gen_range(0..GARBAGE_MAX);
        if AVOIDED_PACKET_SIZES.contains(&(base + garbage)) {
            garbage = 0;
        }

        let mut buf = Vec::with_capacity(base + garbage);
        buf.extend_from_slice(&nonce);
        buf.push(self.protocol);
        buf.push(self.command);
        buf.extend_from_slice(&self.sequence.to_le_bytes());
        buf.extend_from_slice(&(self.payload.len() as u16).to_le_bytes());
        buf.extend_from_slice(&self.payload);
        for _ in 0..garbage {
            buf.push(rng.gen());
        }

        crypto::packet_cipher(receiver, &nonce, &mut buf[4..]);

        let digest = crypto::hash(&buf);
        let mut signature = sender.sign_recoverable(&digest);
        crypto::packet_cipher(receiver, &nonce, &mut signature);
        buf.extend_from_slice(&signature);

        Ok(buf)
    }

    /// Decode wire bytes addressed to `receiver`, returning the packet and
    /// the recovered sender key.
    pub fn decode(receiver: &Identity, wire: &[u8]) -> Result<(Self, PublicKey), PacketError> {
        if wire.len() < PACKET_LENGTH_MIN {
            return Err(PacketError::TooShort);
        }

        let mut nonce = [0u8; 4];
        nonce.copy_from_slice(&wire[..4]);

        let body_len = wire.len() - SIGNATURE_SIZE;
        let mut signature = [0u8; SIGNATURE_SIZE];
        signature.copy_from_slice(&wire[body_len..]);
        crypto::packet_cipher(receiver.public_key(), &nonce, &mut signature);

        let digest = crypto::hash(&wire[..body_len]);
        let sender = crypto::verify_recover(&digest, &signature)?;

        let mut region = wire[4..body_len].to_vec();
        crypto::packet_cipher(receiver.public_key(), &nonce, &mut region);

        if region.len() < PACKET_HEADER_SIZE - 4 {
            return Err(PacketError::BadLengthField);
        }
        let protocol = region[0];
        let command = region[1];
        let sequence = u32::from_le_bytes([region[2], region[3], region[4], region[5]]);
        let size = u16::from_le_bytes([region[6], region[7]]) as usize;
        if size > region.len() - 8 {
            return Err(PacketError::BadLengthField);
        }
        let payload = region[8..8 + size].to_vec();

        Ok((Self { protocol, command, sequence, payload }, sender))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (Identity, Identity) {
        (Identity::generate(), Identity::generate())
    }

    #[test]
    fn round_trip() {
        let (a, b) = pair();
        let packet = PacketRaw::new(2, 77, b"ping payload".to_vec());
        let wire = packet.encode(&a, b.public_key()).unwrap();
        let (decoded, sender) = PacketRaw::decode(&b, &wire).unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(sender, *a.public_key());
    }

    #[test]
    fn empty_payload_round_trip() {
        let (a, b) = pair();
        let packet = PacketRaw::new(3, 0, Vec::new());
        let wire = packet.encode(&a, b.public_key()).unwrap();
        assert!(wire.len() >= PACKET_OVERHEAD);
        let (decoded, _) = PacketRaw::decode(&b, &wire).unwrap();
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn wrong_receiver_fails() {
        let (a, b) = pair();
        let c = Identity::generate();
        let wire = PacketRaw::new(0, 1, b"x".to_vec())
            .encode(&a, b.public_key())
            .unwrap();
        // The wrong receiver key decrypts to garbage; either the signature
        // fails outright or the header no longer parses.
        match PacketRaw::decode(&c, &wire) {
            Err(_) => {}
            Ok((p, sender)) => {
                assert!(p.payload != b"x" || sender != *a.public_key());
            }
        }
    }

    #[test]
    fn too_short_rejected() {
        let b = Identity::generate();
        assert_eq!(
            PacketRaw::decode(&b, &[0u8; PACKET_LENGTH_MIN - 1]).unwrap_err(),
            PacketError::TooShort
        );
    }

    #[test]
    fn oversize_payload_rejected() {
        let (a, b) = pair();
        let packet = PacketRaw::new(0, 0, vec![0u8; PAYLOAD_MAX + 1]);
        assert_eq!(
            packet.encode(&a, b.public_key()).unwrap_err(),
            PacketError::OverflowPayload
        );
    }

    #[test]
    fn garbage_flip_keeps_payload() {
        let (a, b) = pair();
        let payload = b"stable payload".to_vec();
        // Find an encoding that actually carries garbage.
        for _ in 0..64 {
            let mut wire = PacketRaw::new(1, 5, payload.clone())
                .encode(&a, b.public_key())
                .unwrap();
            let garbage_len = wire.len() - PACKET_OVERHEAD - payload.len();
            if garbage_len == 0 {
                continue;
            }
            let flip_at = PACKET_HEADER_SIZE + payload.len();
            wire[flip_at] ^= 0xff;
            let (decoded, _) = PacketRaw::decode(&b, &wire).unwrap();
            assert_eq!(decoded.payload, payload);
            return;
        }
        panic!("no padded encoding produced in 64 attempts");
    }

    #[test]
    fn padding_avoids_fingerprint_sizes() {
        let (a, b) = pair();
        // base 497; garbage 11 would land exactly on 508.
        let payload = vec![0u8; 508 - PACKET_OVERHEAD - 11];
        for _ in 0..200 {
            let wire = PacketRaw::new(0, 0, payload.clone())
                .encode(&a, b.public_key())
                .unwrap();
            assert_ne!(wire.len(), 508);
        }
    }

    #[test]
    fn bad_length_field_rejected() {
        let (a, b) = pair();
        let wire = PacketRaw::new(0, 9, b"abc".to_vec())
            .encode(&a, b.public_key())
            .unwrap();

        // Rebuild with a corrupted size field, re-ciphered and re-signed so
        // only the length check can fail.
        let mut nonce = [0u8; 4];
        nonce.copy_from_slice(&wire[..4]);
        let body_len = wire.len() - SIGNATURE_SIZE;
        let mut region = wire[4..body_len].to_vec();
        crypto::packet_cipher(b.public_key(), &nonce, &mut region);
        region[6..8].copy_from_slice(&u16::MAX.to_le_bytes());
        crypto::packet_cipher(b.public_key(), &nonce, &mut region);

        let mut forged = wire[..4].to_vec();
        forged.extend_from_slice(&region);
        let digest = crypto::hash(&forged);
        let mut signature = a.sign_recoverable(&digest);
        crypto::packet_cipher(b.public_key(), &nonce, &mut signature);
        forged.extend_from_slice(&signature);

        assert_eq!(
            PacketRaw::decode(&b, &forged).unwrap_err(),
            PacketError::BadLengthField
        );
    }
}
