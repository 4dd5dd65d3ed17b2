//! Traverse: relay-assisted NAT hole punch
//!
//! A signer asks an authorized relay to hand a target peer an inner packet
//! (an announcement encrypted to the target). Each hop validates the chain
//! of identities: the relay checks the outer sender is the signer; the
//! target checks the outer sender is the authorized relay and that the inner
//! packet recovers to the signer. The relay stamps the signer's observed
//! endpoint into the payload, which becomes the target's virtual connection
//! hint back to the signer.

use super::message::Traverse;
use super::packet::{PacketError, PacketRaw};
use crate::crypto::Identity;
use crate::types::{now, PeerId};
use secp256k1::PublicKey;
use std::net::SocketAddr;
use thiserror::Error;

/// Lifetime of a traverse message.
pub const TRAVERSE_EXPIRATION_SECS: u64 = 120;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TraverseError {
    #[error("relay validation failed: signer does not match sender")]
    InvalidRelay,
    #[error("traverse expired")]
    ExpiredTraverse,
    #[error("inner packet rejected: {0}")]
    InnerPacket(#[from] PacketError),
    #[error("inner sender does not match signer")]
    InnerSignerMismatch,
}

/// Build a traverse carrying `inner_wire` (a packet already encrypted to the
/// target). The receiver endpoint fields stay zero until the relay fills
/// them.
pub fn build(
    signer: &Identity,
    target: &PeerId,
    relay: &PeerId,
    inner_wire: Vec<u8>,
) -> Traverse {
    Traverse {
        signer: signer.peer_id(),
        target: *target,
        authorized_relay: *relay,
        expires: now() + TRAVERSE_EXPIRATION_SECS,
        receiver_ip: std::net::IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
        receiver_port: 0,
        inner: inner_wire,
    }
}

/// Relay-side validation: the outer packet's recovered sender must be the
/// signer named in the payload, we must be the authorized relay, and the
/// message must be fresh.
pub fn validate_at_relay(
    traverse: &Traverse,
    outer_sender: &PublicKey,
    relay: &Identity,
) -> Result<(), TraverseError> {
    if traverse.signer != outer_sender.serialize() {
        return Err(TraverseError::InvalidRelay);
    }
    if traverse.authorized_relay != relay.peer_id() {
        return Err(TraverseError::InvalidRelay);
    }
    if traverse.expires < now() {
        return Err(TraverseError::ExpiredTraverse);
    }
    Ok(())
}

/// Stamp the signer's observed endpoint before forwarding to the target.
pub fn fill_observed(traverse: &mut Traverse, observed: SocketAddr) {
    traverse.receiver_ip = observed.ip();
    traverse.receiver_port = observed.port();
}

/// Target-side validation: the outer sender must be the authorized relay and
/// the inner packet must decrypt for us and recover to the signer. Returns
/// the inner packet for regular processing.
pub fn validate_at_target(
    traverse: &Traverse,
    outer_sender: &PublicKey,
    target: &Identity,
) -> Result<(PacketRaw, PublicKey), TraverseError> {
    if traverse.authorized_relay != outer_sender.serialize() {
        return Err(TraverseError::InvalidRelay);
    }
    if traverse.target != target.peer_id() {
        return Err(TraverseError::InvalidRelay);
    }
    if traverse.expires < now() {
        return Err(TraverseError::ExpiredTraverse);
    }
    let (inner, inner_sender) = PacketRaw::decode(target, &traverse.inner)?;
    if traverse.signer != inner_sender.serialize() {
        return Err(TraverseError::InnerSignerMismatch);
    }
    Ok((inner, inner_sender))
}
