//! Discovery packet framing: `hash || signature || type || rlp(body)`.
//!
//! The hash covers everything after it, the signature covers `type || rlp(body)` and identifies
//! the sender.

use primitive_types::H256;
use time::OffsetDateTime;

use crate::{
    core::{id::NodeId, message::Message, traits::Signer},
    crypto::{keccak256, keccak256_concat, recover_node_id, SIGNATURE_BYTES},
    error::{Error, Result},
};

const HASH_BYTES: usize = 32;
const HEADER_BYTES: usize = HASH_BYTES + SIGNATURE_BYTES;

/// How long a sent message stays valid, in seconds.
pub const EXPIRATION_SECS: u64 = 60;

/// The maximum size of a discovery packet.
pub const MAX_PACKET_BYTES: usize = 1280;

/// A decoded and authenticated inbound packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPacket {
    /// The sender, recovered from the signature.
    pub node_id: NodeId,
    /// The packet hash, echoed in PONG responses.
    pub hash: H256,
    pub message: Message,
}

/// Returns the current unix time in seconds.
pub fn unix_now() -> u64 {
    OffsetDateTime::now_utc().unix_timestamp().max(0) as u64
}

/// Returns the expiration to stamp on a message sent now.
pub fn expiration() -> u64 {
    unix_now() + EXPIRATION_SECS
}

/// Signs and frames a message, returning the packet and its hash.
pub fn encode<S: Signer + ?Sized>(message: &Message, signer: &S) -> Result<(Vec<u8>, H256)> {
    let packet_type = message.packet_type();
    let body = message.encode_body();

    let signature = signer.sign(&keccak256_concat(&[&[packet_type], &body]))?;
    let hash = keccak256_concat(&[&signature, &[packet_type], &body]);

    let mut packet = Vec::with_capacity(HEADER_BYTES + 1 + body.len());
    packet.extend_from_slice(&hash);
    packet.extend_from_slice(&signature);
    packet.push(packet_type);
    packet.extend_from_slice(&body);

    Ok((packet, H256::from(hash)))
}

/// Authenticates and decodes a packet received at unix time `now`.
pub fn decode(packet: &[u8], now: u64) -> Result<InboundPacket> {
    if packet.len() <= HEADER_BYTES {
        return Err(Error::PacketTooShort(packet.len()));
    }

    let (hash, rest) = packet.split_at(HASH_BYTES);
    if keccak256(rest) != hash {
        return Err(Error::HashMismatch);
    }

    let (signature, signed) = rest.split_at(SIGNATURE_BYTES);
    let mut signature_bytes = [0u8; SIGNATURE_BYTES];
    signature_bytes.copy_from_slice(signature);
    let node_id = recover_node_id(&keccak256(signed), &signature_bytes)?;

    let message = Message::decode(signed[0], &signed[1..])?;
    if message.expiration() < now {
        return Err(Error::Expired(now - message.expiration()));
    }

    Ok(InboundPacket {
        node_id,
        hash: H256::from_slice(hash),
        message,
    })
}
