//! Protocol identifier types.

use std::{fmt, str::FromStr};

use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};

use crate::{crypto::keccak256, error::Error};

/// A 512-bit node identifier: the uncompressed secp256k1 public key of a node, without the SEC1
/// prefix byte.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    bytes: [u8; Self::BYTES],
}

impl NodeId {
    /// The size of the identifier in bytes.
    pub const BYTES: usize = 64;

    /// Creates a new identifier from the supplied bytes.
    pub fn new(bytes: [u8; Self::BYTES]) -> Self {
        NodeId { bytes }
    }

    /// The all-zero identifier, used for nodes only known by their endpoint.
    pub fn zero() -> Self {
        NodeId {
            bytes: [0u8; Self::BYTES],
        }
    }

    /// Creates an identifier from a slice, returning `None` if it isn't exactly 64 bytes long.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; Self::BYTES] = bytes.try_into().ok()?;
        Some(NodeId { bytes })
    }

    /// Returns the bytes backing the identifier.
    pub fn bytes(&self) -> &[u8; Self::BYTES] {
        &self.bytes
    }

    /// Returns `true` if the identifier is unknown (all zeroes).
    pub fn is_zero(&self) -> bool {
        self.bytes.iter().all(|&b| b == 0)
    }

    /// Returns the Kademlia key of this identifier (its Keccak-256 hash).
    pub fn key(&self) -> Id {
        Id::new(keccak256(&self.bytes))
    }

    /// A random identifier, used as the target of refresh lookups.
    pub fn rand() -> Self {
        use rand::{thread_rng, RngCore};

        let mut bytes = [0u8; Self::BYTES];
        thread_rng().fill_bytes(&mut bytes);

        Self { bytes }
    }

    /// The first four bytes in hex, enough to tell nodes apart in logs.
    pub fn short(&self) -> String {
        hex::encode(&self.bytes[..4])
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.short())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.bytes))
    }
}

impl FromStr for NodeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim_start_matches("0x"))
            .map_err(|e| Error::InvalidNode(format!("bad node id: {e}")))?;

        NodeId::from_slice(&bytes)
            .ok_or_else(|| Error::InvalidNode(format!("node id is {} bytes long", bytes.len())))
    }
}

impl Encodable for NodeId {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.append(&self.bytes.to_vec());
    }
}

impl Decodable for NodeId {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        let bytes: Vec<u8> = rlp.as_val()?;
        NodeId::from_slice(&bytes).ok_or(DecoderError::RlpInvalidLength)
    }
}

/// A 256-bit identifier that implements a non-euclidian XOR-based distance metric.
///
/// Bytes are interpreted big-endian, so comparing two distances as byte arrays compares them as
/// integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id {
    bytes: [u8; Self::BYTES],
}

impl Id {
    /// The size of the identifier in bytes.
    pub const BYTES: usize = 32;

    /// The size of the identifier in bits.
    pub const BITS: usize = 32 * 8;

    /// Creates a new identifier from the supplied bytes.
    pub fn new(bytes: [u8; Self::BYTES]) -> Self {
        Id { bytes }
    }

    /// Returns the bytes backing the identifier.
    pub fn bytes(&self) -> [u8; Self::BYTES] {
        self.bytes
    }

    #[cfg(test)]
    /// Convenience function for working with small identifiers during testing.
    pub fn from_u16(raw: u16) -> Self {
        let mut bytes = [0u8; Self::BYTES];
        bytes[Self::BYTES - 2..].copy_from_slice(&raw.to_be_bytes());

        Self { bytes }
    }

    /// Returns the XOR distance between two identifiers.
    pub fn distance(&self, other: &Id) -> Id {
        let mut bytes = [0u8; Self::BYTES];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = self.bytes[i] ^ other.bytes[i];
        }

        Id { bytes }
    }

    /// Computes the log2 of the XOR-based distance between two identifiers.
    pub fn log2_distance(&self, other: &Id) -> Option<u32> {
        // The first non-zero byte of the XOR holds the most-significant bit. Its index counts
        // from the most-significant end, so the bit position is offset by the number of bytes
        // that follow it.
        self.bytes
            .iter()
            .zip(other.bytes.iter())
            .map(|(&a, &b)| a ^ b)
            .enumerate()
            .find(|(_, byte)| byte != &0b0)
            // The left shift multiplies the byte count by 8 to get its value in bits.
            .map(|(i, byte)| Self::msb(byte) + (((Self::BYTES - 1 - i) as u32) << 3))
    }

    /// Returns the index of the bucket `other` belongs to, as seen from `self`.
    ///
    /// A distance of zero maps to the first bucket.
    pub fn bucket_index(&self, other: &Id) -> usize {
        self.log2_distance(other).unwrap_or(0) as usize
    }

    // Returns the position of the most-significant bit set in a byte (0-indexed).
    fn msb(n: u8) -> u32 {
        debug_assert_ne!(n, 0);
        // Safety: can't be 0 - 1.
        u8::BITS - n.leading_zeros() - 1
    }
}
