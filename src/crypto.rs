//! Hashing and recoverable secp256k1 signatures.

use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use sha3::{Digest, Keccak256};

use crate::{
    core::{id::NodeId, traits::Signer},
    error::{Error, Result},
};

/// The size of a recoverable signature: `r || s || v`.
pub const SIGNATURE_BYTES: usize = 65;

/// Computes the Keccak-256 hash of the input.
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    Keccak256::digest(data).into()
}

/// Computes the Keccak-256 hash of the concatenated inputs.
pub fn keccak256_concat(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    for part in parts {
        hasher.update(part);
    }

    hasher.finalize().into()
}

/// A secp256k1 key pair identifying the local node.
pub struct Keypair {
    signing_key: SigningKey,
    node_id: NodeId,
}

impl Keypair {
    /// Generates a random key pair.
    pub fn random() -> Self {
        Self::from_signing_key(SigningKey::random(&mut rand::thread_rng()))
    }

    /// Creates a key pair from secret key bytes.
    pub fn from_secret(bytes: &[u8; 32]) -> Result<Self> {
        let signing_key = SigningKey::from_bytes(bytes.into()).map_err(|_| Error::Signature)?;
        Ok(Self::from_signing_key(signing_key))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let node_id = node_id_from_key(signing_key.verifying_key());

        Self {
            signing_key,
            node_id,
        }
    }
}

impl Signer for Keypair {
    fn node_id(&self) -> NodeId {
        self.node_id
    }

    fn sign(&self, hash: &[u8; 32]) -> Result<[u8; SIGNATURE_BYTES]> {
        let (signature, recovery_id) = self
            .signing_key
            .sign_prehash_recoverable(hash)
            .map_err(|_| Error::Signature)?;

        let mut bytes = [0u8; SIGNATURE_BYTES];
        bytes[..64].copy_from_slice(&signature.to_bytes());
        bytes[64] = recovery_id.to_byte();

        Ok(bytes)
    }
}

/// Recovers the identifier of the node that signed `hash`.
pub fn recover_node_id(hash: &[u8; 32], signature: &[u8; SIGNATURE_BYTES]) -> Result<NodeId> {
    let recovery_id = RecoveryId::from_byte(signature[64]).ok_or(Error::Signature)?;
    let signature = Signature::from_slice(&signature[..64]).map_err(|_| Error::Signature)?;
    let key = VerifyingKey::recover_from_prehash(hash, &signature, recovery_id)
        .map_err(|_| Error::Signature)?;

    Ok(node_id_from_key(&key))
}

// The node identifier is the uncompressed point without its 0x04 prefix.
fn node_id_from_key(key: &VerifyingKey) -> NodeId {
    let point = key.to_encoded_point(false);
    let mut bytes = [0u8; NodeId::BYTES];
    bytes.copy_from_slice(&point.as_bytes()[1..]);

    NodeId::new(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keccak_of_empty_input() {
        assert_eq!(
            hex::encode(keccak256(&[])),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
        assert_eq!(keccak256_concat(&[b"ab", b"c"]), keccak256(b"abc"));
    }

    #[test]
    fn sign_and_recover() {
        let keypair = Keypair::random();
        let hash = keccak256(b"ping");

        let signature = keypair.sign(&hash).unwrap();
        assert_eq!(recover_node_id(&hash, &signature).unwrap(), keypair.node_id());

        // A different message recovers a different key.
        let other = keccak256(b"pong");
        assert_ne!(recover_node_id(&other, &signature).ok(), Some(keypair.node_id()));
    }

    #[test]
    fn bad_recovery_id() {
        let keypair = Keypair::random();
        let hash = keccak256(b"ping");

        let mut signature = keypair.sign(&hash).unwrap();
        signature[64] = 7;
        assert!(recover_node_id(&hash, &signature).is_err());
    }

    #[test]
    fn keypair_from_secret_is_deterministic() {
        let secret = keccak256(b"secret");
        let a = Keypair::from_secret(&secret).unwrap();
        let b = Keypair::from_secret(&secret).unwrap();
        assert_eq!(a.node_id(), b.node_id());

        assert!(Keypair::from_secret(&[0u8; 32]).is_err());
    }
}
