use primitive_types::{H256, U256};

use crate::{
    core::id::NodeId,
    crypto::SIGNATURE_BYTES,
    error::Result,
    eth::message::Block,
};

/// The narrow view of the local blockchain the synchroniser works against.
///
/// Kadsync doesn't validate blocks beyond their parent linkage: consensus rules and state
/// execution are the implementor's concern and should be enforced in
/// [`insert_block`](Chain::insert_block).
pub trait Chain {
    /// Returns the hash of the current best block.
    fn best_hash(&self) -> H256;

    /// Returns the total difficulty of the current best chain.
    fn total_difficulty(&self) -> U256;

    /// Returns the hash of the genesis block.
    fn genesis_hash(&self) -> H256;

    /// Returns the block with the supplied hash, if known.
    fn block_by_hash(&self, hash: &H256) -> Option<Block>;

    /// Returns `true` if the block is already part of the chain; the provided implementation
    /// looks the block up.
    fn is_block_known(&self, hash: &H256) -> bool {
        self.block_by_hash(hash).is_some()
    }

    /// Imports a block whose parent is known.
    fn insert_block(&mut self, block: Block) -> Result<()>;
}

/// Signs outbound discovery packets on behalf of the local node.
pub trait Signer {
    /// The local node's identifier (its public key).
    fn node_id(&self) -> NodeId;

    /// Produces a recoverable signature over a 32-byte hash.
    fn sign(&self, hash: &[u8; 32]) -> Result<[u8; SIGNATURE_BYTES]>;
}
