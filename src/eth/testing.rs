use std::collections::{HashMap, HashSet};

use primitive_types::{H256, U256};

use crate::{
    core::traits::Chain,
    error::{Error, Result},
    eth::message::Block,
};

/// Builds `n` blocks on top of `parent`; the salt tells sibling branches apart.
pub(crate) fn branch(parent: &Block, n: usize, salt: u8) -> Vec<Block> {
    let mut blocks: Vec<Block> = Vec::with_capacity(n);

    for _ in 0..n {
        let parent = blocks.last().unwrap_or(parent);
        let block = Block {
            parent_hash: parent.hash(),
            number: parent.number + 1,
            difficulty: U256::from(1000),
            body: vec![salt],
        };
        blocks.push(block);
    }

    blocks
}

/// An in-memory chain following the heaviest branch.
pub(crate) struct MemoryChain {
    blocks: HashMap<H256, Block>,
    total_difficulties: HashMap<H256, U256>,
    best: H256,
    genesis: H256,
    rejected: HashSet<H256>,
}

impl MemoryChain {
    pub(crate) fn new() -> Self {
        let genesis = Block {
            parent_hash: H256::zero(),
            number: 0,
            difficulty: U256::from(1),
            body: vec![],
        };
        let hash = genesis.hash();

        Self {
            total_difficulties: [(hash, genesis.difficulty)].into_iter().collect(),
            blocks: [(hash, genesis)].into_iter().collect(),
            best: hash,
            genesis: hash,
            rejected: HashSet::new(),
        }
    }

    pub(crate) fn genesis(&self) -> Block {
        self.blocks[&self.genesis].clone()
    }

    pub(crate) fn best_block(&self) -> Block {
        self.blocks[&self.best].clone()
    }

    /// Extends the best branch by `n` blocks, returning them.
    pub(crate) fn extend(&mut self, n: usize) -> Vec<Block> {
        let blocks = branch(&self.best_block(), n, 0);
        for block in &blocks {
            self.insert_block(block.clone()).unwrap();
        }

        blocks
    }

    /// Makes the chain refuse the block.
    pub(crate) fn reject(&mut self, hash: H256) {
        self.rejected.insert(hash);
    }

    pub(crate) fn len(&self) -> usize {
        self.blocks.len()
    }
}

impl Chain for MemoryChain {
    fn best_hash(&self) -> H256 {
        self.best
    }

    fn total_difficulty(&self) -> U256 {
        self.total_difficulties[&self.best]
    }

    fn genesis_hash(&self) -> H256 {
        self.genesis
    }

    fn block_by_hash(&self, hash: &H256) -> Option<Block> {
        self.blocks.get(hash).cloned()
    }

    fn insert_block(&mut self, block: Block) -> Result<()> {
        let hash = block.hash();
        if self.rejected.contains(&hash) {
            return Err(Error::Chain(format!("invalid block {hash:?}")));
        }

        let parent_td = *self
            .total_difficulties
            .get(&block.parent_hash)
            .ok_or_else(|| Error::Chain(format!("unknown parent of {hash:?}")))?;

        let td = parent_td + block.difficulty;
        if td > self.total_difficulty() {
            self.best = hash;
        }
        self.total_difficulties.insert(hash, td);
        self.blocks.insert(hash, block);

        Ok(())
    }
}
