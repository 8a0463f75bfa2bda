#![allow(dead_code)]

use std::collections::HashMap;

use kadsync::{
    config::DiscoveryConfig,
    crypto::Keypair,
    discovery::SyncDiscovery,
    eth::Block,
    Chain, Error, NodeId, Result,
};
use primitive_types::{H256, U256};
use tracing_subscriber::{fmt, EnvFilter};

pub fn enable_tracing() {
    fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
}

/// Binds a discovery node on localhost, booting from the supplied nodes once started.
pub async fn bound_discovery_node(boot_nodes: Vec<String>) -> SyncDiscovery {
    let config = DiscoveryConfig {
        bind: "127.0.0.1:0".to_string(),
        boot_nodes,
        ping_timeout_ms: 1000,
        lookup_round_interval_ms: 20,
        connection_workers: 2,
        ..Default::default()
    };

    SyncDiscovery::bind(config, Keypair::random()).await.unwrap()
}

/// Starts a discovery node on localhost, booting from the supplied nodes.
pub async fn discovery_node(boot_nodes: Vec<String>) -> SyncDiscovery {
    let node = bound_discovery_node(boot_nodes).await;
    node.start().await.unwrap();

    node
}

/// Returns `true` if the node holds `id` in its routing table.
pub fn knows(node: &SyncDiscovery, id: NodeId) -> bool {
    node.with_manager(|manager| manager.table().nodes().iter().any(|n| n.id() == id))
}

/// An in-memory chain following the heaviest branch.
pub struct MemoryChain {
    blocks: HashMap<H256, Block>,
    total_difficulties: HashMap<H256, U256>,
    best: H256,
    genesis: H256,
}

impl MemoryChain {
    pub fn new() -> Self {
        Self::with_genesis(vec![])
    }

    /// A chain whose genesis carries `extra`, incompatible with other genesis blocks.
    pub fn with_genesis(extra: Vec<u8>) -> Self {
        let genesis = Block {
            parent_hash: H256::zero(),
            number: 0,
            difficulty: U256::from(1),
            body: extra,
        };
        let hash = genesis.hash();

        Self {
            total_difficulties: [(hash, genesis.difficulty)].into_iter().collect(),
            blocks: [(hash, genesis)].into_iter().collect(),
            best: hash,
            genesis: hash,
        }
    }

    /// Mines `n` blocks on top of the best one.
    pub fn extend(&mut self, n: usize) {
        for _ in 0..n {
            let parent = &self.blocks[&self.best];
            let block = Block {
                parent_hash: self.best,
                number: parent.number + 1,
                difficulty: U256::from(1000),
                body: vec![],
            };
            self.insert_block(block).unwrap();
        }
    }

    pub fn len(&self) -> usize {
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
