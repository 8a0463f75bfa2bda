use std::collections::{HashMap, HashSet, VecDeque};

use primitive_types::H256;
use tracing::*;

use crate::{config::SyncConfig, core::traits::Chain, eth::message::Block};

/// The outcome of an [`import_into`](BlockQueue::import_into) pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported: usize,
    /// Blocks dropped because the chain already had them.
    pub known: usize,
    /// Blocks the chain refused.
    pub rejected: usize,
}

/// The shared queue of hashes to fetch and blocks waiting to be imported.
///
/// Hashes are kept newest at the front, oldest at the back: batches are taken from the back so
/// that parents are requested before their children. A hash is tracked from the moment it's
/// queued until its block arrives, including while it's in flight, so it's never queued twice.
///
/// Both the hashes and the buffered blocks are bounded. Hashes past the limit are refused, and
/// blocks past the limit are refused with their hashes queued again.
#[derive(Debug)]
pub struct BlockQueue {
    hashes: VecDeque<H256>,
    // Queued or in flight.
    known: HashSet<H256>,
    blocks: HashMap<H256, Block>,
    // The hash the next GetBlockHashes starts from.
    best_hash: Option<H256>,
    max_hashes: usize,
    max_blocks: usize,
}

impl Default for BlockQueue {
    fn default() -> Self {
        let config = SyncConfig::default();
        Self::with_limits(config.max_queued_hashes, config.max_buffered_blocks)
    }
}

impl BlockQueue {
    /// Creates a queue with the default limits.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(max_hashes: usize, max_blocks: usize) -> Self {
        Self {
            hashes: VecDeque::new(),
            known: HashSet::new(),
            blocks: HashMap::new(),
            best_hash: None,
            max_hashes: max_hashes.max(1),
            max_blocks: max_blocks.max(1),
        }
    }

    /// Restarts hash retrieval from a new head: the queue is cleared and holds only `hash`.
    pub fn set_best_hash(&mut self, hash: H256) {
        self.clear_hashes();
        self.hashes.push_back(hash);
        self.known.insert(hash);
        self.best_hash = Some(hash);
    }

    /// The hash the next GetBlockHashes request starts from.
    pub fn best_hash(&self) -> Option<H256> {
        self.best_hash
    }

    /// Queues hashes received child to parent, returning how many were new. The last hash taken
    /// in becomes the starting point of the next request.
    ///
    /// Once the queue is full the rest of the response is refused, so that the next request
    /// resumes right after the last hash queued.
    pub fn add_hashes(&mut self, hashes: &[H256]) -> usize {
        let mut added = 0;
        let mut last = None;
        for (i, hash) in hashes.iter().enumerate() {
            if self.known.contains(hash) || self.blocks.contains_key(hash) {
                last = Some(*hash);
                continue;
            }

            if self.is_hashes_full() {
                debug!("hash queue full, {} hashes refused", hashes.len() - i);
                break;
            }

            self.known.insert(*hash);
            self.hashes.push_back(*hash);
            last = Some(*hash);
            added += 1;
        }

        if last.is_some() {
            self.best_hash = last;
        }

        added
    }

    /// Queues an announced hash ahead of the others.
    pub fn add_new_block_hash(&mut self, hash: H256) -> bool {
        if self.known.contains(&hash) || self.blocks.contains_key(&hash) {
            return false;
        }

        self.known.insert(hash);
        self.hashes.push_front(hash);

        true
    }

    /// Takes up to `max` hashes, oldest first. They stay tracked until their blocks arrive or
    /// they're [returned](BlockQueue::return_hashes).
    pub fn take_hashes(&mut self, max: usize) -> Vec<H256> {
        let n = max.min(self.hashes.len());
        let mut taken = Vec::with_capacity(n);
        for _ in 0..n {
            if let Some(hash) = self.hashes.pop_back() {
                taken.push(hash);
            }
        }

        taken
    }

    /// Puts hashes that weren't delivered back, to be taken first and in the same order.
    pub fn return_hashes(&mut self, hashes: Vec<H256>) {
        for hash in hashes.into_iter().rev() {
            if self.blocks.contains_key(&hash) {
                continue;
            }

            self.known.insert(hash);
            self.hashes.push_back(hash);
        }
    }

    /// Drops every queued hash; in-flight hashes stay tracked.
    pub fn clear_hashes(&mut self) {
        for hash in self.hashes.drain(..) {
            self.known.remove(&hash);
        }
        self.best_hash = None;
    }

    /// Buffers received blocks until their parents are known, returning how many were new.
    ///
    /// Blocks arriving while the buffer is full are refused and their hashes queued again.
    pub fn add_blocks(&mut self, blocks: Vec<Block>) -> usize {
        let mut added = 0;
        let mut refused = vec![];
        for block in blocks {
            let hash = block.hash();
            if self.blocks.contains_key(&hash) {
                self.known.remove(&hash);
                continue;
            }

            if self.is_blocks_full() {
                refused.push(hash);
                continue;
            }

            self.known.remove(&hash);
            self.blocks.insert(hash, block);
            added += 1;
        }

        if !refused.is_empty() {
            debug!("block buffer full, {} blocks refused", refused.len());
            self.return_hashes(refused);
        }

        added
    }

    /// Drops the highest buffered blocks until at most `keep` remain, queueing their hashes to be
    /// fetched after every other hash. Returns how many were dropped.
    ///
    /// Frees room for the parents a full buffer of orphans waits for.
    pub fn evict_orphans(&mut self, keep: usize) -> usize {
        if self.blocks.len() <= keep {
            return 0;
        }

        let mut by_number: Vec<(u64, H256)> = self
            .blocks
            .iter()
            .map(|(hash, block)| (block.number, *hash))
            .collect();
        by_number.sort_unstable();

        let evicted: Vec<H256> = by_number
            .drain(keep..)
            .map(|(_, hash)| hash)
            .collect();
        for hash in &evicted {
            self.blocks.remove(hash);
            if self.known.insert(*hash) {
                self.hashes.push_front(*hash);
            }
        }

        debug!("{} orphan blocks evicted", evicted.len());
        evicted.len()
    }

    /// Imports every buffered block whose parent is part of the chain, lowest first, repeating
    /// until no block can be imported.
    pub fn import_into<C: Chain>(&mut self, chain: &mut C) -> ImportSummary {
        let mut summary = ImportSummary::default();

        loop {
            let mut ready: Vec<(u64, H256)> = self
                .blocks
                .iter()
                .filter(|(_, block)| chain.is_block_known(&block.parent_hash))
                .map(|(hash, block)| (block.number, *hash))
                .collect();

            if ready.is_empty() {
                break;
            }
            ready.sort();

            for (_, hash) in ready {
                let block = match self.blocks.remove(&hash) {
                    Some(block) => block,
                    None => continue,
                };

                if chain.is_block_known(&hash) {
                    summary.known += 1;
                    continue;
                }

                let number = block.number;
                match chain.insert_block(block) {
                    Ok(()) => summary.imported += 1,
                    Err(e) => {
                        warn!("block #{} ({:?}) rejected: {}", number, hash, e);
                        summary.rejected += 1;
                    }
                }
            }
        }

        summary
    }

    /// Returns `true` if the hash is queued or in flight.
    pub fn contains(&self, hash: &H256) -> bool {
        self.known.contains(hash)
    }

    /// The number of queued hashes.
    pub fn hashes_len(&self) -> usize {
        self.hashes.len()
    }

    /// The number of blocks waiting for their parents.
    pub fn blocks_len(&self) -> usize {
        self.blocks.len()
    }

    /// Returns `true` if no more hashes are accepted.
    pub fn is_hashes_full(&self) -> bool {
        self.hashes.len() >= self.max_hashes
    }

    /// Returns `true` if no more blocks are accepted: GetBlocks requests wait until imports free
    /// room.
    pub fn is_blocks_full(&self) -> bool {
        self.blocks.len() >= self.max_blocks
    }

    /// Returns `true` if no hash is queued.
    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }
}
