use std::{
    fmt,
    time::{Duration, Instant},
};

use primitive_types::{H256, U256};
use rand::{seq::SliceRandom, thread_rng};
use tracing::*;

use crate::{
    config::SyncConfig,
    core::{id::NodeId, traits::Chain},
    eth::{
        message::{Block, EthMessage, Status},
        queue::BlockQueue,
    },
};

/// The synchronisation state of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncState {
    Idle,
    /// The peer is the master and walks its chain back towards ours.
    HashRetrieving,
    /// The master's chain joined ours.
    DoneHashRetrieving,
    BlockRetrieving,
    /// The peer kept answering GetBlocks with nothing.
    BlocksLack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Request {
    Hashes,
    Blocks,
}

#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    pub hashes_count: usize,
    pub blocks_count: usize,
    /// Consecutive empty Blocks responses.
    pub empty_responses: u32,
    pub last_update: Option<Instant>,
}

/// What a Blocks response did to the peer's in-flight hashes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlocksOutcome {
    /// Blocks matching an in-flight hash, handed to the queue.
    pub accepted: usize,
    /// In-flight hashes left undelivered and put back in the queue.
    pub returned: Vec<H256>,
    /// The next request for this peer.
    pub next: Option<EthMessage>,
}

/// The synchronisation state machine of one connected peer.
///
/// A peer has at most one request in flight: a new request is only issued once the previous
/// response arrived.
#[derive(Debug)]
pub struct SyncPeer {
    id: NodeId,
    status: Status,
    state: SyncState,
    sent_hashes: Vec<H256>,
    outstanding: Option<Request>,
    stats: SyncStats,
    last_hash: Option<H256>,
    last_block_number: Option<u64>,
    max_hashes_ask: usize,
    max_blocks_ask: usize,
    empty_responses_threshold: u32,
}

impl SyncPeer {
    pub fn new(id: NodeId, status: Status, config: &SyncConfig) -> Self {
        Self {
            id,
            status,
            state: SyncState::Idle,
            sent_hashes: vec![],
            outstanding: None,
            stats: SyncStats::default(),
            last_hash: None,
            last_block_number: None,
            max_hashes_ask: config.max_hashes_ask,
            max_blocks_ask: config.max_blocks_ask,
            empty_responses_threshold: config.empty_responses_threshold,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn status(&self) -> &Status {
        &self.status
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn stats(&self) -> &SyncStats {
        &self.stats
    }

    /// The hashes of the GetBlocks request in flight.
    pub fn sent_hashes(&self) -> &[H256] {
        &self.sent_hashes
    }

    pub fn total_difficulty(&self) -> U256 {
        self.status.total_difficulty
    }

    pub fn best_hash(&self) -> H256 {
        self.status.best_hash
    }

    /// Returns `true` if a request is waiting for its response.
    pub fn is_busy(&self) -> bool {
        self.outstanding.is_some()
    }

    /// Returns `true` if the peer retrieves hashes and hasn't answered a request for `timeout`.
    pub fn is_stuck(&self, now: Instant, timeout: Duration) -> bool {
        self.state == SyncState::HashRetrieving
            && self.outstanding == Some(Request::Hashes)
            && self
                .stats
                .last_update
                .map_or(true, |last| now.saturating_duration_since(last) >= timeout)
    }

    /// Records a newer head announced by the peer.
    pub fn update_head(&mut self, hash: H256, total_difficulty: U256) {
        if total_difficulty > self.status.total_difficulty {
            self.status.total_difficulty = total_difficulty;
            self.status.best_hash = hash;
        }
    }

    /// Moves the peer to a new state; a response to a request in flight is still processed.
    pub fn set_state(&mut self, state: SyncState) {
        if self.state != state {
            trace!("peer {}: {:?} -> {:?}", self.id.short(), self.state, state);
            self.state = state;
        }
    }

    /// Starts walking the peer's chain back from the queue's best hash.
    pub fn start_hash_retrieving(&mut self, queue: &BlockQueue, now: Instant) -> Option<EthMessage> {
        self.set_state(SyncState::HashRetrieving);
        // A restart abandons the request in flight.
        self.outstanding = None;
        self.stats.hashes_count = 0;
        self.stats.empty_responses = 0;
        self.stats.last_update = Some(now);

        self.request_hashes(queue)
    }

    /// Sends the next GetBlockHashes if retrieval was postponed on a full queue.
    pub fn resume_hash_retrieving(&mut self, queue: &BlockQueue) -> Option<EthMessage> {
        if self.state != SyncState::HashRetrieving {
            return None;
        }

        self.request_hashes(queue)
    }

    fn request_hashes(&mut self, queue: &BlockQueue) -> Option<EthMessage> {
        if self.outstanding.is_some() {
            return None;
        }

        if queue.is_hashes_full() {
            trace!("peer {}: hash queue full, request postponed", self.id.short());
            return None;
        }

        let hash = queue.best_hash()?;
        self.outstanding = Some(Request::Hashes);

        Some(EthMessage::GetBlockHashes {
            hash,
            max_blocks: self.max_hashes_ask as u64,
        })
    }

    /// Handles a BlockHashes response, returning the next request while hashes keep coming.
    ///
    /// Retrieval is done once the response is empty or reaches a block the chain knows.
    pub fn on_block_hashes<C: Chain>(
        &mut self,
        hashes: Vec<H256>,
        queue: &mut BlockQueue,
        chain: &C,
        now: Instant,
    ) -> Option<EthMessage> {
        if self.outstanding == Some(Request::Hashes) {
            self.outstanding = None;
        }

        if self.state != SyncState::HashRetrieving {
            debug!("peer {}: ignoring {} unexpected hashes", self.id.short(), hashes.len());
            return None;
        }

        self.stats.last_update = Some(now);

        let known = hashes.iter().position(|hash| chain.is_block_known(hash));
        let new = &hashes[..known.unwrap_or(hashes.len())];

        self.stats.hashes_count += queue.add_hashes(new);
        if let Some(last) = new.last() {
            self.last_hash = Some(*last);

            if queue.best_hash() != Some(*last) {
                // Cut short by a full queue: the rest is asked for again later.
                debug!("peer {}: hash queue full, retrieving postponed", self.id.short());
                return None;
            }
        }

        if hashes.is_empty() || known.is_some() {
            debug!(
                "peer {}: hash retrieving done, {} hashes",
                self.id.short(),
                self.stats.hashes_count
            );
            self.set_state(SyncState::DoneHashRetrieving);
            return None;
        }

        self.request_hashes(queue)
    }

    /// Starts fetching blocks for the queued hashes.
    pub fn start_block_retrieving(
        &mut self,
        queue: &mut BlockQueue,
        now: Instant,
    ) -> Option<EthMessage> {
        self.set_state(SyncState::BlockRetrieving);
        self.stats.last_update = Some(now);

        self.request_blocks(queue)
    }

    /// Requests the next batch of blocks, going idle once the queue is drained.
    ///
    /// Nothing is requested while the queue's block buffer is full.
    pub fn request_blocks(&mut self, queue: &mut BlockQueue) -> Option<EthMessage> {
        if self.state != SyncState::BlockRetrieving || self.outstanding.is_some() {
            return None;
        }

        if queue.is_blocks_full() && !queue.is_empty() {
            trace!("peer {}: block buffer full, request postponed", self.id.short());
            return None;
        }

        let mut batch = queue.take_hashes(self.max_blocks_ask);
        if batch.is_empty() {
            self.set_state(SyncState::Idle);
            return None;
        }

        // Spread the hashes so concurrent peers don't fetch correlated ranges.
        batch.shuffle(&mut thread_rng());
        self.sent_hashes = batch.clone();
        self.outstanding = Some(Request::Blocks);

        Some(EthMessage::GetBlocks(batch))
    }

    /// Handles a Blocks response.
    ///
    /// Blocks matching an in-flight hash go to the queue, every other in-flight hash goes back to
    /// it: after the call no hash is in flight for this peer.
    pub fn on_blocks(
        &mut self,
        blocks: Vec<Block>,
        queue: &mut BlockQueue,
        now: Instant,
    ) -> BlocksOutcome {
        let answered = self.outstanding == Some(Request::Blocks);
        if answered {
            self.outstanding = None;
        }

        let sent = self.sent_hashes.len();
        let mut accepted = Vec::with_capacity(blocks.len());

        for block in blocks {
            let hash = block.hash();
            match self.sent_hashes.iter().position(|sent| *sent == hash) {
                Some(i) => {
                    self.sent_hashes.swap_remove(i);
                    self.last_block_number = Some(block.number);
                    accepted.push(block);
                }
                None => trace!("peer {}: unrequested block {:?}", self.id.short(), hash),
            }
        }

        let returned: Vec<H256> = self.sent_hashes.drain(..).collect();
        debug_assert_eq!(accepted.len() + returned.len(), sent);

        let outcome_accepted = accepted.len();
        self.stats.blocks_count += outcome_accepted;
        self.stats.last_update = Some(now);
        queue.add_blocks(accepted);
        queue.return_hashes(returned.clone());

        // Only requested blocks count as an answer.
        if outcome_accepted > 0 {
            self.stats.empty_responses = 0;
        } else if answered {
            self.stats.empty_responses += 1;
            if self.stats.empty_responses >= self.empty_responses_threshold {
                debug!("peer {}: no blocks to offer", self.id.short());
                self.set_state(SyncState::BlocksLack);
            }
        }

        BlocksOutcome {
            accepted: outcome_accepted,
            returned,
            next: self.request_blocks(queue),
        }
    }

    /// Releases the hashes in flight when the session ends.
    pub fn on_disconnect(&mut self) -> Vec<H256> {
        self.outstanding = None;
        self.sent_hashes.drain(..).collect()
    }
}

impl fmt::Display for SyncPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "peer {}: {:?}, td {}, {} hashes, {} blocks",
            self.id.short(),
            self.state,
            self.status.total_difficulty,
            self.stats.hashes_count,
            self.stats.blocks_count
        )?;

        if let Some(number) = self.last_block_number {
            write!(f, ", last block #{number}")?;
        } else if let Some(hash) = self.last_hash {
            write!(f, ", last hash {hash:?}")?;
        }

        Ok(())
    }
}
