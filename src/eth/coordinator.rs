use std::{collections::HashMap, time::Instant};

use primitive_types::{H256, U256};
use tracing::*;

use crate::{
    config::SyncConfig,
    core::{id::NodeId, statistics::DisconnectReason, traits::Chain},
    error::{Error, Result},
    eth::{
        message::{Capability, EthMessage, Status},
        peer::{SyncPeer, SyncState},
        queue::{BlockQueue, ImportSummary},
    },
};

/// Messages addressed to peers.
pub type Outbound = Vec<(NodeId, EthMessage)>;

/// The phase of the synchronisation as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// Nothing to fetch.
    Idle,
    /// The master walks its chain back towards ours.
    Hashes,
    /// Every peer fetches blocks for the queued hashes.
    Blocks,
}

/// The output of a [`maintain`](SyncCoordinator::maintain) pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Tick {
    pub outbound: Outbound,
    /// Peers to disconnect, already removed from the coordinator.
    pub disconnect: Vec<(NodeId, DisconnectReason)>,
}

/// Drives the synchronisation of the local chain against the connected peers.
///
/// The peer announcing the highest total difficulty above ours becomes the master and is the only
/// one retrieving hashes. Once its chain joins ours every peer fetches blocks in parallel from
/// the shared [`BlockQueue`].
pub struct SyncCoordinator<C> {
    config: SyncConfig,
    capability: Capability,
    chain: C,
    queue: BlockQueue,
    peers: HashMap<NodeId, SyncPeer>,
    master: Option<NodeId>,
    phase: SyncPhase,
    highest_td: U256,
    sync_done: bool,
}

impl<C: Chain> SyncCoordinator<C> {
    /// Creates a coordinator over the local chain; fails if the configured protocol version
    /// isn't supported.
    pub fn new(chain: C, config: SyncConfig) -> Result<Self> {
        let capability = Capability::for_version(config.protocol_version)?;
        let highest_td = chain.total_difficulty();
        let queue = BlockQueue::with_limits(config.max_queued_hashes, config.max_buffered_blocks);

        Ok(Self {
            config,
            capability,
            chain,
            queue,
            peers: HashMap::new(),
            master: None,
            phase: SyncPhase::Idle,
            highest_td,
            sync_done: false,
        })
    }

    /// The status message announcing the local chain.
    pub fn status(&self) -> Status {
        Status {
            protocol_version: self.capability.version(),
            network_id: self.config.network_id,
            total_difficulty: self.chain.total_difficulty(),
            best_hash: self.chain.best_hash(),
            genesis_hash: self.chain.genesis_hash(),
        }
    }

    pub fn capability(&self) -> Capability {
        self.capability
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn chain(&self) -> &C {
        &self.chain
    }

    pub fn chain_mut(&mut self) -> &mut C {
        &mut self.chain
    }

    pub fn queue(&self) -> &BlockQueue {
        &self.queue
    }

    pub fn peer(&self, id: &NodeId) -> Option<&SyncPeer> {
        self.peers.get(id)
    }

    pub fn peers_len(&self) -> usize {
        self.peers.len()
    }

    pub fn master(&self) -> Option<NodeId> {
        self.master
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    /// The highest total difficulty a master announced.
    pub fn highest_total_difficulty(&self) -> U256 {
        self.highest_td
    }

    /// Returns `true` once a block retrieval phase completed and nothing is left to fetch.
    pub fn is_sync_done(&self) -> bool {
        self.sync_done
    }

    /// Registers a peer after its status was received.
    ///
    /// Fails with [`Error::Disconnect`] if the peer runs another chain or protocol.
    pub fn add_peer(&mut self, id: NodeId, status: Status, now: Instant) -> Result<Outbound> {
        if self.peers.contains_key(&id) {
            return Err(Error::Disconnect(DisconnectReason::DuplicatePeer));
        }

        if status.genesis_hash != self.chain.genesis_hash()
            || status.protocol_version != self.capability.version()
        {
            debug!(
                "peer {}: incompatible status (eth/{}, genesis {:?})",
                id.short(),
                status.protocol_version,
                status.genesis_hash
            );
            return Err(Error::Disconnect(DisconnectReason::IncompatibleProtocol));
        }

        if status.network_id != self.config.network_id {
            debug!("peer {}: network {}", id.short(), status.network_id);
            return Err(Error::Disconnect(DisconnectReason::NullIdentity));
        }

        let td = status.total_difficulty;
        debug!("peer {}: added with td {}", id.short(), td);
        self.peers.insert(id, SyncPeer::new(id, status, &self.config));

        if td > self.highest_td
            || (self.phase == SyncPhase::Idle && td > self.chain.total_difficulty())
        {
            return Ok(self.start_master(id, now));
        }

        let mut out = vec![];
        if self.phase == SyncPhase::Blocks {
            if let Some(peer) = self.peers.get_mut(&id) {
                if let Some(message) = peer.start_block_retrieving(&mut self.queue, now) {
                    out.push((id, message));
                }
            }
        }

        Ok(out)
    }

    /// Removes a peer, putting its in-flight hashes back in the queue. A new master is elected if
    /// the peer was retrieving hashes.
    pub fn remove_peer(&mut self, id: &NodeId, now: Instant) -> Outbound {
        let mut peer = match self.peers.remove(id) {
            Some(peer) => peer,
            None => return vec![],
        };

        let returned = peer.on_disconnect();
        debug!("peer {}: removed, {} hashes returned", id.short(), returned.len());
        self.queue.return_hashes(returned);

        if self.master == Some(*id) {
            self.master = None;
            if self.phase == SyncPhase::Hashes {
                return self.elect_master(None, now);
            }
        }

        vec![]
    }

    /// Handles a message received from a registered peer.
    ///
    /// Fails with [`Error::Disconnect`] on a protocol violation.
    pub fn on_message(&mut self, id: &NodeId, message: EthMessage, now: Instant) -> Result<Outbound> {
        if !self.peers.contains_key(id) {
            return Err(Error::Disconnect(DisconnectReason::BadProtocol));
        }

        trace!("peer {}: received {}", id.short(), message);

        let out = match message {
            EthMessage::Status(_) => {
                return Err(Error::Disconnect(DisconnectReason::BadProtocol));
            }
            EthMessage::NewBlockHashes(hashes) => self.on_new_block_hashes(hashes, now),
            EthMessage::GetBlockHashes { hash, max_blocks } => {
                let max = self.cap(max_blocks, self.config.max_hashes_ask);
                vec![(*id, EthMessage::BlockHashes(self.ancestors(hash, max)))]
            }
            EthMessage::BlockHashes(hashes) => self.on_block_hashes(id, hashes, now),
            EthMessage::GetBlocks(hashes) => {
                let blocks = hashes
                    .iter()
                    .take(self.config.max_blocks_ask)
                    .filter_map(|hash| self.chain.block_by_hash(hash))
                    .collect();
                vec![(*id, EthMessage::Blocks(blocks))]
            }
            EthMessage::Blocks(blocks) => {
                let mut out = vec![];
                if let Some(peer) = self.peers.get_mut(id) {
                    let outcome = peer.on_blocks(blocks, &mut self.queue, now);
                    if !outcome.returned.is_empty() {
                        debug!(
                            "peer {}: {} blocks, {} hashes requeued",
                            id.short(),
                            outcome.accepted,
                            outcome.returned.len()
                        );
                    }
                    out.extend(outcome.next.map(|message| (*id, message)));
                }
                self.import_blocks();
                out
            }
            EthMessage::NewBlock {
                block,
                total_difficulty,
            } => {
                let hash = block.hash();
                if let Some(peer) = self.peers.get_mut(id) {
                    peer.update_head(hash, total_difficulty);
                }

                if self.chain.is_block_known(&hash) {
                    vec![]
                } else if self.chain.is_block_known(&block.parent_hash) {
                    self.queue.add_blocks(vec![block]);
                    self.import_blocks();
                    vec![]
                } else if total_difficulty > self.highest_td {
                    debug!("peer {}: new block #{} out of reach", id.short(), block.number);
                    self.start_master(*id, now)
                } else {
                    vec![]
                }
            }
            EthMessage::GetBlockHashesByNumber { number, max_blocks } => {
                let max = self.cap(max_blocks, self.config.max_hashes_ask);
                vec![(*id, EthMessage::BlockHashes(self.hashes_from(number, max)))]
            }
        };

        Ok(out)
    }

    /// Periodic maintenance: drops peers without blocks, replaces a stuck master, keeps idle
    /// peers busy while hashes remain and imports what can be imported.
    pub fn maintain(&mut self, now: Instant) -> Tick {
        let mut tick = Tick::default();

        let lacking: Vec<NodeId> = self
            .peers
            .values()
            .filter(|peer| peer.state() == SyncState::BlocksLack)
            .map(SyncPeer::id)
            .collect();
        for id in lacking {
            tick.outbound.extend(self.remove_peer(&id, now));
            tick.disconnect.push((id, DisconnectReason::UselessPeer));
        }

        if let Some(master) = self.master {
            let stuck = self
                .peers
                .get(&master)
                .is_some_and(|peer| peer.is_stuck(now, self.config.master_stuck_timeout()));

            if stuck {
                info!("master {} is stuck", master.short());
                let out = match self.best_candidate(Some(master)) {
                    Some(id) => self.start_master(id, now),
                    None => self.start_master(master, now),
                };
                tick.outbound.extend(out);
            }
        }

        match self.phase {
            SyncPhase::Idle => {
                if self.best_candidate(None).is_some() {
                    tick.outbound.extend(self.elect_master(None, now));
                }
            }
            SyncPhase::Hashes => match self.master {
                Some(master) => {
                    if let Some(peer) = self.peers.get_mut(&master) {
                        if let Some(message) = peer.resume_hash_retrieving(&self.queue) {
                            tick.outbound.push((master, message));
                        }
                    }
                }
                None => self.phase = SyncPhase::Idle,
            },
            SyncPhase::Blocks => {
                self.import_blocks();
                if self.queue.is_blocks_full() {
                    // Nothing importable and no room to fetch the missing parents.
                    let keep = self
                        .config
                        .max_buffered_blocks
                        .saturating_sub(self.config.max_blocks_ask);
                    self.queue.evict_orphans(keep);
                }

                if !self.queue.is_empty() {
                    for peer in self.peers.values_mut() {
                        if peer.state() == SyncState::BlocksLack || peer.is_busy() {
                            continue;
                        }
                        if let Some(message) = peer.start_block_retrieving(&mut self.queue, now) {
                            tick.outbound.push((peer.id(), message));
                        }
                    }
                }
            }
        }

        self.import_blocks();

        if self.phase == SyncPhase::Blocks
            && self.queue.is_empty()
            && self.queue.blocks_len() == 0
            && self.peers.values().all(|peer| !peer.is_busy())
        {
            info!("sync done, best block {:?}", self.chain.best_hash());
            self.phase = SyncPhase::Idle;
            self.master = None;
            self.sync_done = true;
            for peer in self.peers.values_mut() {
                if peer.state() != SyncState::BlocksLack {
                    peer.set_state(SyncState::Idle);
                }
            }
        }

        tick
    }

    /// Imports the buffered blocks whose parents are known.
    pub fn import_blocks(&mut self) -> ImportSummary {
        let summary = self.queue.import_into(&mut self.chain);
        if summary.imported > 0 {
            debug!(
                "imported {} blocks, td {}",
                summary.imported,
                self.chain.total_difficulty()
            );
        }

        summary
    }

    /// Logs the progress of the synchronisation and of every peer.
    pub fn log_stats(&self) {
        info!(
            "sync {:?}: {} peers, {} hashes queued, {} blocks waiting, td {} (highest {})",
            self.phase,
            self.peers.len(),
            self.queue.hashes_len(),
            self.queue.blocks_len(),
            self.chain.total_difficulty(),
            self.highest_td
        );

        for peer in self.peers.values() {
            info!("{}", peer);
        }
    }

    fn cap(&self, requested: u64, limit: usize) -> usize {
        usize::try_from(requested).unwrap_or(usize::MAX).min(limit)
    }

    // The hashes of the ancestors of `hash`, child to parent, down to the genesis.
    fn ancestors(&self, hash: H256, max: usize) -> Vec<H256> {
        let mut hashes = vec![];
        let mut current = self.chain.block_by_hash(&hash);

        while hashes.len() < max {
            let block = match current {
                Some(block) if block.number > 0 => block,
                _ => break,
            };

            hashes.push(block.parent_hash);
            current = self.chain.block_by_hash(&block.parent_hash);
        }

        hashes
    }

    // The hashes of the best chain from block `number` onwards, parent to child.
    fn hashes_from(&self, number: u64, max: usize) -> Vec<H256> {
        let mut hashes = vec![];
        let mut current = self.chain.block_by_hash(&self.chain.best_hash());

        while let Some(block) = current {
            if block.number < number {
                break;
            }

            hashes.push(block.hash());
            if block.number == 0 {
                break;
            }
            current = self.chain.block_by_hash(&block.parent_hash);
        }

        hashes.reverse();
        hashes.truncate(max);

        hashes
    }

    fn on_new_block_hashes(&mut self, hashes: Vec<H256>, now: Instant) -> Outbound {
        let mut added = 0;
        for hash in hashes {
            if !self.chain.is_block_known(&hash) && self.queue.add_new_block_hash(hash) {
                added += 1;
            }
        }

        if added == 0 || self.phase == SyncPhase::Hashes {
            return vec![];
        }

        trace!("{} new block hashes announced", added);
        self.start_block_phase(now)
    }

    fn on_block_hashes(&mut self, id: &NodeId, hashes: Vec<H256>, now: Instant) -> Outbound {
        let peer = match self.peers.get_mut(id) {
            Some(peer) => peer,
            None => return vec![],
        };

        let mut out = vec![];
        if let Some(message) = peer.on_block_hashes(hashes, &mut self.queue, &self.chain, now) {
            out.push((*id, message));
        }

        if self.master == Some(*id) && peer.state() == SyncState::DoneHashRetrieving {
            info!(
                "master {}: {} hashes retrieved",
                id.short(),
                peer.stats().hashes_count
            );
            out.extend(self.start_block_phase(now));
        }

        out
    }

    // The peer with the highest total difficulty above the local chain's.
    fn best_candidate(&self, exclude: Option<NodeId>) -> Option<NodeId> {
        let local = self.chain.total_difficulty();

        self.peers
            .values()
            .filter(|peer| Some(peer.id()) != exclude)
            .filter(|peer| peer.state() != SyncState::BlocksLack)
            .filter(|peer| peer.total_difficulty() > local)
            .max_by_key(|peer| peer.total_difficulty())
            .map(SyncPeer::id)
    }

    fn elect_master(&mut self, exclude: Option<NodeId>, now: Instant) -> Outbound {
        match self.best_candidate(exclude) {
            Some(id) => self.start_master(id, now),
            None => {
                debug!("no peer ahead of the local chain");
                self.master = None;
                self.phase = SyncPhase::Idle;
                vec![]
            }
        }
    }

    fn start_master(&mut self, id: NodeId, now: Instant) -> Outbound {
        let (td, best_hash) = match self.peers.get(&id) {
            Some(peer) => (peer.total_difficulty(), peer.best_hash()),
            None => return vec![],
        };

        info!("master {}: td {}, best {:?}", id.short(), td, best_hash);
        self.master = Some(id);
        self.highest_td = td;
        self.phase = SyncPhase::Hashes;
        self.sync_done = false;
        self.queue.set_best_hash(best_hash);

        for peer in self.peers.values_mut() {
            if peer.id() != id && peer.state() != SyncState::BlocksLack {
                peer.set_state(SyncState::Idle);
            }
        }

        let mut out = vec![];
        if let Some(peer) = self.peers.get_mut(&id) {
            if let Some(message) = peer.start_hash_retrieving(&self.queue, now) {
                out.push((id, message));
            }
        }

        out
    }

    fn start_block_phase(&mut self, now: Instant) -> Outbound {
        self.phase = SyncPhase::Blocks;

        let mut out = vec![];
        for peer in self.peers.values_mut() {
            if peer.state() == SyncState::BlocksLack {
                continue;
            }
            if let Some(message) = peer.start_block_retrieving(&mut self.queue, now) {
                out.push((peer.id(), message));
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::VecDeque, time::Duration};

    use super::*;
    use crate::eth::{
        message::Block,
        testing::{branch, MemoryChain},
    };

    fn coordinator(chain: MemoryChain) -> SyncCoordinator<MemoryChain> {
        SyncCoordinator::new(chain, SyncConfig::default()).unwrap()
    }

    fn status_of(chain: &MemoryChain) -> Status {
        Status {
            protocol_version: 60,
            network_id: 1,
            total_difficulty: chain.total_difficulty(),
            best_hash: chain.best_hash(),
            genesis_hash: chain.genesis_hash(),
        }
    }

    fn ahead(td: u64, best_hash: H256) -> Status {
        Status {
            total_difficulty: U256::from(td),
            best_hash,
            ..status_of(&MemoryChain::new())
        }
    }

    // Delivers messages between two coordinators until both are quiet.
    fn pump(
        local: &mut SyncCoordinator<MemoryChain>,
        local_id: NodeId,
        remote: &mut SyncCoordinator<MemoryChain>,
        remote_id: NodeId,
        initial: Outbound,
        now: Instant,
    ) {
        let mut pending: VecDeque<_> = initial.into_iter().map(|m| (local_id, m)).collect();

        while let Some((from, (to, message))) = pending.pop_front() {
            if from == local_id {
                assert_eq!(to, remote_id);
                let out = remote.on_message(&local_id, message, now).unwrap();
                pending.extend(out.into_iter().map(|m| (remote_id, m)));
            } else {
                assert_eq!(to, local_id);
                let out = local.on_message(&remote_id, message, now).unwrap();
                pending.extend(out.into_iter().map(|m| (local_id, m)));
            }
        }
    }

    #[test]
    fn incompatible_status_is_refused() {
        let mut sync = coordinator(MemoryChain::new());
        let now = Instant::now();
        let good = status_of(&MemoryChain::new());

        let genesis = Status {
            genesis_hash: H256::repeat_byte(1),
            ..good.clone()
        };
        let version = Status {
            protocol_version: 61,
            ..good.clone()
        };
        let network = Status {
            network_id: 3,
            ..good.clone()
        };

        for (status, reason) in [
            (genesis, DisconnectReason::IncompatibleProtocol),
            (version, DisconnectReason::IncompatibleProtocol),
            (network, DisconnectReason::NullIdentity),
        ] {
            match sync.add_peer(NodeId::rand(), status, now) {
                Err(Error::Disconnect(r)) => assert_eq!(r, reason),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(sync.peers_len(), 0);

        let id = NodeId::rand();
        assert!(sync.add_peer(id, good.clone(), now).unwrap().is_empty());
        assert!(matches!(
            sync.add_peer(id, good.clone(), now),
            Err(Error::Disconnect(DisconnectReason::DuplicatePeer))
        ));
        assert!(matches!(
            sync.on_message(&id, EthMessage::Status(good), now),
            Err(Error::Disconnect(DisconnectReason::BadProtocol))
        ));
    }

    #[test]
    fn block_hashes_are_served_child_to_parent() {
        let mut chain = MemoryChain::new();
        let genesis = chain.genesis_hash();
        let blocks = chain.extend(3);
        let mut sync = coordinator(chain);
        let id = NodeId::rand();
        let now = Instant::now();
        sync.add_peer(id, status_of(sync.chain()), now).unwrap();

        let out = sync
            .on_message(
                &id,
                EthMessage::GetBlockHashes {
                    hash: blocks[2].hash(),
                    max_blocks: 5,
                },
                now,
            )
            .unwrap();

        assert_eq!(
            out,
            vec![(
                id,
                EthMessage::BlockHashes(vec![blocks[1].hash(), blocks[0].hash(), genesis])
            )]
        );

        let out = sync
            .on_message(
                &id,
                EthMessage::GetBlockHashes {
                    hash: blocks[2].hash(),
                    max_blocks: 2,
                },
                now,
            )
            .unwrap();
        assert_eq!(
            out,
            vec![(
                id,
                EthMessage::BlockHashes(vec![blocks[1].hash(), blocks[0].hash()])
            )]
        );

        // Unknown hash.
        let out = sync
            .on_message(
                &id,
                EthMessage::GetBlockHashes {
                    hash: H256::repeat_byte(9),
                    max_blocks: 5,
                },
                now,
            )
            .unwrap();
        assert_eq!(out, vec![(id, EthMessage::BlockHashes(vec![]))]);
    }

    #[test]
    fn block_hashes_by_number() {
        let mut chain = MemoryChain::new();
        let blocks = chain.extend(5);
        let mut sync = coordinator(chain);
        let id = NodeId::rand();
        let now = Instant::now();
        sync.add_peer(id, status_of(sync.chain()), now).unwrap();

        let out = sync
            .on_message(
                &id,
                EthMessage::GetBlockHashesByNumber {
                    number: 2,
                    max_blocks: 3,
                },
                now,
            )
            .unwrap();

        assert_eq!(
            out,
            vec![(
                id,
                EthMessage::BlockHashes(vec![
                    blocks[1].hash(),
                    blocks[2].hash(),
                    blocks[3].hash()
                ])
            )]
        );
    }

    #[test]
    fn blocks_are_served_from_the_chain() {
        let mut chain = MemoryChain::new();
        let blocks = chain.extend(2);
        let mut sync = coordinator(chain);
        let id = NodeId::rand();
        let now = Instant::now();
        sync.add_peer(id, status_of(sync.chain()), now).unwrap();

        let out = sync
            .on_message(
                &id,
                EthMessage::GetBlocks(vec![
                    blocks[1].hash(),
                    H256::repeat_byte(9),
                    blocks[0].hash(),
                ]),
                now,
            )
            .unwrap();

        assert_eq!(
            out,
            vec![(
                id,
                EthMessage::Blocks(vec![blocks[1].clone(), blocks[0].clone()])
            )]
        );
    }

    #[test]
    fn syncs_from_a_peer_ahead() {
        let mut remote_chain = MemoryChain::new();
        remote_chain.extend(20);
        let remote_best = remote_chain.best_hash();

        let mut local = coordinator(MemoryChain::new());
        let mut remote = coordinator(remote_chain);
        let (local_id, remote_id) = (NodeId::rand(), NodeId::rand());
        let now = Instant::now();

        assert!(remote
            .add_peer(local_id, local.status(), now)
            .unwrap()
            .is_empty());
        let out = local.add_peer(remote_id, remote.status(), now).unwrap();

        assert_eq!(local.master(), Some(remote_id));
        assert_eq!(local.phase(), SyncPhase::Hashes);
        assert_eq!(
            out,
            vec![(
                remote_id,
                EthMessage::GetBlockHashes {
                    hash: remote_best,
                    max_blocks: 10_000
                }
            )]
        );

        pump(&mut local, local_id, &mut remote, remote_id, out, now);

        assert_eq!(local.chain().best_hash(), remote_best);
        assert_eq!(local.chain().len(), 21);
        assert_eq!(local.phase(), SyncPhase::Blocks);
        assert!(!local.is_sync_done());

        let tick = local.maintain(now);
        assert_eq!(tick, Tick::default());
        assert_eq!(local.phase(), SyncPhase::Idle);
        assert!(local.is_sync_done());
        assert_eq!(local.peer(&remote_id).unwrap().stats().blocks_count, 20);
    }

    #[test]
    fn syncs_in_batches() {
        let mut remote_chain = MemoryChain::new();
        remote_chain.extend(10);
        let remote_best = remote_chain.best_hash();

        let config = SyncConfig {
            max_hashes_ask: 3,
            max_blocks_ask: 4,
            ..Default::default()
        };
        let mut local = SyncCoordinator::new(MemoryChain::new(), config).unwrap();
        let mut remote = coordinator(remote_chain);
        let (local_id, remote_id) = (NodeId::rand(), NodeId::rand());
        let now = Instant::now();

        remote.add_peer(local_id, local.status(), now).unwrap();
        let out = local.add_peer(remote_id, remote.status(), now).unwrap();
        pump(&mut local, local_id, &mut remote, remote_id, out, now);

        assert_eq!(local.chain().best_hash(), remote_best);
        assert_eq!(local.peer(&remote_id).unwrap().stats().hashes_count, 9);
    }

    #[test]
    fn syncs_through_a_small_block_buffer() {
        let mut remote_chain = MemoryChain::new();
        remote_chain.extend(12);
        let remote_best = remote_chain.best_hash();

        let config = SyncConfig {
            max_hashes_ask: 5,
            max_blocks_ask: 4,
            max_buffered_blocks: 2,
            ..Default::default()
        };
        let mut local = SyncCoordinator::new(MemoryChain::new(), config).unwrap();
        let mut remote = coordinator(remote_chain);
        let (local_id, remote_id) = (NodeId::rand(), NodeId::rand());
        let now = Instant::now();

        remote.add_peer(local_id, local.status(), now).unwrap();
        let out = local.add_peer(remote_id, remote.status(), now).unwrap();
        pump(&mut local, local_id, &mut remote, remote_id, out, now);

        // Requests wait for imports or evictions to free the buffer.
        let mut passes = 0;
        while !local.is_sync_done() {
            assert!(local.queue().blocks_len() <= 2);
            passes += 1;
            assert!(passes < 1000, "sync stalled");

            let tick = local.maintain(now);
            assert!(tick.disconnect.is_empty());
            pump(&mut local, local_id, &mut remote, remote_id, tick.outbound, now);
        }

        assert_eq!(local.chain().best_hash(), remote_best);
        assert_eq!(local.chain().len(), 13);
    }

    #[test]
    fn full_hash_queue_pauses_the_master() {
        let mut remote_chain = MemoryChain::new();
        remote_chain.extend(5);

        let config = SyncConfig {
            max_queued_hashes: 3,
            ..Default::default()
        };
        let mut local = SyncCoordinator::new(MemoryChain::new(), config).unwrap();
        let mut remote = coordinator(remote_chain);
        let (local_id, remote_id) = (NodeId::rand(), NodeId::rand());
        let now = Instant::now();

        remote.add_peer(local_id, local.status(), now).unwrap();
        let out = local.add_peer(remote_id, remote.status(), now).unwrap();
        pump(&mut local, local_id, &mut remote, remote_id, out, now);

        assert_eq!(local.phase(), SyncPhase::Hashes);
        assert_eq!(local.queue().hashes_len(), 3);
        assert!(!local.peer(&remote_id).unwrap().is_busy());

        // Waiting on the local queue doesn't make the master stuck.
        let tick = local.maintain(now + Duration::from_secs(120));
        assert_eq!(tick, Tick::default());
        assert_eq!(local.master(), Some(remote_id));
    }

    #[test]
    fn lacking_peer_is_dropped() {
        let mut sync = coordinator(MemoryChain::new());
        let id = NodeId::rand();
        let now = Instant::now();
        let head = H256::repeat_byte(7);

        sync.add_peer(id, ahead(5000, head), now).unwrap();
        // The peer's chain joins ours right away: only its head is queued.
        let out = sync
            .on_message(&id, EthMessage::BlockHashes(vec![]), now)
            .unwrap();
        assert_eq!(out, vec![(id, EthMessage::GetBlocks(vec![head]))]);
        assert_eq!(sync.phase(), SyncPhase::Blocks);

        for _ in 0..4 {
            let out = sync.on_message(&id, EthMessage::Blocks(vec![]), now).unwrap();
            assert_eq!(out, vec![(id, EthMessage::GetBlocks(vec![head]))]);
        }
        let out = sync.on_message(&id, EthMessage::Blocks(vec![]), now).unwrap();
        assert!(out.is_empty());
        assert_eq!(sync.peer(&id).unwrap().state(), SyncState::BlocksLack);

        let tick = sync.maintain(now);
        assert_eq!(tick.disconnect, vec![(id, DisconnectReason::UselessPeer)]);
        assert_eq!(sync.peers_len(), 0);
        assert_eq!(sync.queue().hashes_len(), 1);
    }

    #[test]
    fn removed_peer_returns_its_hashes() {
        let mut sync = coordinator(MemoryChain::new());
        let (first, second) = (NodeId::rand(), NodeId::rand());
        let now = Instant::now();
        let head = H256::repeat_byte(7);

        sync.add_peer(first, ahead(5000, head), now).unwrap();
        sync.on_message(&first, EthMessage::BlockHashes(vec![]), now)
            .unwrap();
        assert!(sync.queue().is_empty());

        sync.remove_peer(&first, now);
        assert_eq!(sync.queue().hashes_len(), 1);
        assert_eq!(sync.master(), None);

        // A peer joining during the block phase picks the hash up.
        let out = sync.add_peer(second, ahead(10, head), now).unwrap();
        assert_eq!(out, vec![(second, EthMessage::GetBlocks(vec![head]))]);
    }

    #[test]
    fn stuck_master_is_replaced() {
        let mut sync = coordinator(MemoryChain::new());
        let (first, second) = (NodeId::rand(), NodeId::rand());
        let now = Instant::now();

        sync.add_peer(first, ahead(5000, H256::repeat_byte(1)), now)
            .unwrap();
        assert!(sync
            .add_peer(second, ahead(3000, H256::repeat_byte(2)), now)
            .unwrap()
            .is_empty());
        assert_eq!(sync.master(), Some(first));

        assert_eq!(sync.maintain(now + Duration::from_secs(30)), Tick::default());

        let tick = sync.maintain(now + Duration::from_secs(61));
        assert_eq!(sync.master(), Some(second));
        assert_eq!(
            tick.outbound,
            vec![(
                second,
                EthMessage::GetBlockHashes {
                    hash: H256::repeat_byte(2),
                    max_blocks: 10_000
                }
            )]
        );
    }

    #[test]
    fn master_leaving_elects_the_next_best() {
        let mut sync = coordinator(MemoryChain::new());
        let (first, second) = (NodeId::rand(), NodeId::rand());
        let now = Instant::now();

        sync.add_peer(first, ahead(5000, H256::repeat_byte(1)), now)
            .unwrap();
        sync.add_peer(second, ahead(3000, H256::repeat_byte(2)), now)
            .unwrap();

        let out = sync.remove_peer(&first, now);
        assert_eq!(sync.master(), Some(second));
        assert_eq!(out.len(), 1);

        assert!(sync.remove_peer(&second, now).is_empty());
        assert_eq!(sync.master(), None);
        assert_eq!(sync.phase(), SyncPhase::Idle);
    }

    #[test]
    fn new_block_on_top_is_imported() {
        let mut sync = coordinator(MemoryChain::new());
        let id = NodeId::rand();
        let now = Instant::now();
        sync.add_peer(id, status_of(sync.chain()), now).unwrap();

        let block = branch(&sync.chain().best_block(), 1, 0).remove(0);
        let hash = block.hash();
        let out = sync
            .on_message(
                &id,
                EthMessage::NewBlock {
                    block,
                    total_difficulty: U256::from(1001),
                },
                now,
            )
            .unwrap();

        assert!(out.is_empty());
        assert_eq!(sync.chain().best_hash(), hash);
        assert_eq!(sync.peer(&id).unwrap().best_hash(), hash);
    }

    #[test]
    fn new_block_out_of_reach_starts_a_sync() {
        let mut sync = coordinator(MemoryChain::new());
        let id = NodeId::rand();
        let now = Instant::now();
        sync.add_peer(id, status_of(sync.chain()), now).unwrap();

        let block = Block {
            parent_hash: H256::repeat_byte(3),
            number: 10,
            difficulty: U256::from(1000),
            body: vec![],
        };
        let hash = block.hash();
        let out = sync
            .on_message(
                &id,
                EthMessage::NewBlock {
                    block,
                    total_difficulty: U256::from(10_001),
                },
                now,
            )
            .unwrap();

        assert_eq!(sync.master(), Some(id));
        assert_eq!(
            out,
            vec![(
                id,
                EthMessage::GetBlockHashes {
                    hash,
                    max_blocks: 10_000
                }
            )]
        );
    }

    #[test]
    fn announced_hashes_are_fetched() {
        let mut sync = coordinator(MemoryChain::new());
        let id = NodeId::rand();
        let now = Instant::now();
        sync.add_peer(id, status_of(sync.chain()), now).unwrap();

        let genesis = sync.chain().genesis_hash();
        let out = sync
            .on_message(
                &id,
                EthMessage::NewBlockHashes(vec![genesis, H256::repeat_byte(4)]),
                now,
            )
            .unwrap();

        assert_eq!(
            out,
            vec![(id, EthMessage::GetBlocks(vec![H256::repeat_byte(4)]))]
        );
        assert_eq!(sync.phase(), SyncPhase::Blocks);
    }
}
