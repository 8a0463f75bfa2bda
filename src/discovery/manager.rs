use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    time::Instant,
};

use primitive_types::H256;
use time::OffsetDateTime;
use tracing::*;

use crate::{
    config::DiscoveryConfig,
    core::{
        id::NodeId,
        message::{
            Endpoint, FindNode, Message, Neighbour, Neighbours, Ping, Pong, DISCOVERY_VERSION,
        },
        node::NodeRecord,
        routing_table::{RoutingTable, BUCKET_SIZE},
        statistics::NodeStatistics,
        timer::Scheduler,
    },
    discovery::{
        handler::{NodeHandler, State},
        lookup::Lookup,
        packet::{self, InboundPacket},
    },
};

/// The maximum number of entries in a single NEIGHBOURS packet, keeping it under the UDP size
/// limit.
pub const NEIGHBOURS_PER_PACKET: usize = 12;

/// Side effects requested by the [`DiscoveryManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Send a message to a node.
    Send { node: NodeRecord, message: Message },
    /// A node's handler changed state.
    StateChanged {
        node: NodeRecord,
        from: State,
        to: State,
    },
}

#[derive(Debug)]
enum Timer {
    PingTimeout(String),
    RetryAdmission(String),
}

/// The discovery state machine.
///
/// Owns the routing table and every node handler, keyed by `host:port`. It performs no I/O and
/// never reads the clock for its timers: callers pass the current instant in and carry out the
/// returned [`Action`]s, and must call [`poll_timers`](DiscoveryManager::poll_timers) once
/// [`next_deadline`](DiscoveryManager::next_deadline) has passed. Every table mutation happens
/// within a single `&mut self` call, so wrapping the manager in a lock serialises them.
#[derive(Debug)]
pub struct DiscoveryManager {
    config: DiscoveryConfig,
    home_node: NodeRecord,
    table: RoutingTable,
    handlers: HashMap<String, NodeHandler>,
    timers: Scheduler<Timer>,
}

impl DiscoveryManager {
    /// Creates a manager for the local (home) node.
    pub fn new(home_node: NodeRecord, config: DiscoveryConfig) -> Self {
        Self {
            config,
            table: RoutingTable::new(home_node.clone()),
            home_node,
            handlers: HashMap::new(),
            timers: Scheduler::new(),
        }
    }

    pub fn local_node(&self) -> &NodeRecord {
        &self.home_node
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    /// Returns the handler of a node, if one exists.
    pub fn handler(&self, node: &NodeRecord) -> Option<&NodeHandler> {
        self.handlers.get(&node.handler_key())
    }

    /// Returns every handler.
    pub fn handlers(&self) -> impl Iterator<Item = &NodeHandler> {
        self.handlers.values()
    }

    /// The number of handlers.
    pub fn handlers_len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns the statistics of a node, if it has a handler.
    pub fn statistics_mut(&mut self, node: &NodeRecord) -> Option<&mut NodeStatistics> {
        self.handlers
            .get_mut(&node.handler_key())
            .map(|handler| &mut handler.stats)
    }

    /// Returns the statistics of the node holding the identifier, if it has a handler.
    pub fn statistics_by_id_mut(&mut self, id: &NodeId) -> Option<&mut NodeStatistics> {
        self.handlers
            .values_mut()
            .find(|handler| handler.node.id() == *id)
            .map(|handler| &mut handler.stats)
    }

    /// Returns the reputation of a node, 0 if it has no handler.
    pub fn reputation(&self, node: &NodeRecord) -> i64 {
        self.handler(node)
            .map(|handler| handler.stats.reputation())
            .unwrap_or(0)
    }

    /// Returns the earliest pending timer deadline.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Returns the handler of a node, creating it (and pinging the node) if it doesn't exist.
    ///
    /// Returns `None` for the local node, which never gets a handler.
    pub fn get_or_create_handler(
        &mut self,
        node: NodeRecord,
        now: Instant,
        actions: &mut Vec<Action>,
    ) -> Option<&NodeHandler> {
        let key = self.ensure_handler(node, now, actions)?;
        self.handlers.get(&key)
    }

    /// Starts discovery from the supplied boot nodes.
    pub fn add_boot_nodes(&mut self, nodes: Vec<NodeRecord>, now: Instant) -> Vec<Action> {
        let mut actions = vec![];
        for node in nodes {
            self.ensure_handler(node, now, &mut actions);
        }

        actions
    }

    /// Flags the supplied nodes as predefined peers.
    pub fn add_predefined(&mut self, nodes: Vec<NodeRecord>, now: Instant) -> Vec<Action> {
        let mut actions = vec![];
        for node in nodes {
            if let Some(key) = self.ensure_handler(node, now, &mut actions) {
                if let Some(handler) = self.handlers.get_mut(&key) {
                    handler.stats.predefined = true;
                }
            }
        }

        actions
    }

    // INBOUND

    /// Dispatches an authenticated inbound packet to the sender's handler.
    pub fn handle_inbound(
        &mut self,
        packet: InboundPacket,
        sender: SocketAddr,
        now: Instant,
    ) -> Vec<Action> {
        let mut actions = vec![];
        let node = NodeRecord::from_socket_addr(packet.node_id, sender);

        if node.id() == self.home_node.id() {
            trace!("ignoring {} from self", packet.message.variant_as_str());
            return actions;
        }

        if self.config.inbound_only_from_known_nodes
            && !self.handlers.contains_key(&node.handler_key())
        {
            debug!(
                "inbound {} from unknown {} rejected",
                packet.message.variant_as_str(),
                sender
            );
            return actions;
        }

        let key = match self.ensure_handler(node, now, &mut actions) {
            Some(key) => key,
            None => return actions,
        };

        if let Some(handler) = self.handlers.get(&key) {
            trace!("===> ({}) {} [{}]", sender, packet.message.variant_as_str(), handler);

            // Fresh contact from a node held in the table.
            if handler.state.in_table() {
                self.table.touch_node(&handler.node);
            }
        }

        match packet.message {
            Message::Ping(_) => self.handle_ping(&key, packet.hash, sender, &mut actions),
            Message::Pong(_) => self.handle_pong(&key, now, &mut actions),
            Message::FindNode(find_node) => {
                self.handle_find_node(&key, find_node.target, &mut actions)
            }
            Message::Neighbours(neighbours) => {
                self.handle_neighbours(&key, neighbours, now, &mut actions)
            }
        }

        actions
    }

    fn handle_ping(
        &mut self,
        key: &str,
        hash: H256,
        sender: SocketAddr,
        actions: &mut Vec<Action>,
    ) {
        let handler = match self.handlers.get_mut(key) {
            Some(handler) => handler,
            None => return,
        };

        handler.stats.discover_in_ping += 1;
        handler.stats.discover_out_pong += 1;

        actions.push(Action::Send {
            node: handler.node.clone(),
            message: Message::Pong(Pong {
                to: Endpoint::new(sender),
                echo: hash,
                expiration: packet::expiration(),
            }),
        });
    }

    fn handle_pong(&mut self, key: &str, now: Instant, actions: &mut Vec<Action>) {
        let handler = match self.handlers.get_mut(key) {
            Some(handler) => handler,
            None => return,
        };

        if !handler.waiting_for_pong {
            trace!("unsolicited pong from {}", handler);
            return;
        }

        handler.waiting_for_pong = false;
        handler.stats.discover_in_pong += 1;
        handler.stats.last_pong = Some(OffsetDateTime::now_utc());
        if let Some(token) = handler.ping_timer.take() {
            self.timers.cancel(token);
        }

        let state = handler.state;
        match state {
            State::Discovered => self.change_state(key, State::Alive, now, actions),
            State::EvictCandidate => {
                // Survived the challenge: keep the slot, the challenger retires.
                let challenger = handler.replace_candidate.take();
                self.table.touch_node(&handler.node);
                self.change_state(key, State::Active, now, actions);

                if let Some(challenger) = challenger {
                    self.change_state(&challenger, State::NonActive, now, actions);
                }
            }
            _ => {}
        }
    }

    fn handle_find_node(&mut self, key: &str, target: NodeId, actions: &mut Vec<Action>) {
        let mut closest = self.table.closest_nodes(&target.key(), BUCKET_SIZE);
        if self.config.public_home_node {
            if closest.len() == BUCKET_SIZE {
                closest.pop();
            }
            closest.push(self.home_node.clone());
        }

        let handler = match self.handlers.get_mut(key) {
            Some(handler) => handler,
            None => return,
        };
        handler.stats.discover_in_find += 1;

        let mut chunks: Vec<_> = closest.chunks(NEIGHBOURS_PER_PACKET).collect();
        if chunks.is_empty() {
            chunks.push(&[]);
        }

        for chunk in chunks {
            handler.stats.discover_out_neighbours += 1;
            actions.push(Action::Send {
                node: handler.node.clone(),
                message: Message::Neighbours(Neighbours {
                    nodes: chunk.iter().map(Neighbour::from_node).collect(),
                    expiration: packet::expiration(),
                }),
            });
        }
    }

    fn handle_neighbours(
        &mut self,
        key: &str,
        neighbours: Neighbours,
        now: Instant,
        actions: &mut Vec<Action>,
    ) {
        if let Some(handler) = self.handlers.get_mut(key) {
            handler.stats.discover_in_neighbours += 1;
        }

        // Known nodes keep their handler and aren't pinged again.
        for neighbour in neighbours.nodes {
            self.ensure_handler(neighbour.to_node(), now, actions);
        }
    }

    // TIMERS

    /// Fires every timer whose deadline is at or before `now`.
    pub fn poll_timers(&mut self, now: Instant) -> Vec<Action> {
        let mut actions = vec![];

        for timer in self.timers.pop_expired(now) {
            match timer {
                Timer::PingTimeout(key) => self.handle_ping_timeout(&key, now, &mut actions),
                Timer::RetryAdmission(key) => {
                    let state = match self.handlers.get_mut(&key) {
                        Some(handler) => {
                            handler.retry_timer = None;
                            handler.state
                        }
                        None => continue,
                    };

                    if state == State::Alive {
                        self.change_state(&key, State::Alive, now, &mut actions);
                    }
                }
            }
        }

        actions
    }

    fn handle_ping_timeout(&mut self, key: &str, now: Instant, actions: &mut Vec<Action>) {
        let handler = match self.handlers.get_mut(key) {
            Some(handler) => handler,
            None => return,
        };

        handler.ping_timer = None;
        if !handler.waiting_for_pong {
            return;
        }

        handler.waiting_for_pong = false;
        handler.ping_trials = handler.ping_trials.saturating_sub(1);
        if handler.ping_trials > 0 {
            trace!("pong timed out, pinging {} again", handler);
            self.send_ping(key, now, actions);
            return;
        }

        let state = handler.state;
        match state {
            State::Discovered => self.change_state(key, State::Dead, now, actions),
            State::EvictCandidate => self.change_state(key, State::NonActive, now, actions),
            _ => {}
        }
    }

    // LOOKUPS

    /// Creates a lookup towards the target with the configured width and depth.
    pub fn lookup(&self, target: NodeId) -> Lookup {
        Lookup::new(target, self.config.alpha, self.config.max_lookup_rounds)
    }

    /// Runs the next round of a lookup, returning the FIND_NODE messages to send (none once the
    /// lookup is over).
    pub fn lookup_round(&mut self, lookup: &mut Lookup) -> Vec<Action> {
        let nodes = match lookup.next_round(&self.table) {
            Some(nodes) => nodes,
            None => return vec![],
        };

        let target = lookup.target();
        nodes
            .iter()
            .filter_map(|node| self.find_node(node, target))
            .collect()
    }

    /// Builds a FIND_NODE message for a node with a handler.
    pub fn find_node(&mut self, node: &NodeRecord, target: NodeId) -> Option<Action> {
        let handler = self.handlers.get_mut(&node.handler_key())?;
        handler.stats.discover_out_find += 1;

        Some(Action::Send {
            node: handler.node.clone(),
            message: Message::FindNode(FindNode {
                target,
                expiration: packet::expiration(),
            }),
        })
    }

    // QUERIES

    /// Returns the handlers whose reputation is at least `min_reputation`.
    pub fn nodes(&self, min_reputation: i64) -> Vec<&NodeHandler> {
        self.handlers
            .values()
            .filter(|handler| handler.stats.reputation() >= min_reputation)
            .collect()
    }

    /// Returns up to `limit` handlers matching the filter, highest announced total difficulty
    /// first.
    pub fn best_nodes<F>(&self, filter: F, limit: usize) -> Vec<&NodeHandler>
    where
        F: Fn(&NodeHandler) -> bool,
    {
        let mut nodes: Vec<_> = self
            .handlers
            .values()
            .filter(|handler| filter(handler))
            .collect();
        nodes.sort_by(|a, b| {
            b.stats
                .eth_total_difficulty
                .cmp(&a.stats.eth_total_difficulty)
        });
        nodes.truncate(limit);

        nodes
    }

    /// Renders the statistics of every node with a positive reputation, best first.
    pub fn dump_statistics(&self) -> String {
        let mut handlers: Vec<_> = self
            .handlers
            .values()
            .map(|handler| (handler.stats.reputation(), handler))
            .collect();
        handlers.sort_by(|a, b| b.0.cmp(&a.0));

        let mut dump = String::new();
        let mut zero_reputation = 0;
        for (reputation, handler) in handlers {
            if reputation > 0 {
                dump.push_str(&format!("{}\t{}\n", handler, handler.stats));
            } else {
                zero_reputation += 1;
            }
        }
        dump.push_str(&format!("0 reputation: {zero_reputation} nodes.\n"));

        dump
    }

    // STATE MACHINE

    fn ensure_handler(
        &mut self,
        node: NodeRecord,
        now: Instant,
        actions: &mut Vec<Action>,
    ) -> Option<String> {
        if node.id() == self.home_node.id() {
            return None;
        }

        let key = node.handler_key();
        if let Some(handler) = self.handlers.get_mut(&key) {
            if handler.node.is_discovery_node() && !node.is_discovery_node() {
                // Same endpoint, now with its real identifier.
                debug!("found the identifier of discovery endpoint {}", node);
                handler.node = node;
            }

            return Some(key);
        }

        self.trim_handlers();

        let handler = NodeHandler::new(node);
        debug!("+++ new node {}", handler);
        self.handlers.insert(key.clone(), handler);
        self.start_pinging(&key, now, actions);

        Some(key)
    }

    // Drops the lowest-reputation handlers once the threshold is exceeded. Handlers in or
    // contending for the table are kept.
    fn trim_handlers(&mut self) {
        if self.handlers.len() <= self.config.nodes_trim_threshold {
            return;
        }

        let challengers: HashSet<&str> = self
            .handlers
            .values()
            .filter_map(|handler| handler.replace_candidate())
            .collect();

        let mut candidates: Vec<(i64, String)> = self
            .handlers
            .iter()
            .filter(|(key, handler)| {
                !handler.state.in_table()
                    && handler.state != State::Alive
                    && !challengers.contains(key.as_str())
            })
            .map(|(key, handler)| (handler.stats.reputation(), key.clone()))
            .collect();
        candidates.sort();

        let excess = self.handlers.len().saturating_sub(self.config.max_nodes);
        let mut trimmed = 0;
        for (_, key) in candidates.into_iter().take(excess) {
            if let Some(mut handler) = self.handlers.remove(&key) {
                for token in handler.timers() {
                    self.timers.cancel(token);
                }
                trimmed += 1;
            }
        }

        debug!(
            "trimmed {} node handlers, {} left",
            trimmed,
            self.handlers.len()
        );
    }

    fn start_pinging(&mut self, key: &str, now: Instant, actions: &mut Vec<Action>) {
        if let Some(handler) = self.handlers.get_mut(key) {
            handler.ping_trials = self.config.ping_trials.max(1);
        }

        self.send_ping(key, now, actions);
    }

    fn send_ping(&mut self, key: &str, now: Instant, actions: &mut Vec<Action>) {
        let handler = match self.handlers.get_mut(key) {
            Some(handler) => handler,
            None => return,
        };

        if let Some(token) = handler.ping_timer.take() {
            self.timers.cancel(token);
        }

        handler.waiting_for_pong = true;
        handler.stats.discover_out_ping += 1;
        handler.ping_timer = Some(self.timers.schedule(
            now + self.config.ping_timeout(),
            Timer::PingTimeout(key.to_string()),
        ));

        actions.push(Action::Send {
            node: handler.node.clone(),
            message: Message::Ping(Ping {
                version: DISCOVERY_VERSION,
                from: Endpoint::from_node(&self.home_node),
                to: Endpoint::from_node(&handler.node),
                expiration: packet::expiration(),
            }),
        });
    }

    fn change_state(&mut self, key: &str, new_state: State, now: Instant, actions: &mut Vec<Action>) {
        let (old_state, node) = match self.handlers.get(key) {
            Some(handler) => (handler.state, handler.node.clone()),
            None => return,
        };

        let mut new_state = new_state;

        // Nodes without an identifier never enter the table.
        if !node.is_discovery_node() {
            match new_state {
                State::Alive => {
                    // Published before admission so that Alive is always observed.
                    self.set_state(key, State::Alive, actions);
                    if self.admit(key, &node, now, actions) {
                        new_state = State::Active;
                    }
                }
                State::Active if old_state == State::Alive => {
                    // Won a challenge, take the freed slot.
                    if let Some(candidate) = self.table.add_node(node.clone()) {
                        debug!("{} lost its slot to {} again", node, candidate);
                        new_state = State::Alive;
                        self.schedule_retry(key, now);
                    }
                }
                State::NonActive if old_state == State::EvictCandidate => {
                    // Lost the challenge: free the slot and let the challenger take it.
                    self.table.drop_node(&node);
                    let challenger = self
                        .handlers
                        .get_mut(key)
                        .and_then(|handler| handler.replace_candidate.take());

                    self.set_state(key, State::NonActive, actions);
                    if let Some(challenger) = challenger {
                        self.change_state(&challenger, State::Active, now, actions);
                    }

                    return;
                }
                _ => {}
            }
        }

        if new_state == State::EvictCandidate {
            // Prove liveness to keep the slot.
            self.start_pinging(key, now, actions);
        }

        self.set_state(key, new_state, actions);
    }

    // Tries to place an alive node in the table, returning `true` if the table now holds it.
    fn admit(
        &mut self,
        key: &str,
        node: &NodeRecord,
        now: Instant,
        actions: &mut Vec<Action>,
    ) -> bool {
        let candidate = match self.table.add_node(node.clone()) {
            Some(candidate) => candidate,
            None => return true,
        };

        let candidate_key = candidate.handler_key();
        debug_assert!(
            self.handlers.contains_key(&candidate_key),
            "table entry without a handler"
        );

        match self.handlers.get(&candidate_key).map(|handler| handler.state) {
            Some(State::EvictCandidate) => {
                // Don't challenge twice, retry once the running challenge is settled.
                debug!("{} is already being challenged, {} will retry", candidate, node);
                self.schedule_retry(key, now);
            }
            Some(_) => {
                if let Some(handler) = self.handlers.get_mut(&candidate_key) {
                    handler.replace_candidate = Some(key.to_string());
                }
                self.change_state(&candidate_key, State::EvictCandidate, now, actions);
            }
            None => {
                error!("{} is held in the table without a handler, dropping it", candidate);
                self.table.drop_node(&candidate);

                return self.admit(key, node, now, actions);
            }
        }

        false
    }

    fn schedule_retry(&mut self, key: &str, now: Instant) {
        let handler = match self.handlers.get_mut(key) {
            Some(handler) => handler,
            None => return,
        };

        if let Some(token) = handler.retry_timer.take() {
            self.timers.cancel(token);
        }
        handler.retry_timer = Some(self.timers.schedule(
            now + self.config.ping_timeout(),
            Timer::RetryAdmission(key.to_string()),
        ));
    }

    fn set_state(&mut self, key: &str, state: State, actions: &mut Vec<Action>) {
        let handler = match self.handlers.get_mut(key) {
            Some(handler) => handler,
            None => return,
        };

        let from = handler.state;
        handler.state = state;

        if state.is_terminal() {
            handler.waiting_for_pong = false;
            handler.replace_candidate = None;
            for token in handler.timers() {
                self.timers.cancel(token);
            }
        }

        if from != state {
            trace!("state change {:?} -> {:?}: {}", from, state, handler);
            actions.push(Action::StateChanged {
                node: handler.node.clone(),
                from,
                to: state,
            });
        }
    }
}
