use std::fmt;

use crate::core::{node::NodeRecord, statistics::NodeStatistics, timer::TimerToken};

/// The lifecycle of a remote node as seen by discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Just seen (in a NEIGHBOURS entry or through an inbound PING), pinged and awaiting a PONG.
    Discovered,
    /// Didn't answer the PING in time. Terminal.
    Dead,
    /// Answered and is a candidate for the table, possibly challenging a table entry.
    Alive,
    /// Held in the routing table.
    Active,
    /// Held in the routing table and being challenged by a newcomer: it must answer a fresh PING
    /// to keep its slot.
    EvictCandidate,
    /// Lost a challenge, or a challenger whose target survived. Terminal.
    NonActive,
}

impl State {
    /// Returns `true` if the node is (still) held in the routing table in this state.
    pub fn in_table(self) -> bool {
        matches!(self, State::Active | State::EvictCandidate)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, State::Dead | State::NonActive)
    }
}

/// Per-node discovery state, owned by the [`DiscoveryManager`](super::DiscoveryManager).
///
/// Handlers refer to each other by handler key, never by reference.
#[derive(Debug)]
pub struct NodeHandler {
    pub(crate) node: NodeRecord,
    pub(crate) state: State,
    pub(crate) waiting_for_pong: bool,
    // PINGs left before a missed PONG becomes final.
    pub(crate) ping_trials: u32,
    // The handler challenging this one for its table slot.
    pub(crate) replace_candidate: Option<String>,
    pub(crate) ping_timer: Option<TimerToken>,
    pub(crate) retry_timer: Option<TimerToken>,
    pub(crate) stats: NodeStatistics,
}

impl NodeHandler {
    pub(crate) fn new(node: NodeRecord) -> Self {
        Self {
            node,
            state: State::Discovered,
            waiting_for_pong: false,
            ping_trials: 0,
            replace_candidate: None,
            ping_timer: None,
            retry_timer: None,
            stats: NodeStatistics::new(),
        }
    }

    pub fn node(&self) -> &NodeRecord {
        &self.node
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_waiting_for_pong(&self) -> bool {
        self.waiting_for_pong
    }

    /// The key of the handler challenging this one, if any.
    pub fn replace_candidate(&self) -> Option<&str> {
        self.replace_candidate.as_deref()
    }

    pub fn statistics(&self) -> &NodeStatistics {
        &self.stats
    }

    pub(crate) fn timers(&mut self) -> impl Iterator<Item = TimerToken> {
        self.ping_timer.take().into_iter().chain(self.retry_timer.take())
    }
}

impl fmt::Display for NodeHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = if self.node.is_discovery_node() {
            "empty".to_string()
        } else {
            self.node.id().short()
        };

        write!(
            f,
            "NodeHandler[state: {:?}, node: {}, id: {}]",
            self.state,
            self.node.handler_key(),
            id
        )
    }
}
