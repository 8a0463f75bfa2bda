use std::collections::{HashMap, HashSet};

use tracing::*;

use crate::{core::node::NodeRecord, discovery::handler::State};

/// Decides which discovered nodes to open a peering session against.
///
/// Nodes entering [`State::Alive`] or [`State::Active`] become connection candidates once; they
/// stay candidates (and are never queued again) until their session terminates. Queued nodes are
/// handed out highest reputation first, with reputations read at selection time since they change
/// while nodes wait.
#[derive(Debug, Default)]
pub struct Admission {
    // Handler keys of every node queued or being connected to.
    candidates: HashSet<String>,
    // Nodes waiting for a connection attempt.
    pending: HashMap<String, NodeRecord>,
}

impl Admission {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reacts to a node's state change, returning `true` if the node was queued.
    pub fn node_status_changed(&mut self, node: &NodeRecord, to: State) -> bool {
        if !matches!(to, State::Alive | State::Active) || node.is_discovery_node() {
            return false;
        }

        let key = node.handler_key();
        if !self.candidates.insert(key.clone()) {
            return false;
        }

        trace!("queued {} for a connection attempt", node);
        self.pending.insert(key, node.clone());

        true
    }

    /// Takes the queued node with the highest reputation.
    pub fn next_candidate<F>(&mut self, reputation: F) -> Option<NodeRecord>
    where
        F: Fn(&NodeRecord) -> i64,
    {
        let key = self
            .pending
            .iter()
            .max_by_key(|(_, node)| reputation(node))
            .map(|(key, _)| key.clone())?;

        self.pending.remove(&key)
    }

    /// Releases a node once its session is over so it can be retried later.
    pub fn session_terminated(&mut self, node: &NodeRecord) {
        let key = node.handler_key();
        self.pending.remove(&key);
        self.candidates.remove(&key);
    }

    pub fn is_candidate(&self, node: &NodeRecord) -> bool {
        self.candidates.contains(&node.handler_key())
    }

    /// The number of nodes waiting for a connection attempt.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
