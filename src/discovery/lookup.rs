use std::collections::HashSet;

use crate::core::{
    id::{Id, NodeId},
    node::NodeRecord,
    routing_table::RoutingTable,
};

/// A bounded iterative lookup towards a target identifier.
///
/// Each round queries up to `alpha` of the closest nodes not yet queried; the lookup ends after
/// `max_rounds` rounds or as soon as a round finds no untried node. NEIGHBOURS responses feed the
/// table between rounds, so later rounds see the nodes discovered by earlier ones.
///
/// Running out of untried nodes is how "a round found no new nodes" shows up here: nodes learnt
/// from a round land in the table as untried candidates for the next one.
#[derive(Debug, Clone)]
pub struct Lookup {
    target: NodeId,
    key: Id,
    alpha: usize,
    max_rounds: usize,
    round: usize,
    tried: HashSet<String>,
    done: bool,
}

impl Lookup {
    pub fn new(target: NodeId, alpha: usize, max_rounds: usize) -> Self {
        Self {
            target,
            key: target.key(),
            alpha,
            max_rounds,
            round: 0,
            tried: HashSet::new(),
            done: false,
        }
    }

    pub fn target(&self) -> NodeId {
        self.target
    }

    /// The number of rounds run so far.
    pub fn round(&self) -> usize {
        self.round
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Selects the nodes to query in the next round, or `None` once the lookup is over.
    pub fn next_round(&mut self, table: &RoutingTable) -> Option<Vec<NodeRecord>> {
        if self.done || self.round >= self.max_rounds {
            self.done = true;
            return None;
        }

        let candidates: Vec<_> = table
            .closest_nodes(&self.key, table.len())
            .into_iter()
            .filter(|node| !self.tried.contains(&node.handler_key()))
            .take(self.alpha)
            .collect();

        if candidates.is_empty() {
            self.done = true;
            return None;
        }

        for node in &candidates {
            self.tried.insert(node.handler_key());
        }
        self.round += 1;

        Some(candidates)
    }
}
