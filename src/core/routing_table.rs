use std::collections::VecDeque;

use crate::core::{id::Id, node::NodeRecord};

/// The maximum number of nodes held in a single bucket.
pub const BUCKET_SIZE: usize = 16;

/// The number of buckets, one per bit of the key space.
pub const BUCKETS: usize = Id::BITS;

/// The Kademlia routing table: 256 buckets of nodes sharded by the log2 of their XOR distance to
/// the local node.
///
/// Buckets are ordered least-recently-seen first. The table never evicts on its own: adding a
/// node to a full bucket hands back the eviction candidate for the caller to challenge.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    // The local node, never inserted.
    local_node: NodeRecord,
    buckets: Vec<VecDeque<NodeRecord>>,
    // Every held node, in insertion order.
    nodes: Vec<NodeRecord>,
}

impl RoutingTable {
    /// Creates an empty table for the local node.
    pub fn new(local_node: NodeRecord) -> Self {
        Self {
            local_node,
            buckets: vec![VecDeque::new(); BUCKETS],
            nodes: vec![],
        }
    }

    /// Returns the local node.
    pub fn local_node(&self) -> &NodeRecord {
        &self.local_node
    }

    /// Returns the bucket index of a node.
    pub fn bucket_index(&self, node: &NodeRecord) -> usize {
        self.local_node.key().bucket_index(&node.key())
    }

    /// Returns the nodes in a bucket, least-recently-seen first.
    pub fn bucket(&self, i: usize) -> impl Iterator<Item = &NodeRecord> {
        self.buckets.get(i).into_iter().flatten()
    }

    /// Adds a node to its bucket.
    ///
    /// Returns `None` if the node was inserted, already held (it is then marked as seen) or is
    /// the local node (which is never inserted). If the bucket is full, returns its
    /// least-recently-seen node without modifying the bucket.
    pub fn add_node(&mut self, node: NodeRecord) -> Option<NodeRecord> {
        if node.id() == self.local_node.id() {
            return None;
        }

        let i = self.bucket_index(&node);
        let bucket = &mut self.buckets[i];

        if let Some(pos) = bucket.iter().position(|entry| entry == &node) {
            if let Some(entry) = bucket.remove(pos) {
                bucket.push_back(entry);
            }
            return None;
        }

        if bucket.len() >= BUCKET_SIZE {
            debug_assert_eq!(bucket.len(), BUCKET_SIZE);
            return bucket.front().cloned();
        }

        bucket.push_back(node.clone());
        self.nodes.push(node);

        None
    }

    /// Removes a node from the table, returning `true` if it was present.
    pub fn drop_node(&mut self, node: &NodeRecord) -> bool {
        let i = self.bucket_index(node);
        let bucket = &mut self.buckets[i];

        match bucket.iter().position(|entry| entry == node) {
            Some(pos) => {
                bucket.remove(pos);
                self.nodes.retain(|entry| entry != node);
                true
            }
            None => false,
        }
    }

    /// Marks a held node as the most-recently-seen in its bucket, returning `false` if the node
    /// isn't held.
    pub fn touch_node(&mut self, node: &NodeRecord) -> bool {
        let i = self.bucket_index(node);
        let bucket = &mut self.buckets[i];

        match bucket.iter().position(|entry| entry == node) {
            Some(pos) => {
                if let Some(entry) = bucket.remove(pos) {
                    bucket.push_back(entry);
                }
                true
            }
            None => false,
        }
    }

    /// Returns `true` if the node is held.
    pub fn contains(&self, node: &NodeRecord) -> bool {
        self.buckets[self.bucket_index(node)]
            .iter()
            .any(|entry| entry == node)
    }

    /// Returns up to `k` held nodes sorted by ascending XOR distance to the target.
    ///
    /// Nodes at the same distance keep their insertion order.
    pub fn closest_nodes(&self, target: &Id, k: usize) -> Vec<NodeRecord> {
        let mut nodes: Vec<_> = self.nodes.iter().collect();
        // Stable sort, ties stay in insertion order.
        nodes.sort_by_cached_key(|node| node.key().distance(target));
        nodes.truncate(k);

        nodes.into_iter().cloned().collect()
    }

    /// Returns every held node in insertion order.
    pub fn nodes(&self) -> &[NodeRecord] {
        &self.nodes
    }

    /// The number of held nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The number of non-empty buckets.
    pub fn buckets_count(&self) -> usize {
        self.buckets.iter().filter(|bucket| !bucket.is_empty()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::id::NodeId;

    fn node(port: u16) -> NodeRecord {
        NodeRecord::new(NodeId::rand(), "127.0.0.1", port)
    }

    // Generates `n` nodes landing in the same bucket of the table.
    fn nodes_in_bucket(table: &RoutingTable, bucket: usize, n: usize) -> Vec<NodeRecord> {
        let mut nodes = vec![];
        let mut port = 1;
        while nodes.len() < n {
            let candidate = node(port);
            port += 1;
            if table.bucket_index(&candidate) == bucket {
                nodes.push(candidate);
            }
        }

        nodes
    }

    #[test]
    fn add_to_empty_table() {
        let mut table = RoutingTable::new(node(0));
        let a = node(1);

        assert!(table.add_node(a.clone()).is_none());
        assert!(table.contains(&a));
        assert_eq!(table.len(), 1);
        assert_eq!(table.buckets_count(), 1);
    }

    #[test]
    fn add_self() {
        let local = node(0);
        let mut table = RoutingTable::new(local.clone());

        assert!(table.add_node(local.clone()).is_none());
        assert!(!table.contains(&local));
        assert!(table.is_empty());
    }

    #[test]
    fn add_duplicate() {
        let mut table = RoutingTable::new(node(0));
        let a = node(1);

        assert!(table.add_node(a.clone()).is_none());
        assert!(table.add_node(a.clone()).is_none());
        assert_eq!(table.len(), 1);
        assert_eq!(table.bucket(table.bucket_index(&a)).count(), 1);
    }

    #[test]
    fn full_bucket_returns_eviction_candidate() {
        let mut table = RoutingTable::new(node(0));
        // Half of the key space lands in the last bucket.
        let nodes = nodes_in_bucket(&table, 255, BUCKET_SIZE + 1);

        for node in &nodes[..BUCKET_SIZE] {
            assert!(table.add_node(node.clone()).is_none());
        }

        let challenger = nodes[BUCKET_SIZE].clone();
        let candidate = table.add_node(challenger.clone());
        // The least recently seen node is the first inserted.
        assert_eq!(candidate.as_ref(), Some(&nodes[0]));
        // The bucket is untouched.
        assert!(!table.contains(&challenger));
        assert_eq!(table.bucket(255).count(), BUCKET_SIZE);
        assert_eq!(table.bucket(255).next(), Some(&nodes[0]));
    }

    #[test]
    fn touch_changes_eviction_candidate() {
        let mut table = RoutingTable::new(node(0));
        let nodes = nodes_in_bucket(&table, 255, BUCKET_SIZE + 1);

        for node in &nodes[..BUCKET_SIZE] {
            table.add_node(node.clone());
        }

        assert!(table.touch_node(&nodes[0]));
        assert_eq!(table.add_node(nodes[BUCKET_SIZE].clone()), Some(nodes[1].clone()));
        assert!(!table.touch_node(&nodes[BUCKET_SIZE]));
    }

    #[test]
    fn drop_node_is_idempotent() {
        let mut table = RoutingTable::new(node(0));
        let a = node(1);
        table.add_node(a.clone());

        assert!(table.drop_node(&a));
        assert!(!table.drop_node(&a));
        assert!(table.is_empty());
        assert!(table.nodes().is_empty());
    }

    #[test]
    fn bucket_invariants_hold() {
        let mut table = RoutingTable::new(node(0));

        for port in 1..=500 {
            table.add_node(node(port));
        }

        for i in 0..BUCKETS {
            let bucket: Vec<_> = table.bucket(i).collect();
            assert!(bucket.len() <= BUCKET_SIZE);
            for node in bucket {
                assert_eq!(table.bucket_index(node), i);
            }
        }
    }

    #[test]
    fn closest_nodes_are_sorted() {
        let mut table = RoutingTable::new(node(0));
        for port in 1..=50 {
            table.add_node(node(port));
        }

        let target = NodeId::rand().key();
        let closest = table.closest_nodes(&target, BUCKET_SIZE);

        assert_eq!(closest.len(), BUCKET_SIZE.min(table.len()));
        for pair in closest.windows(2) {
            assert!(pair[0].key().distance(&target) <= pair[1].key().distance(&target));
        }
    }

    #[test]
    fn closest_nodes_bounded_by_held() {
        let mut table = RoutingTable::new(node(0));
        assert!(table.closest_nodes(&NodeId::rand().key(), 16).is_empty());

        table.add_node(node(1));
        table.add_node(node(2));
        assert_eq!(table.closest_nodes(&NodeId::rand().key(), 16).len(), 2);
    }

    #[test]
    fn closest_nodes_ties_keep_insertion_order() {
        let mut table = RoutingTable::new(node(0));
        let id = NodeId::rand();
        // Same identifier, different endpoints: same distance to any target.
        let a = NodeRecord::new(id, "127.0.0.1", 1);
        let b = NodeRecord::new(id, "127.0.0.1", 2);
        table.add_node(a.clone());
        table.add_node(b.clone());

        assert_eq!(table.closest_nodes(&NodeId::rand().key(), 16), vec![a, b]);
    }
}
