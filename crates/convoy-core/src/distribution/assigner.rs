//! Consistent-hash assignment of keys to nodes

use std::collections::{BTreeSet, HashMap};

use blake2::{Blake2b512, Digest};
use parking_lot::RwLock;

use crate::error::DistributionError;

/// Virtual points per node
const REPLICATION_FACTOR: usize = 10;

/// First 8 bytes of the BLAKE2b-512 digest, little endian.
fn hash(data: &str) -> u64 {
    let digest = Blake2b512::digest(data.as_bytes());
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(buf)
}

/// Hash ring, not synchronized; see [`Assigner`] for the shared variant.
#[derive(Debug, Clone, Default)]
pub struct Ring {
    points: Vec<u64>,
    owners: HashMap<u64, String>,
    nodes: BTreeSet<String>,
}

impl Ring {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the node is already present.
    pub fn add_node(&mut self, node_id: &str) -> bool {
        if !self.nodes.insert(node_id.to_string()) {
            return false;
        }
        for i in 0..REPLICATION_FACTOR {
            let point = hash(&format!("{}{}", node_id, i));
            self.owners.insert(point, node_id.to_string());
            self.points.push(point);
        }
        self.points.sort_unstable();
        true
    }

    /// Returns `false` if the node is unknown.
    pub fn remove_node(&mut self, node_id: &str) -> bool {
        if !self.nodes.remove(node_id) {
            return false;
        }
        for i in 0..REPLICATION_FACTOR {
            let point = hash(&format!("{}{}", node_id, i));
            self.owners.remove(&point);
            if let Ok(idx) = self.points.binary_search(&point) {
                self.points.remove(idx);
            }
        }
        true
    }

    pub fn clear(&mut self) {
        self.points.clear();
        self.owners.clear();
        self.nodes.clear();
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains(node_id)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(String::as_str)
    }

    /// Owner of the first point at or after the key hash, wrapping around.
    pub fn get(&self, key: &str) -> Option<&str> {
        if self.points.is_empty() {
            return None;
        }
        let h = hash(key);
        let idx = self.points.partition_point(|p| *p < h);
        let point = self.points.get(idx).unwrap_or(&self.points[0]);
        self.owners.get(point).map(String::as_str)
    }
}

/// Assigns keys to nodes, from the point of view of one node.
///
/// Reads and mutations are serialized by one reader/writer lock; mutations
/// batched through [`Assigner::update`] are atomic for readers.
#[derive(Debug)]
pub struct Assigner {
    node_id: String,
    ring: RwLock<Ring>,
}

impl Assigner {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            ring: RwLock::new(Ring::new()),
        }
    }

    /// ID of the local node.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn node_for(&self, key: &str) -> Result<String, DistributionError> {
        self.ring
            .read()
            .get(key)
            .map(str::to_string)
            .ok_or(DistributionError::NoNodes)
    }

    /// True if the local node owns the key; false also when there are no nodes.
    pub fn is_owner(&self, key: &str) -> bool {
        self.ring.read().get(key) == Some(self.node_id.as_str())
    }

    /// Sorted node IDs.
    pub fn nodes(&self) -> Vec<String> {
        self.ring.read().nodes().map(str::to_string).collect()
    }

    pub fn has_node(&self, node_id: &str) -> bool {
        self.ring.read().contains(node_id)
    }

    pub fn add_node(&self, node_id: &str) -> bool {
        self.ring.write().add_node(node_id)
    }

    pub fn remove_node(&self, node_id: &str) -> bool {
        self.ring.write().remove_node(node_id)
    }

    /// Runs `f` with the write lock held.
    pub fn update<R>(&self, f: impl FnOnce(&mut Ring) -> R) -> R {
        f(&mut self.ring.write())
    }

    /// Independent copy, unaffected by further membership changes.
    pub fn clone_frozen(&self) -> Assigner {
        Assigner {
            node_id: self.node_id.clone(),
            ring: RwLock::new(self.ring.read().clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn distribution(assigner: &Assigner) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for i in 1..=100 {
            let node = assigner.node_for(&format!("foo{:02}", i)).unwrap();
            *counts.entry(node).or_insert(0) += 1;
        }
        counts
    }

    fn expected(pairs: &[(&str, usize)]) -> BTreeMap<String, usize> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_empty() {
        let a = Assigner::new("node1");
        assert_eq!(a.node_for("foo"), Err(DistributionError::NoNodes));
        assert!(!a.is_owner("foo"));
        assert!(a.nodes().is_empty());
    }

    #[test]
    fn test_distribution() {
        let a = Assigner::new("node1");
        for n in ["node1", "node2", "node3", "node4", "node5"] {
            assert!(a.add_node(n));
        }
        assert!(!a.add_node("node3"));
        assert_eq!(
            distribution(&a),
            expected(&[
                ("node1", 27),
                ("node2", 26),
                ("node3", 13),
                ("node4", 24),
                ("node5", 10)
            ])
        );

        assert!(a.remove_node("node2"));
        assert!(a.remove_node("node4"));
        assert!(!a.remove_node("node4"));
        assert_eq!(
            distribution(&a),
            expected(&[("node1", 47), ("node3", 30), ("node5", 23)])
        );
        assert_eq!(a.nodes(), vec!["node1", "node3", "node5"]);
    }

    #[test]
    fn test_is_owner_and_frozen_clone() {
        let a = Assigner::new("node1");
        a.update(|ring| {
            ring.add_node("node1");
            ring.add_node("node2");
        });
        let frozen = a.clone_frozen();

        let owned_by_1 = (1..=100)
            .map(|i| format!("foo{:02}", i))
            .filter(|k| a.is_owner(k))
            .count();
        assert!(owned_by_1 > 0 && owned_by_1 < 100);

        a.remove_node("node2");
        assert!(a.is_owner("foo01"));
        assert_eq!(frozen.nodes(), vec!["node1", "node2"]);
    }

    proptest! {
        #[test]
        fn prop_insertion_order_does_not_matter(
            nodes in proptest::collection::btree_set("[a-z0-9]{1,8}", 1..8),
            keys in proptest::collection::vec("[a-z0-9/]{1,16}", 1..32),
        ) {
            let a = Assigner::new("x");
            let b = Assigner::new("x");
            for n in &nodes {
                a.add_node(n);
            }
            for n in nodes.iter().rev() {
                b.add_node(n);
            }
            for k in &keys {
                prop_assert_eq!(a.node_for(k), b.node_for(k));
            }
        }

        #[test]
        fn prop_removal_only_moves_keys_of_removed_node(
            nodes in proptest::collection::btree_set("[a-z0-9]{1,8}", 2..8),
            keys in proptest::collection::vec("[a-z0-9/]{1,16}", 1..32),
        ) {
            let a = Assigner::new("x");
            for n in &nodes {
                a.add_node(n);
            }
            let removed = nodes.iter().next().unwrap().clone();
            let before: Vec<_> = keys.iter().map(|k| a.node_for(k).unwrap()).collect();
            a.remove_node(&removed);
            for (k, owner) in keys.iter().zip(before) {
                if owner != removed {
                    prop_assert_eq!(a.node_for(k).unwrap(), owner);
                }
            }
        }
    }
}
