//! Hash slot allocation for slot-sharded clusters.
//!
//! Given `n` nodes and `r` replicas per master, the first `n / (r + 1)`
//! nodes become masters and split the 16384 slots into contiguous
//! inclusive ranges; the last master absorbs the remainder. Every other
//! node is a replica, assigned round-robin: node `m + k` replicates
//! master `k % m`.

use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Number of hash slots in a Redis cluster.
pub const CLUSTER_HASH_SLOTS: u16 = 16384;

pub(crate) const TOO_FEW_MASTERS: &str = "Redis Cluster requires at least 3 master nodes.";
pub(crate) const TOO_FEW_REPLICAS: &str = "Redis Cluster requires at least 1 replication.";
pub(crate) const TOO_MANY_REPLICAS: &str =
    "Redis Cluster requires number of replications less than (number of nodes - 1).";

/// An inclusive range of hash slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotRange {
    pub start: u16,
    pub end: u16,
}

impl SlotRange {
    pub fn len(&self) -> usize {
        usize::from(self.end - self.start) + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, slot: u16) -> bool {
        (self.start..=self.end).contains(&slot)
    }

    pub fn iter(&self) -> RangeInclusive<u16> {
        self.start..=self.end
    }

    /// Every slot in the range, for `CLUSTER ADDSLOTS`.
    pub fn slots(&self) -> Vec<u16> {
        self.iter().collect()
    }
}

/// One master, its slots, and the nodes replicating it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterAssignment {
    /// Node index.
    pub node: usize,
    pub slots: SlotRange,
    /// Node indices of its replicas.
    pub replicas: Vec<usize>,
}

/// The master/replica layout for a cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotAllocation {
    node_count: usize,
    masters: Vec<MasterAssignment>,
}

impl SlotAllocation {
    /// Validates the shape and computes the layout.
    ///
    /// Checks run in a fixed order and the first violation wins: too few
    /// nodes, then too few replicas, then too many.
    pub fn compute(node_count: usize, replicas_per_master: usize) -> Result<Self> {
        validate(node_count, replicas_per_master)?;

        let master_count = node_count / (replicas_per_master + 1);
        let per_master = usize::from(CLUSTER_HASH_SLOTS) / master_count;
        let last_slot = CLUSTER_HASH_SLOTS - 1;

        let mut masters = Vec::with_capacity(master_count);
        let mut cursor = 0usize;
        for node in 0..master_count {
            let start = cursor;
            let end = if node + 1 == master_count {
                usize::from(last_slot)
            } else {
                (cursor + per_master - 1).max(start)
            };
            cursor = end + 1;

            masters.push(MasterAssignment {
                node,
                slots: SlotRange {
                    start: slot(start)?,
                    end: slot(end)?,
                },
                replicas: Vec::new(),
            });
        }

        for replica in master_count..node_count {
            let master = (replica - master_count) % master_count;
            masters[master].replicas.push(replica);
        }

        Ok(Self {
            node_count,
            masters,
        })
    }

    pub fn node_count(&self) -> usize {
        self.node_count
    }

    pub fn master_count(&self) -> usize {
        self.masters.len()
    }

    pub fn masters(&self) -> &[MasterAssignment] {
        &self.masters
    }

    pub fn is_master(&self, node: usize) -> bool {
        node < self.masters.len()
    }

    /// The master index `node` replicates, or `None` for masters and
    /// out-of-range indices.
    pub fn master_of(&self, node: usize) -> Option<usize> {
        let m = self.masters.len();
        (node >= m && node < self.node_count).then(|| (node - m) % m)
    }

    /// Slots owned by master `node`.
    pub fn slots_of(&self, node: usize) -> Option<SlotRange> {
        self.masters.get(node).map(|a| a.slots)
    }
}

fn slot(value: usize) -> Result<u16> {
    u16::try_from(value)
        .ok()
        .filter(|s| *s < CLUSTER_HASH_SLOTS)
        .ok_or_else(|| Error::InvalidTopology(format!("slot {value} out of range")))
}

/// Construction-time checks for a cluster of `node_count` nodes.
pub fn validate(node_count: usize, replicas_per_master: usize) -> Result<()> {
    if node_count < 3 {
        return Err(Error::InvalidTopology(TOO_FEW_MASTERS.to_string()));
    }
    if replicas_per_master < 1 {
        return Err(Error::InvalidTopology(TOO_FEW_REPLICAS.to_string()));
    }
    if replicas_per_master >= node_count {
        return Err(Error::InvalidTopology(TOO_MANY_REPLICAS.to_string()));
    }
    if node_count / (replicas_per_master + 1) > usize::from(CLUSTER_HASH_SLOTS) {
        return Err(Error::InvalidTopology(format!(
            "Redis Cluster supports at most {CLUSTER_HASH_SLOTS} master nodes."
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use test_case::test_case;

    #[test]
    fn six_nodes_one_replica() {
        let alloc = SlotAllocation::compute(6, 1).unwrap();
        assert_eq!(alloc.master_count(), 3);

        let ranges: Vec<_> = alloc.masters().iter().map(|m| (m.slots.start, m.slots.end)).collect();
        assert_eq!(ranges, vec![(0, 5460), (5461, 10921), (10922, 16383)]);

        assert_eq!(alloc.master_of(3), Some(0));
        assert_eq!(alloc.master_of(4), Some(1));
        assert_eq!(alloc.master_of(5), Some(2));
        assert_eq!(alloc.master_of(2), None);
        assert_eq!(alloc.master_of(6), None);
    }

    #[test]
    fn replicas_wrap_round_robin() {
        // 7 nodes, 1 replica: 3 masters, 4 replicas; node 6 wraps to master 0.
        let alloc = SlotAllocation::compute(7, 1).unwrap();
        assert_eq!(alloc.master_count(), 3);
        assert_eq!(alloc.masters()[0].replicas, vec![3, 6]);
        assert_eq!(alloc.masters()[1].replicas, vec![4]);
        assert_eq!(alloc.masters()[2].replicas, vec![5]);
    }

    #[test]
    fn single_master_owns_everything() {
        // 3 nodes, 2 replicas: one master with two replicas.
        let alloc = SlotAllocation::compute(3, 2).unwrap();
        assert_eq!(alloc.master_count(), 1);
        assert_eq!(alloc.slots_of(0), Some(SlotRange { start: 0, end: 16383 }));
        assert_eq!(alloc.slots_of(0).unwrap().len(), 16384);
        assert_eq!(alloc.masters()[0].replicas, vec![1, 2]);
    }

    #[test_case(0, 1, TOO_FEW_MASTERS; "no nodes")]
    #[test_case(2, 1, TOO_FEW_MASTERS; "two nodes")]
    #[test_case(2, 0, TOO_FEW_MASTERS; "node count checked before replicas")]
    #[test_case(6, 0, TOO_FEW_REPLICAS; "zero replicas")]
    #[test_case(3, 3, TOO_MANY_REPLICAS; "replicas equal node count")]
    #[test_case(4, 9, TOO_MANY_REPLICAS; "replicas above node count")]
    fn rejects_bad_shapes(nodes: usize, replicas: usize, message: &str) {
        let err = SlotAllocation::compute(nodes, replicas).unwrap_err();
        assert!(matches!(err, Error::InvalidTopology(_)));
        assert_eq!(err.to_string(), message);
    }

    #[test]
    fn range_helpers() {
        let range = SlotRange { start: 10, end: 12 };
        assert_eq!(range.slots(), vec![10, 11, 12]);
        assert!(range.contains(12));
        assert!(!range.contains(13));
        assert_eq!(range.len(), 3);
    }

    proptest! {
        #[test]
        fn ranges_partition_all_slots(nodes in 3usize..400, replicas in 1usize..8) {
            prop_assume!(replicas < nodes);
            let alloc = SlotAllocation::compute(nodes, replicas).unwrap();
            let masters = alloc.masters();

            prop_assert_eq!(masters.len(), nodes / (replicas + 1));
            prop_assert_eq!(masters[0].slots.start, 0);
            prop_assert_eq!(masters[masters.len() - 1].slots.end, CLUSTER_HASH_SLOTS - 1);
            for pair in masters.windows(2) {
                prop_assert_eq!(pair[0].slots.end + 1, pair[1].slots.start);
            }
            let total: usize = masters.iter().map(|m| m.slots.len()).sum();
            prop_assert_eq!(total, usize::from(CLUSTER_HASH_SLOTS));
        }

        #[test]
        fn every_non_master_has_exactly_one_master(nodes in 3usize..200, replicas in 1usize..6) {
            prop_assume!(replicas < nodes);
            let alloc = SlotAllocation::compute(nodes, replicas).unwrap();
            let m = alloc.master_count();

            let mut seen = vec![0usize; nodes];
            for master in alloc.masters() {
                for &r in &master.replicas {
                    seen[r] += 1;
                    prop_assert_eq!(alloc.master_of(r), Some(master.node));
                }
            }
            for node in 0..nodes {
                prop_assert_eq!(seen[node], usize::from(node >= m));
            }
        }
    }
}
