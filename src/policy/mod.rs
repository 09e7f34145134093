//! Split/join capacity policy
//!
//! Pure predicates over partition metadata and per-index thresholds. Both
//! predicates are advisory: the split task re-evaluates at finer grain and
//! may fall back to a plain compaction, and a join candidate only becomes a
//! join if its right sibling turns out to be local.

use serde::{Deserialize, Serialize};

use crate::partition::IndexPartition;

/// Capacity thresholds for one scale-out index.
///
/// These are per-index configuration, not global constants: different
/// logical indices have different cardinality profiles.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IndexPolicy {
    /// Nominal entry count a freshly split partition should hold
    pub target_entry_count_per_split: u64,
    /// A partition is split-eligible above `multiplier × target`
    pub over_capacity_multiplier: f64,
    /// A partition is join-eligible below this entry count
    pub minimum_entry_count: u64,
}

impl Default for IndexPolicy {
    fn default() -> Self {
        Self {
            target_entry_count_per_split: 400,
            over_capacity_multiplier: 1.5,
            minimum_entry_count: 100,
        }
    }
}

impl IndexPolicy {
    /// Entry count above which a partition should split.
    pub fn split_threshold(&self) -> u64 {
        (self.over_capacity_multiplier * self.target_entry_count_per_split as f64) as u64
    }
}

/// Advises whether a partition should split or is a join candidate.
#[derive(Debug, Clone, Copy, Default)]
pub struct SplitJoinAdvisor {
    policy: IndexPolicy,
}

impl SplitJoinAdvisor {
    pub fn new(policy: IndexPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &IndexPolicy {
        &self.policy
    }

    /// True when the partition's entry-count estimate exceeds the
    /// overcapacity threshold. Open-right partitions are split-eligible
    /// like any other.
    pub fn should_split(&self, partition: &IndexPartition) -> bool {
        partition.entry_count > self.policy.split_threshold()
    }

    /// True when the partition is undercapacity and has a right sibling to
    /// merge with. The last partition of an index (open right boundary) is
    /// never join-eligible.
    pub fn should_join(&self, partition: &IndexPartition) -> bool {
        !partition.is_rightmost() && partition.entry_count < self.policy.minimum_entry_count
    }
}
