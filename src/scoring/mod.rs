//! Partition activity scoring
//!
//! Converts the raw per-partition counters accumulated since the previous
//! journal seal into normalized, ranked activity scores. Scores drive the
//! warm-band selection used by load-based moves.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::partition::PartitionName;

/// Raw activity counters for one partition, accumulated between journal
/// seals and reset at each seal. Owned by the runtime layer; the controller
/// only reads the snapshot captured in a [`JournalSeal`].
///
/// [`JournalSeal`]: crate::partition::JournalSeal
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Counters {
    /// Normal (client-driven) operations: writes, deletes, point reads, scans
    pub normal_ops: u64,
    /// Administrative operations (index registration, forced seals)
    pub admin_ops: u64,
    /// Total elapsed service time across normal operations (nanos)
    pub elapsed_nanos: u64,
    /// Bytes read from the partition by normal operations
    pub bytes_read: u64,
    /// Bytes written into the partition by normal operations
    pub bytes_written: u64,
}

impl Counters {
    /// A partition is "touched" only if a normal operation reached it.
    /// Administrative traffic alone does not make a partition scoreable.
    pub fn touched(&self) -> bool {
        self.normal_ops > 0
    }

    /// Fold another counter set into this one.
    pub fn merge(&mut self, other: &Counters) {
        self.normal_ops += other.normal_ops;
        self.admin_ops += other.admin_ops;
        self.elapsed_nanos += other.elapsed_nanos;
        self.bytes_read += other.bytes_read;
        self.bytes_written += other.bytes_written;
    }

    /// Raw activity score: a weighted combination of operation count,
    /// service time, and byte volume. The weights are policy, not contract;
    /// the only guarantees are monotonicity in each counter and a total
    /// order (ties broken by partition name at ranking time).
    pub fn raw_score(&self) -> f64 {
        const OP_WEIGHT: f64 = 1.0;
        const LATENCY_WEIGHT_PER_MS: f64 = 0.1;
        const VOLUME_WEIGHT_PER_KIB: f64 = 0.05;

        let elapsed_ms = self.elapsed_nanos as f64 / 1_000_000.0;
        let kib_moved = (self.bytes_read + self.bytes_written) as f64 / 1024.0;

        OP_WEIGHT * self.normal_ops as f64
            + LATENCY_WEIGHT_PER_MS * elapsed_ms
            + VOLUME_WEIGHT_PER_KIB * kib_moved
    }
}

/// Immutable per-cycle activity score for one partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Score {
    /// Partition name
    pub name: PartitionName,
    /// Raw weighted score (see [`Counters::raw_score`])
    pub raw_score: f64,
    /// Raw score divided by the cycle's total raw score (0 if the total is 0)
    pub normalized_score: f64,
    /// Integer rank, 0 = coldest scored partition
    pub rank: usize,
    /// `rank / n` over the n scored partitions; in `[0, 1)`
    pub fractional_rank: f64,
}

/// Ranked activity scores for one overflow cycle.
///
/// Partitions that saw no normal operation are absent, not scored zero:
/// zero is a valid score for a touched-but-idle partition, while absence
/// means the partition was cold this cycle.
#[derive(Debug, Default)]
pub struct ScoreBoard {
    scores: HashMap<PartitionName, Score>,
    /// Partition names in ascending raw-score order
    ordered: Vec<PartitionName>,
}

impl ScoreBoard {
    /// Compute scores from the per-partition counters captured at a seal.
    ///
    /// Pure function of its inputs: recomputing over the same seal yields
    /// identical scores and ranks.
    pub fn compute(counters: &HashMap<PartitionName, Counters>, total: &Counters) -> Self {
        let total_raw = total.raw_score();

        let mut entries: Vec<(PartitionName, f64)> = counters
            .iter()
            .filter(|(_, c)| c.touched())
            .map(|(name, c)| (name.clone(), c.raw_score()))
            .collect();

        // Ascending by raw score; ties broken by name so rank assignment
        // is deterministic.
        entries.sort_by(|(an, ar), (bn, br)| {
            ar.partial_cmp(br)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| an.cmp(bn))
        });

        let n = entries.len();
        let mut scores = HashMap::with_capacity(n);
        let mut ordered = Vec::with_capacity(n);

        for (rank, (name, raw)) in entries.into_iter().enumerate() {
            let normalized = if total_raw > 0.0 { raw / total_raw } else { 0.0 };
            scores.insert(
                name.clone(),
                Score {
                    name: name.clone(),
                    raw_score: raw,
                    normalized_score: normalized,
                    rank,
                    fractional_rank: rank as f64 / n as f64,
                },
            );
            ordered.push(name);
        }

        Self { scores, ordered }
    }

    /// The score for a partition, or `None` if it was cold this cycle.
    pub fn score(&self, name: &str) -> Option<&Score> {
        self.scores.get(name)
    }

    /// Scored partitions in ascending raw-score order.
    pub fn ascending(&self) -> impl Iterator<Item = &Score> {
        self.ordered.iter().filter_map(move |n| self.scores.get(n))
    }

    /// Number of scored partitions this cycle.
    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}
