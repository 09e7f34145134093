//! Overflow tasks
//!
//! Each partition classified by an overflow cycle is assigned exactly one
//! task. A task is a tagged union with a single execution entry point; every
//! variant runs the same two-phase contract against the partition store:
//! a historical read phase that stages the new partition state, then one
//! short atomic phase that swaps it in (and updates the locator for
//! split/join/move).
//!
//! Tasks are created by the dispatcher, submitted to the concurrency
//! manager, and discarded after they resolve; only their effect is durable.

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::partition::{NodeId, PartitionName, ResourceId};
use crate::services::{AtomicChange, PartitionStore};
use crate::Result;

/// Discriminant of an overflow task, used for reporting and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    Build,
    Split,
    Join,
    Move,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Build => "build",
            TaskKind::Split => "split",
            TaskKind::Join => "join",
            TaskKind::Move => "move",
        }
    }
}

/// One overflow action against the partition store.
///
/// Every variant carries the read timestamp of the just-sealed journal; the
/// historical phase reads at exactly that commit point.
#[derive(Debug, Clone)]
pub enum OverflowTask {
    /// Compact the partition's fused view into a fresh segment, dropping
    /// the sealed journal from its resource list.
    Build {
        partition: PartitionName,
        /// Output segment id, reserved at classification time
        output: ResourceId,
        read_time: u64,
    },
    /// Divide an overcapacity partition into two disjoint sub-ranges. The
    /// store re-evaluates at entry granularity and may decline, in which
    /// case the task degrades to a build.
    Split {
        partition: PartitionName,
        /// Entry count below which the fine-grained re-check declines
        split_threshold: u64,
        read_time: u64,
    },
    /// Merge an undercapacity partition with its right sibling.
    Join {
        left: PartitionName,
        right: PartitionName,
        read_time: u64,
    },
    /// Relocate a partition's hosting to another node, key range unchanged.
    Move {
        partition: PartitionName,
        target: NodeId,
        read_time: u64,
    },
}

impl OverflowTask {
    pub fn kind(&self) -> TaskKind {
        match self {
            OverflowTask::Build { .. } => TaskKind::Build,
            OverflowTask::Split { .. } => TaskKind::Split,
            OverflowTask::Join { .. } => TaskKind::Join,
            OverflowTask::Move { .. } => TaskKind::Move,
        }
    }

    /// Partition names this task touches; the concurrency manager's lock set.
    pub fn lock_set(&self) -> Vec<PartitionName> {
        match self {
            OverflowTask::Build { partition, .. }
            | OverflowTask::Split { partition, .. }
            | OverflowTask::Move { partition, .. } => vec![partition.clone()],
            OverflowTask::Join { left, right, .. } => vec![left.clone(), right.clone()],
        }
    }

    pub fn read_time(&self) -> u64 {
        match self {
            OverflowTask::Build { read_time, .. }
            | OverflowTask::Split { read_time, .. }
            | OverflowTask::Join { read_time, .. }
            | OverflowTask::Move { read_time, .. } => *read_time,
        }
    }

    /// Run both phases to completion.
    pub async fn execute(&self, store: &dyn PartitionStore) -> Result<()> {
        match self {
            OverflowTask::Build {
                partition,
                output,
                read_time,
            } => {
                store.stage_compaction(partition, output, *read_time).await?;
                store
                    .apply(AtomicChange::SwapResources {
                        partition: partition.clone(),
                        output: output.clone(),
                    })
                    .await
            }
            OverflowTask::Split {
                partition,
                split_threshold,
                read_time,
            } => {
                match store
                    .stage_split(partition, *split_threshold, *read_time)
                    .await?
                {
                    Some(plan) => {
                        store
                            .apply(AtomicChange::SplitPartition {
                                partition: partition.clone(),
                                plan,
                            })
                            .await
                    }
                    None => {
                        // The advisory split did not survive the fine-grained
                        // re-check; compact instead. Not an error.
                        debug!(partition = %partition, "split declined, compacting instead");
                        let output = fresh_segment_id();
                        store.stage_compaction(partition, &output, *read_time).await?;
                        store
                            .apply(AtomicChange::SwapResources {
                                partition: partition.clone(),
                                output,
                            })
                            .await
                    }
                }
            }
            OverflowTask::Join {
                left,
                right,
                read_time,
            } => {
                let plan = store.stage_join(left, right, *read_time).await?;
                store
                    .apply(AtomicChange::JoinPartitions {
                        left: left.clone(),
                        right: right.clone(),
                        plan,
                    })
                    .await
            }
            OverflowTask::Move {
                partition,
                target,
                read_time,
            } => {
                // Shipping form of the partition: one compacted segment.
                let output = fresh_segment_id();
                store.stage_compaction(partition, &output, *read_time).await?;
                store
                    .apply(AtomicChange::Relocate {
                        partition: partition.clone(),
                        target: target.clone(),
                        output,
                    })
                    .await
            }
        }
    }
}

/// Reserve a globally unique segment id.
pub fn fresh_segment_id() -> ResourceId {
    format!("seg-{}", Uuid::new_v4())
}
