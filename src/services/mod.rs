//! Consumed-service interfaces
//!
//! The controller treats the locator service, load balancer, concurrency
//! manager, and the partition store as opaque collaborators behind these
//! traits. `local` ships in-memory implementations used for development and
//! tests.

pub mod local;

pub use local::{LocalConcurrencyManager, LocalLoadBalancer};

use async_trait::async_trait;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::partition::{HostLocator, NodeId, PartitionName, ResourceId, SeparatorKey};
use crate::tasks::{OverflowTask, TaskKind};
use crate::Result;

/// Read access to the locator/metadata index.
///
/// The locator maps a key to the partition whose range contains it and the
/// node currently hosting that partition. Lookups are historical: they read
/// the locator as of `read_time`.
#[async_trait]
pub trait MetadataLookupService: Send + Sync {
    /// Resolve the hosting partition and node for each key, in input order.
    ///
    /// One batched call per index group; a failure here means the caller
    /// skips the affected group for the cycle and retries next cycle.
    async fn locate_batch(
        &self,
        index_name: &str,
        keys: &[SeparatorKey],
        read_time: u64,
    ) -> Result<Vec<HostLocator>>;
}

/// Cluster-level utilization queries.
#[async_trait]
pub trait LoadBalancerService: Send + Sync {
    /// Whether the given node is highly utilized right now.
    async fn is_highly_utilized(&self, node: &str) -> Result<bool>;

    /// Between `min_count` and `max_count` under-utilized nodes, excluding
    /// `exclude`. An empty result means no suitable move target exists.
    async fn under_utilized_nodes(
        &self,
        min_count: usize,
        max_count: usize,
        exclude: &str,
    ) -> Result<Vec<NodeId>>;
}

/// Handle to a submitted overflow task.
pub struct TaskHandle {
    pub kind: TaskKind,
    /// Partition names the task touches (its lock set)
    pub partitions: Vec<PartitionName>,
    pub(crate) join: JoinHandle<Result<()>>,
}

impl TaskHandle {
    pub fn new(kind: TaskKind, partitions: Vec<PartitionName>, join: JoinHandle<Result<()>>) -> Self {
        Self {
            kind,
            partitions,
            join,
        }
    }
}

/// Outcome of one dispatched task.
#[derive(Debug)]
pub struct TaskResult {
    pub kind: TaskKind,
    pub partitions: Vec<PartitionName>,
    pub outcome: Result<()>,
}

impl TaskResult {
    pub fn succeeded(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Shared concurrency manager executing overflow tasks.
///
/// Guarantees per-resource mutual exclusion: two tasks naming overlapping
/// partitions never run concurrently. Serialization is the manager's job,
/// not the controller's.
#[async_trait]
pub trait ConcurrencyManager: Send + Sync {
    /// Submit a task for execution.
    async fn submit(&self, task: OverflowTask) -> TaskHandle;

    /// Await all handles with a single bounded deadline. Tasks that miss the
    /// deadline are not cancelled but are no longer awaited; their eventual
    /// outcome is still logged when it occurs.
    async fn await_all(&self, handles: Vec<TaskHandle>, timeout: Duration) -> Vec<TaskResult>;
}

/// Staged output of a split's historical read phase.
#[derive(Debug, Clone)]
pub struct SplitPlan {
    /// First key of the new right-hand partition
    pub split_key: SeparatorKey,
    /// Segment holding the left half of the fused view
    pub left_output: ResourceId,
    /// Segment holding the right half of the fused view
    pub right_output: ResourceId,
}

/// Staged output of a join's historical read phase.
#[derive(Debug, Clone)]
pub struct JoinPlan {
    /// Segment holding the merged fused view of both partitions
    pub output: ResourceId,
}

/// The atomic phase of a task: one short mutation that swaps in the new
/// partition view and, for split/join/move, updates the locator.
#[derive(Debug, Clone)]
pub enum AtomicChange {
    /// Build: replace the fused view with `{current journal, output}`
    SwapResources {
        partition: PartitionName,
        output: ResourceId,
    },
    /// Split: replace one partition with two over disjoint sub-ranges
    SplitPartition {
        partition: PartitionName,
        plan: SplitPlan,
    },
    /// Join: merge `right` into a successor of `left` covering both ranges
    JoinPartitions {
        left: PartitionName,
        right: PartitionName,
        plan: JoinPlan,
    },
    /// Move: retarget the locator entry and hosting to `target`
    Relocate {
        partition: PartitionName,
        target: NodeId,
        output: ResourceId,
    },
}

/// Task-execution collaborator: the store the tasks run against.
///
/// Every task is two phases: a historical, read-only `stage_*` call against
/// the sealed journal's commit point that computes the new partition state,
/// then one `apply` of the resulting [`AtomicChange`].
#[async_trait]
pub trait PartitionStore: Send + Sync {
    /// Stage a compacted segment holding the partition's fused view as of
    /// `read_time`, written under the caller-chosen `output` id.
    async fn stage_compaction(
        &self,
        partition: &str,
        output: &ResourceId,
        read_time: u64,
    ) -> Result<()>;

    /// Re-evaluate a split at entry granularity and stage both halves.
    ///
    /// Returns `None` when the partition no longer warrants splitting after
    /// the closer look; the caller falls back to a plain compaction.
    async fn stage_split(
        &self,
        partition: &str,
        split_threshold: u64,
        read_time: u64,
    ) -> Result<Option<SplitPlan>>;

    /// Stage the merged segment for a join of two adjacent partitions.
    async fn stage_join(&self, left: &str, right: &str, read_time: u64) -> Result<JoinPlan>;

    /// Apply the atomic phase.
    async fn apply(&self, change: AtomicChange) -> Result<()>;
}
