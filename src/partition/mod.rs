//! Index partition model
//!
//! A scale-out index is divided into contiguous, non-overlapping key-range
//! partitions, totally ordered by separator key. Exactly one partition per
//! index has an open right boundary.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::scoring::Counters;
use crate::Result;

/// Partition identifier, `"{index}#{id}"`
pub type PartitionName = String;

/// Node identifier
pub type NodeId = String;

/// Identifier of a storage resource (journal or immutable segment)
pub type ResourceId = String;

/// Separator key (unsigned byte order)
pub type SeparatorKey = Vec<u8>;

/// Compose the canonical partition name for an index/partition-id pair.
pub fn partition_name(index_name: &str, partition_id: u64) -> PartitionName {
    format!("{}#{}", index_name, partition_id)
}

/// The resource list backing a partition's fused view.
///
/// The head is the current mutable journal view; the tail are immutable
/// segments and sealed journals, newest first. A partition "depends on" a
/// sealed journal while that journal's id is still present here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionResources {
    resources: Vec<ResourceId>,
}

impl PartitionResources {
    pub fn new(journal: ResourceId) -> Self {
        Self {
            resources: vec![journal],
        }
    }

    pub fn from_parts(journal: ResourceId, immutable: Vec<ResourceId>) -> Self {
        let mut resources = vec![journal];
        resources.extend(immutable);
        Self { resources }
    }

    /// The mutable journal view at the head of the list.
    pub fn journal(&self) -> &ResourceId {
        &self.resources[0]
    }

    /// Immutable members of the fused view, newest first.
    pub fn immutable(&self) -> &[ResourceId] {
        &self.resources[1..]
    }

    pub fn depends_on(&self, resource: &str) -> bool {
        self.resources.iter().any(|r| r == resource)
    }

    /// Redirect the mutable head to a new journal, keeping the old journal
    /// as an immutable dependency (buffered writes live there until a task
    /// rewrites the view).
    pub fn carry_over_to(&mut self, new_journal: ResourceId) {
        self.resources.insert(0, new_journal);
    }

    /// Redirect the mutable head to a new journal, dropping the old one
    /// (copy-forward of an empty write set).
    pub fn copy_forward_to(&mut self, new_journal: ResourceId) {
        self.resources[0] = new_journal;
    }

    pub fn as_slice(&self) -> &[ResourceId] {
        &self.resources
    }
}

/// One key-range partition of a scale-out index, hosted on a single node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexPartition {
    /// Owning scale-out index
    pub index_name: String,
    /// Partition id, unique within the index over its whole history
    pub partition_id: u64,
    /// Inclusive left separator
    pub left_separator: SeparatorKey,
    /// Exclusive right separator; `None` only for the last partition
    pub right_separator: Option<SeparatorKey>,
    /// Resource list backing the fused view
    pub resources: PartitionResources,
    /// Entry-count estimate, including tombstone debt not yet compacted away
    pub entry_count: u64,
}

impl IndexPartition {
    pub fn name(&self) -> PartitionName {
        partition_name(&self.index_name, self.partition_id)
    }

    /// Whether this partition's right boundary is open (last partition).
    pub fn is_rightmost(&self) -> bool {
        self.right_separator.is_none()
    }

    /// Whether `key` falls inside this partition's range.
    pub fn contains(&self, key: &[u8]) -> bool {
        key >= self.left_separator.as_slice()
            && match &self.right_separator {
                Some(right) => key < right.as_slice(),
                None => true,
            }
    }
}

/// Host resolution for one lookup key, as returned by the locator service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostLocator {
    /// Name of the partition whose range contains the lookup key
    pub partition: PartitionName,
    /// Node currently hosting that partition
    pub node: NodeId,
}

/// The overflow event: everything the controller needs from a sealed journal.
///
/// Produced by the store when the active journal is sealed and a new one is
/// opened; consumed by exactly one overflow cycle.
#[derive(Debug, Clone)]
pub struct JournalSeal {
    /// Commit time of the sealed journal; the read timestamp for every task
    /// dispatched by the cycle
    pub commit_time: u64,
    /// Resource id of the journal that was just sealed
    pub sealed_journal: ResourceId,
    /// Per-partition counters accumulated while the journal was active
    pub counters: HashMap<PartitionName, Counters>,
    /// Sum of all per-partition counters
    pub total: Counters,
    /// Partitions whose empty write sets were copied forward onto the new
    /// journal at seal time; they need no task this cycle
    pub copied_forward: HashSet<PartitionName>,
}

/// Read access to the locally hosted partitions as of a commit point.
#[async_trait]
pub trait PartitionCatalog: Send + Sync {
    /// Enumerate all locally hosted partitions as of `commit_time`, ordered
    /// by (index name, left separator).
    async fn partitions_at(&self, commit_time: u64) -> Result<Vec<IndexPartition>>;
}
