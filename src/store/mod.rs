//! In-memory scale-out index store
//!
//! Reference backend used for development and tests: routes writes and
//! deletes by separator key, accumulates per-partition runtime counters,
//! seals journals, maintains the per-index locator map, and executes the
//! atomic phase of overflow tasks. Production deployments replace this with
//! the real storage engine behind the same traits.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Instant;
use tracing::{debug, info};

use crate::clock::CommitClock;
use crate::partition::{
    partition_name, HostLocator, IndexPartition, JournalSeal, NodeId, PartitionCatalog,
    PartitionName, PartitionResources, ResourceId, SeparatorKey,
};
use crate::scoring::Counters;
use crate::services::{AtomicChange, JoinPlan, MetadataLookupService, PartitionStore, SplitPlan};
use crate::{Error, Result};

/// One partition's stored state.
struct StoredPartition {
    meta: IndexPartition,
    host: NodeId,
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
    /// Deletes applied since the last compaction. The entry-count *estimate*
    /// in `meta` keeps counting these until a task rewrites the view.
    tombstones: u64,
    /// Whether the partition buffered writes on the current journal
    dirty: bool,
}

impl StoredPartition {
    fn refresh_estimate(&mut self) {
        self.meta.entry_count = self.entries.len() as u64 + self.tombstones;
    }
}

/// Locator entry: one key range and its hosting.
struct LocatorEntry {
    left: SeparatorKey,
    right: Option<SeparatorKey>,
    partition: PartitionName,
    node: NodeId,
}

/// Per-index state: partitions plus the ordered locator map.
#[derive(Default)]
struct IndexState {
    next_partition_id: u64,
    partitions: HashMap<PartitionName, StoredPartition>,
    /// Sorted by left separator; ranges are contiguous and non-overlapping
    locator: Vec<LocatorEntry>,
}

impl IndexState {
    fn locate(&self, key: &[u8]) -> Option<&LocatorEntry> {
        // Last entry whose left separator is <= key
        let idx = self.locator.partition_point(|e| e.left.as_slice() <= key);
        if idx == 0 {
            return None;
        }
        let entry = &self.locator[idx - 1];
        match &entry.right {
            Some(right) if key >= right.as_slice() => None,
            _ => Some(entry),
        }
    }

    fn locator_position(&self, partition: &str) -> Option<usize> {
        self.locator.iter().position(|e| e.partition == partition)
    }
}

struct StoreInner {
    journal_seq: u64,
    journal: ResourceId,
    indices: HashMap<String, IndexState>,
}

/// In-memory scale-out index store for one node.
pub struct MemoryIndexStore {
    node_id: NodeId,
    clock: CommitClock,
    inner: RwLock<StoreInner>,
    /// Per-partition counters since the last seal
    counters: DashMap<PartitionName, Counters>,
    /// Outputs written by a historical phase, awaiting their atomic phase
    staged: Mutex<HashSet<ResourceId>>,
}

impl MemoryIndexStore {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        let clock = CommitClock::new();
        // Seed the committed high-water mark before the first seal.
        clock.next_commit_time();
        Self {
            node_id: node_id.into(),
            clock,
            inner: RwLock::new(StoreInner {
                journal_seq: 1,
                journal: "journal-1".to_string(),
                indices: HashMap::new(),
            }),
            counters: DashMap::new(),
            staged: Mutex::new(HashSet::new()),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Register a scale-out index with a single open-ended partition.
    pub fn register_index(&self, index_name: &str) -> Result<PartitionName> {
        let mut inner = self.inner.write();
        if inner.indices.contains_key(index_name) {
            return Err(Error::Config(format!(
                "index {} already registered",
                index_name
            )));
        }

        let journal = inner.journal.clone();
        let mut state = IndexState::default();
        let id = state.next_partition_id;
        state.next_partition_id += 1;

        let name = partition_name(index_name, id);
        let meta = IndexPartition {
            index_name: index_name.to_string(),
            partition_id: id,
            left_separator: Vec::new(),
            right_separator: None,
            resources: PartitionResources::new(journal),
            entry_count: 0,
        };
        state.locator.push(LocatorEntry {
            left: Vec::new(),
            right: None,
            partition: name.clone(),
            node: self.node_id.clone(),
        });
        state.partitions.insert(
            name.clone(),
            StoredPartition {
                meta,
                host: self.node_id.clone(),
                entries: BTreeMap::new(),
                tombstones: 0,
                dirty: false,
            },
        );
        inner.indices.insert(index_name.to_string(), state);

        // Registration is administrative traffic; it must not make the
        // partition scoreable.
        self.counters.entry(name.clone()).or_default().admin_ops += 1;

        info!(index = index_name, partition = %name, "registered scale-out index");
        Ok(name)
    }

    /// Insert or overwrite one entry.
    pub fn write(&self, index_name: &str, key: &[u8], value: &[u8]) -> Result<()> {
        let started = Instant::now();
        let mut inner = self.inner.write();
        let name = self.route_local(&inner, index_name, key)?;
        let state = inner.indices.get_mut(index_name).expect("routed index");
        let p = state.partitions.get_mut(&name).expect("routed partition");

        p.entries.insert(key.to_vec(), value.to_vec());
        p.dirty = true;
        p.refresh_estimate();
        drop(inner);

        let mut c = self.counters.entry(name).or_default();
        c.normal_ops += 1;
        c.bytes_written += (key.len() + value.len()) as u64;
        c.elapsed_nanos += started.elapsed().as_nanos() as u64;
        Ok(())
    }

    /// Delete one entry. Returns whether it existed. The removed entry
    /// leaves tombstone debt in the entry-count estimate until the next
    /// compaction recomputes it.
    pub fn delete(&self, index_name: &str, key: &[u8]) -> Result<bool> {
        let started = Instant::now();
        let mut inner = self.inner.write();
        let name = self.route_local(&inner, index_name, key)?;
        let state = inner.indices.get_mut(index_name).expect("routed index");
        let p = state.partitions.get_mut(&name).expect("routed partition");

        let existed = p.entries.remove(key).is_some();
        if existed {
            p.tombstones += 1;
            p.dirty = true;
            p.refresh_estimate();
        }
        drop(inner);

        let mut c = self.counters.entry(name).or_default();
        c.normal_ops += 1;
        c.elapsed_nanos += started.elapsed().as_nanos() as u64;
        Ok(existed)
    }

    /// Ordered scan of every entry in the locally hosted partitions of an
    /// index.
    pub fn scan(&self, index_name: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let started = Instant::now();
        let inner = self.inner.read();
        let state = inner
            .indices
            .get(index_name)
            .ok_or_else(|| Error::IndexNotFound(index_name.to_string()))?;

        let mut locals: Vec<&StoredPartition> = state
            .partitions
            .values()
            .filter(|p| p.host == self.node_id)
            .collect();
        locals.sort_by(|a, b| a.meta.left_separator.cmp(&b.meta.left_separator));

        let mut out = Vec::new();
        let mut touched = Vec::new();
        for p in locals {
            let mut bytes = 0u64;
            for (k, v) in &p.entries {
                bytes += (k.len() + v.len()) as u64;
                out.push((k.clone(), v.clone()));
            }
            touched.push((p.meta.name(), bytes));
        }
        drop(inner);

        let elapsed = started.elapsed().as_nanos() as u64;
        for (name, bytes) in touched {
            let mut c = self.counters.entry(name).or_default();
            c.normal_ops += 1;
            c.bytes_read += bytes;
            c.elapsed_nanos += elapsed;
        }
        Ok(out)
    }

    /// Seal the active journal and open a new one.
    ///
    /// Partitions with no buffered writes are copied forward onto the new
    /// journal (they need no task this cycle); dirty partitions keep the
    /// sealed journal in their resource list until a task rewrites the view.
    pub fn seal_journal(&self) -> JournalSeal {
        let mut inner = self.inner.write();
        let sealed = inner.journal.clone();
        inner.journal_seq += 1;
        inner.journal = format!("journal-{}", inner.journal_seq);
        let new_journal = inner.journal.clone();

        let commit_time = self.clock.next_commit_time();

        let mut copied_forward = HashSet::new();
        for state in inner.indices.values_mut() {
            for p in state.partitions.values_mut() {
                if p.host != self.node_id {
                    continue;
                }
                if p.dirty {
                    p.meta.resources.carry_over_to(new_journal.clone());
                    p.dirty = false;
                } else {
                    p.meta.resources.copy_forward_to(new_journal.clone());
                    copied_forward.insert(p.meta.name());
                }
            }
        }
        drop(inner);

        let mut counters = HashMap::new();
        let mut total = Counters::default();
        for entry in self.counters.iter() {
            total.merge(entry.value());
            counters.insert(entry.key().clone(), *entry.value());
        }
        self.counters.clear();

        info!(
            sealed = %sealed,
            commit_time,
            partitions_copied_forward = copied_forward.len(),
            "sealed journal"
        );
        JournalSeal {
            commit_time,
            sealed_journal: sealed,
            counters,
            total,
            copied_forward,
        }
    }

    /// Number of partitions of an index hosted on this node.
    pub fn local_partition_count(&self, index_name: &str) -> usize {
        let inner = self.inner.read();
        inner
            .indices
            .get(index_name)
            .map(|s| {
                s.partitions
                    .values()
                    .filter(|p| p.host == self.node_id)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Metadata snapshot of one partition, wherever it is hosted.
    pub fn partition_meta(&self, name: &str) -> Option<IndexPartition> {
        let inner = self.inner.read();
        let index_name = name.split('#').next()?;
        inner
            .indices
            .get(index_name)
            .and_then(|s| s.partitions.get(name))
            .map(|p| p.meta.clone())
    }

    /// The node a partition is currently hosted on, per the locator.
    pub fn locate_partition(&self, name: &str) -> Option<NodeId> {
        let inner = self.inner.read();
        let index_name = name.split('#').next()?;
        inner
            .indices
            .get(index_name)?
            .locator
            .iter()
            .find(|e| e.partition == name)
            .map(|e| e.node.clone())
    }

    fn route_local(&self, inner: &StoreInner, index_name: &str, key: &[u8]) -> Result<PartitionName> {
        let state = inner
            .indices
            .get(index_name)
            .ok_or_else(|| Error::IndexNotFound(index_name.to_string()))?;
        let entry = state.locate(key).ok_or_else(|| {
            Error::Internal(format!("no partition of {} covers the key", index_name))
        })?;
        if entry.node != self.node_id {
            return Err(Error::Internal(format!(
                "partition {} is hosted on {}",
                entry.partition, entry.node
            )));
        }
        Ok(entry.partition.clone())
    }

    fn check_read_time(&self, read_time: u64) -> Result<()> {
        let committed = self.clock.last_commit_time();
        if read_time > committed {
            return Err(Error::FutureReadTime {
                requested: read_time,
                committed,
            });
        }
        Ok(())
    }

    fn stage(&self, output: &ResourceId) {
        self.staged.lock().insert(output.clone());
    }

    fn take_staged(&self, output: &ResourceId) -> Result<()> {
        if self.staged.lock().remove(output) {
            Ok(())
        } else {
            Err(Error::Internal(format!(
                "atomic phase references unstaged resource {}",
                output
            )))
        }
    }

    fn split_index_name(name: &str) -> Result<&str> {
        name.split('#')
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::PartitionNotFound(name.to_string()))
    }
}

#[async_trait]
impl PartitionCatalog for MemoryIndexStore {
    async fn partitions_at(&self, commit_time: u64) -> Result<Vec<IndexPartition>> {
        self.check_read_time(commit_time)?;
        let inner = self.inner.read();
        let mut out: Vec<IndexPartition> = inner
            .indices
            .values()
            .flat_map(|s| s.partitions.values())
            .filter(|p| p.host == self.node_id)
            .map(|p| p.meta.clone())
            .collect();
        out.sort_by(|a, b| {
            a.index_name
                .cmp(&b.index_name)
                .then_with(|| a.left_separator.cmp(&b.left_separator))
        });
        Ok(out)
    }
}

#[async_trait]
impl MetadataLookupService for MemoryIndexStore {
    async fn locate_batch(
        &self,
        index_name: &str,
        keys: &[SeparatorKey],
        read_time: u64,
    ) -> Result<Vec<HostLocator>> {
        self.check_read_time(read_time)?;
        let inner = self.inner.read();
        let state = inner
            .indices
            .get(index_name)
            .ok_or_else(|| Error::Lookup(format!("unknown index {}", index_name)))?;

        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let entry = state.locate(key).ok_or_else(|| {
                Error::Lookup(format!("no partition of {} covers the key", index_name))
            })?;
            out.push(HostLocator {
                partition: entry.partition.clone(),
                node: entry.node.clone(),
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl PartitionStore for MemoryIndexStore {
    async fn stage_compaction(
        &self,
        partition: &str,
        output: &ResourceId,
        read_time: u64,
    ) -> Result<()> {
        self.check_read_time(read_time)?;
        let inner = self.inner.read();
        let index_name = Self::split_index_name(partition)?;
        let state = inner
            .indices
            .get(index_name)
            .ok_or_else(|| Error::IndexNotFound(index_name.to_string()))?;
        if !state.partitions.contains_key(partition) {
            return Err(Error::PartitionNotFound(partition.to_string()));
        }
        drop(inner);

        // The fused view is merged into a single immutable segment here; for
        // the in-memory backend the entries already live in one map, so
        // staging is just reserving the output.
        self.stage(output);
        debug!(partition, output = %output, "staged compaction");
        Ok(())
    }

    async fn stage_split(
        &self,
        partition: &str,
        split_threshold: u64,
        read_time: u64,
    ) -> Result<Option<SplitPlan>> {
        self.check_read_time(read_time)?;
        let inner = self.inner.read();
        let index_name = Self::split_index_name(partition)?;
        let state = inner
            .indices
            .get(index_name)
            .ok_or_else(|| Error::IndexNotFound(index_name.to_string()))?;
        let p = state
            .partitions
            .get(partition)
            .ok_or_else(|| Error::PartitionNotFound(partition.to_string()))?;

        // Fine-grained re-check on live entries: the advisory decision was
        // made on the estimate, which may have been inflated by tombstones.
        let live = p.entries.len() as u64;
        if live <= split_threshold || live < 2 {
            return Ok(None);
        }

        let split_key = p
            .entries
            .keys()
            .nth((live / 2) as usize)
            .cloned()
            .ok_or_else(|| Error::Internal("split point out of range".to_string()))?;
        drop(inner);

        let plan = SplitPlan {
            split_key,
            left_output: crate::tasks::fresh_segment_id(),
            right_output: crate::tasks::fresh_segment_id(),
        };
        self.stage(&plan.left_output);
        self.stage(&plan.right_output);
        debug!(partition, "staged split");
        Ok(Some(plan))
    }

    async fn stage_join(&self, left: &str, right: &str, read_time: u64) -> Result<JoinPlan> {
        self.check_read_time(read_time)?;
        let inner = self.inner.read();
        let index_name = Self::split_index_name(left)?;
        let state = inner
            .indices
            .get(index_name)
            .ok_or_else(|| Error::IndexNotFound(index_name.to_string()))?;
        let lp = state
            .partitions
            .get(left)
            .ok_or_else(|| Error::PartitionNotFound(left.to_string()))?;
        let rp = state
            .partitions
            .get(right)
            .ok_or_else(|| Error::PartitionNotFound(right.to_string()))?;

        if lp.meta.right_separator.as_deref() != Some(rp.meta.left_separator.as_slice()) {
            return Err(Error::Task(format!(
                "{} and {} are not adjacent",
                left, right
            )));
        }
        drop(inner);

        let plan = JoinPlan {
            output: crate::tasks::fresh_segment_id(),
        };
        self.stage(&plan.output);
        debug!(left, right, "staged join");
        Ok(plan)
    }

    async fn apply(&self, change: AtomicChange) -> Result<()> {
        match change {
            AtomicChange::SwapResources { partition, output } => {
                self.take_staged(&output)?;
                let mut inner = self.inner.write();
                let journal = inner.journal.clone();
                let index_name = Self::split_index_name(&partition)?.to_string();
                let state = inner
                    .indices
                    .get_mut(&index_name)
                    .ok_or_else(|| Error::IndexNotFound(index_name.clone()))?;
                let p = state
                    .partitions
                    .get_mut(&partition)
                    .ok_or_else(|| Error::PartitionNotFound(partition.clone()))?;

                p.meta.resources = PartitionResources::from_parts(journal, vec![output]);
                p.tombstones = 0;
                p.refresh_estimate();
                debug!(partition = %partition, "swapped in compacted view");
                Ok(())
            }

            AtomicChange::SplitPartition { partition, plan } => {
                self.take_staged(&plan.left_output)?;
                self.take_staged(&plan.right_output)?;
                let mut inner = self.inner.write();
                let journal = inner.journal.clone();
                let index_name = Self::split_index_name(&partition)?.to_string();
                let state = inner
                    .indices
                    .get_mut(&index_name)
                    .ok_or_else(|| Error::IndexNotFound(index_name.clone()))?;

                let mut old = state
                    .partitions
                    .remove(&partition)
                    .ok_or_else(|| Error::PartitionNotFound(partition.clone()))?;
                if !old.meta.contains(&plan.split_key) {
                    state.partitions.insert(partition.clone(), old);
                    return Err(Error::Internal(format!(
                        "split key falls outside {}",
                        partition
                    )));
                }
                let right_entries = old.entries.split_off(&plan.split_key);

                let left_id = state.next_partition_id;
                let right_id = state.next_partition_id + 1;
                state.next_partition_id += 2;
                let left_name = partition_name(&index_name, left_id);
                let right_name = partition_name(&index_name, right_id);

                let left_part = StoredPartition {
                    meta: IndexPartition {
                        index_name: index_name.clone(),
                        partition_id: left_id,
                        left_separator: old.meta.left_separator.clone(),
                        right_separator: Some(plan.split_key.clone()),
                        resources: PartitionResources::from_parts(
                            journal.clone(),
                            vec![plan.left_output.clone()],
                        ),
                        entry_count: old.entries.len() as u64,
                    },
                    host: old.host.clone(),
                    entries: std::mem::take(&mut old.entries),
                    tombstones: 0,
                    // Writes routed to the parent after the seal are buffered
                    // on the current journal; the children inherit that
                    // dependency or the next seal would drop it.
                    dirty: old.dirty,
                };
                let right_part = StoredPartition {
                    meta: IndexPartition {
                        index_name: index_name.clone(),
                        partition_id: right_id,
                        left_separator: plan.split_key.clone(),
                        right_separator: old.meta.right_separator.clone(),
                        resources: PartitionResources::from_parts(
                            journal,
                            vec![plan.right_output.clone()],
                        ),
                        entry_count: right_entries.len() as u64,
                    },
                    host: old.host.clone(),
                    entries: right_entries,
                    tombstones: 0,
                    dirty: old.dirty,
                };

                let pos = state
                    .locator_position(&partition)
                    .ok_or_else(|| Error::Internal(format!("{} missing from locator", partition)))?;
                state.locator.splice(
                    pos..=pos,
                    [
                        LocatorEntry {
                            left: left_part.meta.left_separator.clone(),
                            right: left_part.meta.right_separator.clone(),
                            partition: left_name.clone(),
                            node: old.host.clone(),
                        },
                        LocatorEntry {
                            left: right_part.meta.left_separator.clone(),
                            right: right_part.meta.right_separator.clone(),
                            partition: right_name.clone(),
                            node: old.host.clone(),
                        },
                    ],
                );
                state.partitions.insert(left_name.clone(), left_part);
                state.partitions.insert(right_name.clone(), right_part);

                info!(
                    partition = %partition,
                    left = %left_name,
                    right = %right_name,
                    "split partition"
                );
                Ok(())
            }

            AtomicChange::JoinPartitions { left, right, plan } => {
                self.take_staged(&plan.output)?;
                let mut inner = self.inner.write();
                let journal = inner.journal.clone();
                let index_name = Self::split_index_name(&left)?.to_string();
                let state = inner
                    .indices
                    .get_mut(&index_name)
                    .ok_or_else(|| Error::IndexNotFound(index_name.clone()))?;

                let lp = state
                    .partitions
                    .remove(&left)
                    .ok_or_else(|| Error::PartitionNotFound(left.clone()))?;
                let rp = state
                    .partitions
                    .remove(&right)
                    .ok_or_else(|| Error::PartitionNotFound(right.clone()))?;
                if lp.meta.right_separator.as_deref() != Some(rp.meta.left_separator.as_slice()) {
                    return Err(Error::Task(format!(
                        "{} and {} are not adjacent",
                        left, right
                    )));
                }

                let merged_id = state.next_partition_id;
                state.next_partition_id += 1;
                let merged_name = partition_name(&index_name, merged_id);

                let mut entries = lp.entries;
                entries.extend(rp.entries);
                let merged = StoredPartition {
                    meta: IndexPartition {
                        index_name: index_name.clone(),
                        partition_id: merged_id,
                        left_separator: lp.meta.left_separator.clone(),
                        right_separator: rp.meta.right_separator.clone(),
                        resources: PartitionResources::from_parts(journal, vec![plan.output]),
                        entry_count: entries.len() as u64,
                    },
                    host: lp.host.clone(),
                    entries,
                    tombstones: 0,
                    dirty: lp.dirty || rp.dirty,
                };

                let lpos = state
                    .locator_position(&left)
                    .ok_or_else(|| Error::Internal(format!("{} missing from locator", left)))?;
                let rpos = state
                    .locator_position(&right)
                    .ok_or_else(|| Error::Internal(format!("{} missing from locator", right)))?;
                if rpos != lpos + 1 {
                    return Err(Error::Internal(format!(
                        "{} and {} are not locator neighbors",
                        left, right
                    )));
                }
                state.locator.splice(
                    lpos..=rpos,
                    [LocatorEntry {
                        left: merged.meta.left_separator.clone(),
                        right: merged.meta.right_separator.clone(),
                        partition: merged_name.clone(),
                        node: lp.host.clone(),
                    }],
                );
                state.partitions.insert(merged_name.clone(), merged);

                info!(left = %left, right = %right, merged = %merged_name, "joined partitions");
                Ok(())
            }

            AtomicChange::Relocate {
                partition,
                target,
                output,
            } => {
                self.take_staged(&output)?;
                let mut inner = self.inner.write();
                let journal = inner.journal.clone();
                let index_name = Self::split_index_name(&partition)?.to_string();
                let state = inner
                    .indices
                    .get_mut(&index_name)
                    .ok_or_else(|| Error::IndexNotFound(index_name.clone()))?;
                let p = state
                    .partitions
                    .get_mut(&partition)
                    .ok_or_else(|| Error::PartitionNotFound(partition.clone()))?;

                p.host = target.clone();
                p.meta.resources = PartitionResources::from_parts(journal, vec![output]);
                p.tombstones = 0;
                p.refresh_estimate();

                let pos = state
                    .locator_position(&partition)
                    .ok_or_else(|| Error::Internal(format!("{} missing from locator", partition)))?;
                state.locator[pos].node = target.clone();

                info!(partition = %partition, target = %target, "relocated partition");
                Ok(())
            }
        }
    }
}
