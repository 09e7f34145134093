//! Overflow controller
//!
//! Runs one post-processing cycle per sealed journal: classifies every
//! locally hosted partition into exactly one of {skip, build, split, join,
//! move}, dispatches the resulting tasks to the concurrency manager, and
//! awaits completion. Only one cycle may be active at a time per node.

mod join;
mod moves;

pub use join::JoinCandidateResolver;
pub use moves::MoveCandidateSelector;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::ControllerConfig;
use crate::partition::{IndexPartition, JournalSeal, PartitionCatalog, PartitionName};
use crate::policy::{IndexPolicy, SplitJoinAdvisor};
use crate::scoring::ScoreBoard;
use crate::services::{ConcurrencyManager, LoadBalancerService, MetadataLookupService};
use crate::tasks::{fresh_segment_id, OverflowTask, TaskKind};
use crate::{Error, Result};

/// Per-cycle set of partitions already assigned to a task.
///
/// Marking a partition twice is a classification bug, not a runtime
/// condition, and fails fast.
#[derive(Debug, Default)]
pub struct UsedSet(HashSet<PartitionName>);

impl UsedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&mut self, name: PartitionName) {
        let fresh = self.0.insert(name.clone());
        assert!(
            fresh,
            "partition {} assigned to two actions in one overflow cycle",
            name
        );
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Explicit single-flight state token; transitions happen only inside the
/// controller's own sequential logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControllerState {
    Idle,
    Running,
}

/// Restores `Idle` when the cycle ends, regardless of outcome — including
/// cancellation and panics.
struct CycleGate<'a> {
    state: &'a Mutex<ControllerState>,
}

impl Drop for CycleGate<'_> {
    fn drop(&mut self) {
        *self.state.lock() = ControllerState::Idle;
    }
}

/// Outcome of one overflow cycle. Bucket counts are per partition: a join
/// accounts for both of the partitions it consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleReport {
    pub commit_time: u64,
    /// Local partitions classified this cycle
    pub done: usize,
    pub skipped: usize,
    pub builds: usize,
    pub splits: usize,
    /// Partitions consumed by join tasks (2 per join)
    pub joined: usize,
    pub moves: usize,
    /// Tasks that failed or missed the dispatch deadline
    pub failed_tasks: usize,
    pub elapsed_ms: u64,
}

/// Partition-lifecycle controller for one node.
pub struct OverflowController {
    config: ControllerConfig,
    catalog: Arc<dyn PartitionCatalog>,
    concurrency: Arc<dyn ConcurrencyManager>,
    resolver: JoinCandidateResolver,
    selector: MoveCandidateSelector,
    /// Per-index capacity policies; indices without an entry use the
    /// config's default policy
    policies: RwLock<HashMap<String, IndexPolicy>>,
    state: Mutex<ControllerState>,
    cycles_completed: AtomicU64,
    shutdown: CancellationToken,
}

impl OverflowController {
    pub fn new(
        config: ControllerConfig,
        catalog: Arc<dyn PartitionCatalog>,
        locator: Arc<dyn MetadataLookupService>,
        balancer: Arc<dyn LoadBalancerService>,
        concurrency: Arc<dyn ConcurrencyManager>,
    ) -> Self {
        let resolver = JoinCandidateResolver::new(
            locator,
            config.local_node.clone(),
            config.lookup_timeout,
        );
        let selector = MoveCandidateSelector::new(
            balancer,
            config.local_node.clone(),
            config.move_band,
            config.max_moves_per_target,
            config.max_move_targets,
            config.min_active_partitions,
        );
        Self {
            config,
            catalog,
            concurrency,
            resolver,
            selector,
            policies: RwLock::new(HashMap::new()),
            state: Mutex::new(ControllerState::Idle),
            cycles_completed: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    /// Override the capacity policy for one scale-out index.
    pub fn set_index_policy(&self, index_name: &str, policy: IndexPolicy) {
        self.policies.write().insert(index_name.to_string(), policy);
    }

    /// Token observed at every blocking point; cancelling it makes the
    /// controller terminate promptly without wedging the cycle gate.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Number of cycles that ran to completion.
    pub fn cycles_completed(&self) -> u64 {
        self.cycles_completed.load(Ordering::Relaxed)
    }

    /// Run overflow cycles for every seal received, until the channel
    /// closes or shutdown is requested.
    pub async fn run(self: Arc<Self>, mut seals: mpsc::Receiver<JournalSeal>) {
        loop {
            tokio::select! {
                maybe = seals.recv() => match maybe {
                    Some(seal) => {
                        match self.run_cycle(&seal).await {
                            Ok(_) => {}
                            Err(Error::Shutdown) => break,
                            // Cycle-level failure: logged, gate already
                            // restored, the next seal is processed normally.
                            Err(e) => error!("overflow cycle failed: {}", e),
                        }
                    }
                    None => break,
                },
                _ = self.shutdown.cancelled() => break,
            }
        }
        info!("overflow controller stopped");
    }

    /// Run one overflow cycle for a sealed journal.
    ///
    /// Returns `Error::OverflowInProgress` if a cycle is already active;
    /// the caller retries with the next seal.
    pub async fn run_cycle(&self, seal: &JournalSeal) -> Result<CycleReport> {
        let _gate = self.begin_cycle()?;
        let started = Instant::now();

        let result = self.classify_and_dispatch(seal, started).await;
        match &result {
            Ok(report) => {
                self.cycles_completed.fetch_add(1, Ordering::Relaxed);
                info!(
                    commit_time = report.commit_time,
                    done = report.done,
                    skipped = report.skipped,
                    builds = report.builds,
                    splits = report.splits,
                    joined = report.joined,
                    moves = report.moves,
                    failed_tasks = report.failed_tasks,
                    elapsed_ms = report.elapsed_ms,
                    "overflow cycle complete"
                );
            }
            Err(e) => error!(commit_time = seal.commit_time, "overflow cycle failed: {}", e),
        }
        result
    }

    fn begin_cycle(&self) -> Result<CycleGate<'_>> {
        let mut state = self.state.lock();
        match *state {
            ControllerState::Running => Err(Error::OverflowInProgress),
            ControllerState::Idle => {
                *state = ControllerState::Running;
                Ok(CycleGate { state: &self.state })
            }
        }
    }

    fn advisor_for(&self, index_name: &str) -> SplitJoinAdvisor {
        let policy = self
            .policies
            .read()
            .get(index_name)
            .copied()
            .unwrap_or(self.config.default_policy);
        SplitJoinAdvisor::new(policy)
    }

    async fn classify_and_dispatch(
        &self,
        seal: &JournalSeal,
        started: Instant,
    ) -> Result<CycleReport> {
        let partitions = tokio::select! {
            res = self.catalog.partitions_at(seal.commit_time) => res?,
            _ = self.shutdown.cancelled() => return Err(Error::Shutdown),
        };
        let board = ScoreBoard::compute(&seal.counters, &seal.total);
        let read_time = seal.commit_time;

        let mut used = UsedSet::new();
        let mut tasks: Vec<OverflowTask> = Vec::new();

        // 1. Join/move by underflow first: it may consume both sides of a
        //    sibling pair.
        let mut join_groups: BTreeMap<String, Vec<IndexPartition>> = BTreeMap::new();
        for p in &partitions {
            if self.advisor_for(&p.index_name).should_join(p) {
                join_groups
                    .entry(p.index_name.clone())
                    .or_default()
                    .push(p.clone());
            }
        }
        tasks.extend(
            self.resolver
                .resolve(&join_groups, read_time, &mut used, &self.shutdown)
                .await?,
        );

        // 2. Move by load over the partitions not yet used.
        let locals: HashSet<PartitionName> = partitions.iter().map(|p| p.name()).collect();
        let active_count = partitions
            .iter()
            .filter(|p| !seal.copied_forward.contains(&p.name()))
            .count();
        tasks.extend(
            self.selector
                .select(
                    &board,
                    &locals,
                    active_count,
                    read_time,
                    &mut used,
                    &self.shutdown,
                )
                .await?,
        );

        let mut joined = 0usize;
        let mut moves = 0usize;
        for t in &tasks {
            match t.kind() {
                TaskKind::Join => joined += 2,
                TaskKind::Move => moves += 1,
                _ => {}
            }
        }

        // 3. Remainder: skip partitions already satisfied by the seal's
        //    copy-forward, split the overcapacity ones, build the rest.
        let mut skipped = 0usize;
        let mut builds = 0usize;
        let mut splits = 0usize;
        for p in &partitions {
            let name = p.name();
            if used.contains(&name) {
                continue;
            }
            if seal.copied_forward.contains(&name) {
                used.mark(name);
                skipped += 1;
                continue;
            }
            let advisor = self.advisor_for(&p.index_name);
            if advisor.should_split(p) {
                used.mark(name.clone());
                splits += 1;
                tasks.push(OverflowTask::Split {
                    partition: name,
                    split_threshold: advisor.policy().split_threshold(),
                    read_time,
                });
            } else {
                used.mark(name.clone());
                builds += 1;
                tasks.push(OverflowTask::Build {
                    partition: name,
                    output: fresh_segment_id(),
                    read_time,
                });
            }
        }

        // Completeness: every local partition lands in exactly one bucket.
        let done = partitions.len();
        assert_eq!(
            done,
            skipped + builds + splits + joined + moves,
            "overflow classification lost or double-counted a partition"
        );
        assert_eq!(
            used.len(),
            done,
            "used set does not cover every local partition"
        );

        // 4. Dispatch and await with a bounded deadline. Per-task failures
        //    are logged and ignored: the affected partition keeps its
        //    dependency on the sealed journal and is reconsidered next
        //    cycle.
        let handles =
            futures::future::join_all(tasks.into_iter().map(|t| self.concurrency.submit(t))).await;
        let results = tokio::select! {
            res = self.concurrency.await_all(handles, self.config.dispatch_timeout) => res,
            _ = self.shutdown.cancelled() => return Err(Error::Shutdown),
        };

        let mut failed_tasks = 0usize;
        for r in &results {
            if let Err(e) = &r.outcome {
                failed_tasks += 1;
                warn!(
                    kind = r.kind.as_str(),
                    partitions = ?r.partitions,
                    transient = e.is_transient(),
                    "overflow task failed, partition retained for next cycle: {}",
                    e
                );
            }
        }

        Ok(CycleReport {
            commit_time: seal.commit_time,
            done,
            skipped,
            builds,
            splits,
            joined,
            moves,
            failed_tasks,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_used_set_tracks_membership() {
        let mut used = UsedSet::new();
        assert!(used.is_empty());
        used.mark("idx#0".to_string());
        assert!(used.contains("idx#0"));
        assert!(!used.contains("idx#1"));
        assert_eq!(used.len(), 1);
    }

    #[test]
    #[should_panic(expected = "two actions in one overflow cycle")]
    fn test_used_set_rejects_double_mark() {
        let mut used = UsedSet::new();
        used.mark("idx#0".to_string());
        used.mark("idx#0".to_string());
    }

    #[test]
    fn test_cycle_report_serializes_for_ops_tooling() {
        let report = CycleReport {
            commit_time: 42,
            done: 3,
            skipped: 1,
            builds: 2,
            splits: 0,
            joined: 0,
            moves: 0,
            failed_tasks: 0,
            elapsed_ms: 17,
        };
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"done\":3"));

        let back: CycleReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back.commit_time, 42);
        assert_eq!(back.builds, 2);
    }
}
