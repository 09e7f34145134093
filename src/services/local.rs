//! In-memory service implementations for development and tests.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use super::{ConcurrencyManager, LoadBalancerService, PartitionStore, TaskHandle, TaskResult};
use crate::partition::NodeId;
use crate::tasks::OverflowTask;
use crate::{Error, Result};

/// Load balancer backed by explicitly set utilization state.
#[derive(Default)]
pub struct LocalLoadBalancer {
    inner: RwLock<BalancerState>,
}

#[derive(Default)]
struct BalancerState {
    highly_utilized: HashSet<NodeId>,
    under_utilized: Vec<NodeId>,
}

impl LocalLoadBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark or clear a node as highly utilized.
    pub fn set_highly_utilized(&self, node: &str, value: bool) {
        let mut state = self.inner.write();
        if value {
            state.highly_utilized.insert(node.to_string());
        } else {
            state.highly_utilized.remove(node);
        }
    }

    /// Replace the set of under-utilized nodes, in preference order.
    pub fn set_under_utilized(&self, nodes: Vec<NodeId>) {
        self.inner.write().under_utilized = nodes;
    }
}

#[async_trait]
impl LoadBalancerService for LocalLoadBalancer {
    async fn is_highly_utilized(&self, node: &str) -> Result<bool> {
        Ok(self.inner.read().highly_utilized.contains(node))
    }

    async fn under_utilized_nodes(
        &self,
        min_count: usize,
        max_count: usize,
        exclude: &str,
    ) -> Result<Vec<NodeId>> {
        let state = self.inner.read();
        let nodes: Vec<NodeId> = state
            .under_utilized
            .iter()
            .filter(|n| n.as_str() != exclude)
            .take(max_count)
            .cloned()
            .collect();

        if nodes.len() < min_count {
            return Ok(Vec::new());
        }
        Ok(nodes)
    }
}

/// Concurrency manager executing tasks on the tokio runtime with
/// per-partition mutual exclusion.
///
/// Each partition name maps to an async mutex; a task acquires the mutexes
/// for its whole lock set in sorted order before running, so tasks naming
/// overlapping partitions serialize and disjoint tasks run concurrently.
pub struct LocalConcurrencyManager {
    store: Arc<dyn PartitionStore>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl LocalConcurrencyManager {
    pub fn new(store: Arc<dyn PartitionStore>) -> Self {
        Self {
            store,
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[async_trait]
impl ConcurrencyManager for LocalConcurrencyManager {
    async fn submit(&self, task: OverflowTask) -> TaskHandle {
        let kind = task.kind();
        let mut names = task.lock_set();
        // Sorted acquisition order keeps overlapping lock sets deadlock-free.
        names.sort();
        names.dedup();

        let locks: Vec<Arc<Mutex<()>>> = names.iter().map(|n| self.lock_for(n)).collect();
        let store = Arc::clone(&self.store);
        let partitions = names.clone();

        let join = tokio::spawn(async move {
            let mut guards = Vec::with_capacity(locks.len());
            for lock in &locks {
                guards.push(lock.clone().lock_owned().await);
            }
            task.execute(store.as_ref()).await
        });

        TaskHandle::new(kind, partitions, join)
    }

    async fn await_all(&self, handles: Vec<TaskHandle>, timeout: Duration) -> Vec<TaskResult> {
        let deadline = Instant::now() + timeout;
        let mut results = Vec::with_capacity(handles.len());

        for mut handle in handles {
            let outcome = match timeout_at(deadline, &mut handle.join).await {
                Ok(Ok(task_outcome)) => task_outcome,
                Ok(Err(join_err)) => Err(Error::Task(format!(
                    "{} task aborted: {}",
                    handle.kind.as_str(),
                    join_err
                ))),
                Err(_) => {
                    // Deadline missed: stop awaiting but let the task run to
                    // completion, logging its eventual outcome.
                    let kind = handle.kind;
                    let partitions = handle.partitions.clone();
                    let log_partitions = partitions.clone();
                    tokio::spawn(async move {
                        match handle.join.await {
                            Ok(Ok(())) => debug!(
                                kind = kind.as_str(),
                                partitions = ?log_partitions,
                                "late task completed after deadline"
                            ),
                            Ok(Err(e)) => warn!(
                                kind = kind.as_str(),
                                partitions = ?log_partitions,
                                "late task failed after deadline: {}",
                                e
                            ),
                            Err(join_err) => warn!(
                                kind = kind.as_str(),
                                partitions = ?log_partitions,
                                "late task aborted: {}",
                                join_err
                            ),
                        }
                    });
                    results.push(TaskResult {
                        kind,
                        partitions,
                        outcome: Err(Error::Timeout),
                    });
                    continue;
                }
            };

            results.push(TaskResult {
                kind: handle.kind,
                partitions: handle.partitions,
                outcome,
            });
        }

        results
    }
}
