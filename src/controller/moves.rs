//! Load-based move selection
//!
//! When the local node is highly utilized, relocates a bounded number of
//! "warm" partitions to under-utilized nodes. Cold partitions are skipped
//! because moving them relieves no load; hot partitions are skipped because
//! suspending their writes costs latency proportional to their buffered
//! volume. The warm band is the open fractional-rank interval (0.3, 0.8).

use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::UsedSet;
use crate::partition::{NodeId, PartitionName};
use crate::scoring::ScoreBoard;
use crate::services::LoadBalancerService;
use crate::tasks::OverflowTask;
use crate::{Error, Result};

pub struct MoveCandidateSelector {
    balancer: Arc<dyn LoadBalancerService>,
    local_node: NodeId,
    /// Open fractional-rank interval partitions must fall inside
    band: (f64, f64),
    max_moves_per_target: usize,
    max_move_targets: usize,
    min_active_partitions: usize,
}

impl MoveCandidateSelector {
    pub fn new(
        balancer: Arc<dyn LoadBalancerService>,
        local_node: NodeId,
        band: (f64, f64),
        max_moves_per_target: usize,
        max_move_targets: usize,
        min_active_partitions: usize,
    ) -> Self {
        Self {
            balancer,
            local_node,
            band,
            max_moves_per_target,
            max_move_targets,
            min_active_partitions,
        }
    }

    /// Select up to `min(active_surplus, max_moves_per_target × targets)`
    /// warm partitions to relocate, round-robining over the under-utilized
    /// targets. Any load-balancer failure aborts selection with an empty
    /// result; that is not fatal to the cycle.
    pub async fn select(
        &self,
        board: &ScoreBoard,
        locals: &HashSet<PartitionName>,
        active_count: usize,
        read_time: u64,
        used: &mut UsedSet,
        shutdown: &CancellationToken,
    ) -> Result<Vec<OverflowTask>> {
        if active_count <= self.min_active_partitions {
            return Ok(Vec::new());
        }

        let highly_utilized = tokio::select! {
            res = self.balancer.is_highly_utilized(&self.local_node) => match res {
                Ok(v) => v,
                Err(e) => {
                    warn!("load balancer utilization query failed, skipping moves: {}", e);
                    return Ok(Vec::new());
                }
            },
            _ = shutdown.cancelled() => return Err(Error::Shutdown),
        };
        if !highly_utilized {
            return Ok(Vec::new());
        }

        let targets = tokio::select! {
            res = self.balancer.under_utilized_nodes(1, self.max_move_targets, &self.local_node) => {
                match res {
                    Ok(t) => t,
                    Err(e) => {
                        warn!("move target discovery failed, skipping moves: {}", e);
                        return Ok(Vec::new());
                    }
                }
            }
            _ = shutdown.cancelled() => return Err(Error::Shutdown),
        };
        if targets.is_empty() {
            debug!("no under-utilized move targets");
            return Ok(Vec::new());
        }

        let surplus = active_count - self.min_active_partitions;
        let budget = surplus.min(self.max_moves_per_target * targets.len());

        let mut tasks = Vec::new();
        for score in board.ascending() {
            if tasks.len() >= budget {
                break;
            }
            if score.fractional_rank <= self.band.0 || score.fractional_rank >= self.band.1 {
                continue;
            }
            if used.contains(&score.name) || !locals.contains(&score.name) {
                continue;
            }

            let target = targets[tasks.len() % targets.len()].clone();
            debug!(
                partition = %score.name,
                fractional_rank = score.fractional_rank,
                target = %target,
                "selected warm partition for move"
            );
            used.mark(score.name.clone());
            tasks.push(OverflowTask::Move {
                partition: score.name.clone(),
                target,
                read_time,
            });
        }

        Ok(tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoring::Counters;
    use crate::services::LocalLoadBalancer;
    use async_trait::async_trait;
    use std::collections::HashMap;

    fn board_of(n: usize) -> (ScoreBoard, HashSet<PartitionName>) {
        let mut counters = HashMap::new();
        let mut total = Counters::default();
        for i in 0..n {
            let c = Counters {
                normal_ops: (i as u64 + 1) * 10,
                ..Counters::default()
            };
            total.merge(&c);
            counters.insert(format!("idx#{}", i), c);
        }
        let locals = counters.keys().cloned().collect();
        (ScoreBoard::compute(&counters, &total), locals)
    }

    fn selector(balancer: Arc<dyn LoadBalancerService>) -> MoveCandidateSelector {
        MoveCandidateSelector::new(balancer, "node-1".to_string(), (0.3, 0.8), 2, 3, 1)
    }

    fn ready_balancer(targets: Vec<&str>) -> Arc<LocalLoadBalancer> {
        let b = Arc::new(LocalLoadBalancer::new());
        b.set_highly_utilized("node-1", true);
        b.set_under_utilized(targets.into_iter().map(String::from).collect());
        b
    }

    #[tokio::test]
    async fn test_inactive_when_not_highly_utilized() {
        let balancer = Arc::new(LocalLoadBalancer::new());
        balancer.set_under_utilized(vec!["node-2".to_string()]);
        let sel = selector(balancer);
        let (board, locals) = board_of(10);
        let mut used = UsedSet::new();

        let tasks = sel
            .select(&board, &locals, 10, 5, &mut used, &CancellationToken::new())
            .await
            .unwrap();
        assert!(tasks.is_empty());
    }

    #[tokio::test]
    async fn test_band_excludes_cold_and_hot() {
        let sel = selector(ready_balancer(vec!["node-2", "node-3"]));
        let (board, locals) = board_of(10);
        let mut used = UsedSet::new();

        let tasks = sel
            .select(&board, &locals, 10, 5, &mut used, &CancellationToken::new())
            .await
            .unwrap();

        assert!(!tasks.is_empty());
        for t in &tasks {
            let OverflowTask::Move { partition, .. } = t else {
                panic!("expected move");
            };
            let fr = board.score(partition).unwrap().fractional_rank;
            assert!(fr > 0.3 && fr < 0.8, "fractional rank {} out of band", fr);
        }
    }

    #[tokio::test]
    async fn test_budget_bounds_moves() {
        // 10 active, min 1 => surplus 9; 1 target × 2 per target => 2 moves
        let sel = selector(ready_balancer(vec!["node-2"]));
        let (board, locals) = board_of(10);
        let mut used = UsedSet::new();

        let tasks = sel
            .select(&board, &locals, 10, 5, &mut used, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(tasks.len(), 2);
    }

    #[tokio::test]
    async fn test_round_robin_target_assignment() {
        let sel = selector(ready_balancer(vec!["node-2", "node-3"]));
        let (board, locals) = board_of(10);
        let mut used = UsedSet::new();

        let tasks = sel
            .select(&board, &locals, 10, 5, &mut used, &CancellationToken::new())
            .await
            .unwrap();

        let targets: Vec<&str> = tasks
            .iter()
            .map(|t| match t {
                OverflowTask::Move { target, .. } => target.as_str(),
                _ => unreachable!(),
            })
            .collect();
        assert!(targets.contains(&"node-2") && targets.contains(&"node-3"));
    }

    #[tokio::test]
    async fn test_too_few_active_partitions_disables_moves() {
        let sel = selector(ready_balancer(vec!["node-2"]));
        let (board, locals) = board_of(10);
        let mut used = UsedSet::new();

        let tasks = sel
            .select(&board, &locals, 1, 5, &mut used, &CancellationToken::new())
            .await
            .unwrap();
        assert!(tasks.is_empty());
    }

    #[tokio::test]
    async fn test_balancer_failure_aborts_selection_quietly() {
        struct BrokenBalancer;

        #[async_trait]
        impl LoadBalancerService for BrokenBalancer {
            async fn is_highly_utilized(&self, _node: &str) -> Result<bool> {
                Err(Error::LoadBalancer("rpc error".to_string()))
            }
            async fn under_utilized_nodes(
                &self,
                _min: usize,
                _max: usize,
                _exclude: &str,
            ) -> Result<Vec<NodeId>> {
                Err(Error::LoadBalancer("rpc error".to_string()))
            }
        }

        let sel = selector(Arc::new(BrokenBalancer));
        let (board, locals) = board_of(10);
        let mut used = UsedSet::new();

        let tasks = sel
            .select(&board, &locals, 10, 5, &mut used, &CancellationToken::new())
            .await
            .unwrap();
        assert!(tasks.is_empty());
        assert_eq!(used.len(), 0);
    }
}
