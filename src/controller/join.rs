//! Join candidate resolution
//!
//! For each undercapacity partition, resolves the host of its right sibling
//! through the locator service and decides local-join vs. remote-move. The
//! right separator of a partition is, by construction, also the lookup key
//! for its right sibling.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::UsedSet;
use crate::partition::{IndexPartition, NodeId};
use crate::services::MetadataLookupService;
use crate::tasks::OverflowTask;
use crate::{Error, Result};

pub struct JoinCandidateResolver {
    locator: Arc<dyn MetadataLookupService>,
    local_node: NodeId,
    lookup_timeout: Duration,
}

impl JoinCandidateResolver {
    pub fn new(
        locator: Arc<dyn MetadataLookupService>,
        local_node: NodeId,
        lookup_timeout: Duration,
    ) -> Self {
        Self {
            locator,
            local_node,
            lookup_timeout,
        }
    }

    /// Resolve join-eligible partitions, grouped by scale-out index, into
    /// Join and Move tasks.
    ///
    /// One batched lookup per index group. A failed or timed-out lookup
    /// skips that group for this cycle: its partitions stay unused, fall
    /// through to Build, and are reconsidered next cycle. Partitions
    /// consumed here are marked used (both sides for a join, only the
    /// source for a move).
    pub async fn resolve(
        &self,
        candidates: &BTreeMap<String, Vec<IndexPartition>>,
        read_time: u64,
        used: &mut UsedSet,
        shutdown: &CancellationToken,
    ) -> Result<Vec<OverflowTask>> {
        let mut tasks = Vec::new();

        for (index_name, group) in candidates {
            let keys: Vec<Vec<u8>> = group
                .iter()
                .map(|p| {
                    // The last partition of an index has no right separator
                    // and must never reach the resolver.
                    p.right_separator.clone().unwrap_or_else(|| {
                        panic!(
                            "join candidate {} has an open right boundary",
                            p.name()
                        )
                    })
                })
                .collect();

            let lookup = timeout(
                self.lookup_timeout,
                self.locator.locate_batch(index_name, &keys, read_time),
            );
            let located = tokio::select! {
                res = lookup => match res {
                    Ok(Ok(located)) => located,
                    Ok(Err(e)) => {
                        warn!(
                            index = index_name.as_str(),
                            candidates = group.len(),
                            "sibling lookup failed, skipping group this cycle: {}",
                            e
                        );
                        continue;
                    }
                    Err(_) => {
                        warn!(
                            index = index_name.as_str(),
                            candidates = group.len(),
                            "sibling lookup timed out, skipping group this cycle"
                        );
                        continue;
                    }
                },
                _ = shutdown.cancelled() => return Err(Error::Shutdown),
            };

            if located.len() != group.len() {
                warn!(
                    index = index_name.as_str(),
                    expected = group.len(),
                    got = located.len(),
                    "sibling lookup returned wrong cardinality, skipping group"
                );
                continue;
            }

            for (p, sibling) in group.iter().zip(located) {
                let name = p.name();
                if used.contains(&name) {
                    continue;
                }
                if sibling.node == self.local_node {
                    // Chained candidates: if the sibling was already consumed
                    // by an earlier pair, leave this one for Build.
                    if used.contains(&sibling.partition) {
                        continue;
                    }
                    debug!(left = %name, right = %sibling.partition, "join with local sibling");
                    used.mark(name.clone());
                    used.mark(sibling.partition.clone());
                    tasks.push(OverflowTask::Join {
                        left: name,
                        right: sibling.partition,
                        read_time,
                    });
                } else {
                    debug!(partition = %name, target = %sibling.node, "sibling is remote, moving");
                    used.mark(name.clone());
                    tasks.push(OverflowTask::Move {
                        partition: name,
                        target: sibling.node,
                        read_time,
                    });
                }
            }
        }

        Ok(tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::{HostLocator, PartitionResources, SeparatorKey};
    use async_trait::async_trait;

    struct FixedLocator {
        answers: Vec<HostLocator>,
    }

    #[async_trait]
    impl MetadataLookupService for FixedLocator {
        async fn locate_batch(
            &self,
            _index: &str,
            keys: &[SeparatorKey],
            _read_time: u64,
        ) -> Result<Vec<HostLocator>> {
            Ok(self.answers.iter().take(keys.len()).cloned().collect())
        }
    }

    struct FailingLocator;

    #[async_trait]
    impl MetadataLookupService for FailingLocator {
        async fn locate_batch(
            &self,
            _index: &str,
            _keys: &[SeparatorKey],
            _read_time: u64,
        ) -> Result<Vec<HostLocator>> {
            Err(Error::Lookup("connection refused".to_string()))
        }
    }

    fn candidate(id: u64, left: &[u8], right: &[u8]) -> IndexPartition {
        IndexPartition {
            index_name: "idx".to_string(),
            partition_id: id,
            left_separator: left.to_vec(),
            right_separator: Some(right.to_vec()),
            resources: PartitionResources::new("journal-2".to_string()),
            entry_count: 10,
        }
    }

    fn group_of(parts: Vec<IndexPartition>) -> BTreeMap<String, Vec<IndexPartition>> {
        let mut m = BTreeMap::new();
        m.insert("idx".to_string(), parts);
        m
    }

    #[tokio::test]
    async fn test_local_sibling_becomes_join() {
        let locator = Arc::new(FixedLocator {
            answers: vec![HostLocator {
                partition: "idx#1".to_string(),
                node: "node-1".to_string(),
            }],
        });
        let resolver =
            JoinCandidateResolver::new(locator, "node-1".to_string(), Duration::from_secs(1));
        let mut used = UsedSet::new();
        let shutdown = CancellationToken::new();

        let tasks = resolver
            .resolve(
                &group_of(vec![candidate(0, b"", b"m")]),
                5,
                &mut used,
                &shutdown,
            )
            .await
            .unwrap();

        assert_eq!(tasks.len(), 1);
        assert!(matches!(
            &tasks[0],
            OverflowTask::Join { left, right, .. } if left == "idx#0" && right == "idx#1"
        ));
        assert!(used.contains("idx#0") && used.contains("idx#1"));
    }

    #[tokio::test]
    async fn test_remote_sibling_becomes_move() {
        let locator = Arc::new(FixedLocator {
            answers: vec![HostLocator {
                partition: "idx#1".to_string(),
                node: "node-9".to_string(),
            }],
        });
        let resolver =
            JoinCandidateResolver::new(locator, "node-1".to_string(), Duration::from_secs(1));
        let mut used = UsedSet::new();
        let shutdown = CancellationToken::new();

        let tasks = resolver
            .resolve(
                &group_of(vec![candidate(0, b"", b"m")]),
                5,
                &mut used,
                &shutdown,
            )
            .await
            .unwrap();

        assert_eq!(tasks.len(), 1);
        assert!(matches!(
            &tasks[0],
            OverflowTask::Move { partition, target, .. }
                if partition == "idx#0" && target == "node-9"
        ));
        assert!(used.contains("idx#0"));
        assert!(!used.contains("idx#1"), "move consumes only the source");
    }

    #[tokio::test]
    async fn test_lookup_failure_skips_group_without_error() {
        let resolver = JoinCandidateResolver::new(
            Arc::new(FailingLocator),
            "node-1".to_string(),
            Duration::from_secs(1),
        );
        let mut used = UsedSet::new();
        let shutdown = CancellationToken::new();

        let tasks = resolver
            .resolve(
                &group_of(vec![candidate(0, b"", b"m")]),
                5,
                &mut used,
                &shutdown,
            )
            .await
            .unwrap();

        assert!(tasks.is_empty());
        assert!(!used.contains("idx#0"), "skipped group stays unused");
    }

    #[tokio::test]
    async fn test_chained_candidates_do_not_double_consume() {
        // idx#0 joins idx#1; idx#1 is itself a candidate whose sibling is
        // idx#2, but it was consumed by the first pair.
        let locator = Arc::new(FixedLocator {
            answers: vec![
                HostLocator {
                    partition: "idx#1".to_string(),
                    node: "node-1".to_string(),
                },
                HostLocator {
                    partition: "idx#2".to_string(),
                    node: "node-1".to_string(),
                },
            ],
        });
        let resolver =
            JoinCandidateResolver::new(locator, "node-1".to_string(), Duration::from_secs(1));
        let mut used = UsedSet::new();
        let shutdown = CancellationToken::new();

        let tasks = resolver
            .resolve(
                &group_of(vec![candidate(0, b"", b"g"), candidate(1, b"g", b"p")]),
                5,
                &mut used,
                &shutdown,
            )
            .await
            .unwrap();

        assert_eq!(tasks.len(), 1);
        assert!(!used.contains("idx#2"));
    }

    #[tokio::test]
    #[should_panic(expected = "open right boundary")]
    async fn test_open_right_candidate_panics() {
        let resolver = JoinCandidateResolver::new(
            Arc::new(FailingLocator),
            "node-1".to_string(),
            Duration::from_secs(1),
        );
        let mut used = UsedSet::new();
        let shutdown = CancellationToken::new();

        let mut last = candidate(0, b"", b"m");
        last.right_separator = None;

        let _ = resolver
            .resolve(&group_of(vec![last]), 5, &mut used, &shutdown)
            .await;
    }
}
