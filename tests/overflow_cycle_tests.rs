//! End-to-end overflow cycles against the in-memory store.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use keyspan::partition::{HostLocator, SeparatorKey};
use keyspan::prelude::*;

fn key(i: u32) -> Vec<u8> {
    i.to_be_bytes().to_vec()
}

fn controller_with(
    store: &Arc<MemoryIndexStore>,
    locator: Arc<dyn MetadataLookupService>,
    balancer: Arc<LocalLoadBalancer>,
) -> OverflowController {
    let concurrency = Arc::new(LocalConcurrencyManager::new(
        store.clone() as Arc<dyn PartitionStore>,
    ));
    OverflowController::new(
        ControllerConfig::new(store.node_id().clone()),
        store.clone() as Arc<dyn PartitionCatalog>,
        locator,
        balancer,
        concurrency,
    )
}

fn controller_over(store: &Arc<MemoryIndexStore>) -> OverflowController {
    controller_with(
        store,
        store.clone() as Arc<dyn MetadataLookupService>,
        Arc::new(LocalLoadBalancer::new()),
    )
}

/// Locator wrapper whose lookups can be switched to fail.
struct FlakyLocator {
    inner: Arc<MemoryIndexStore>,
    fail: AtomicBool,
}

#[async_trait]
impl MetadataLookupService for FlakyLocator {
    async fn locate_batch(
        &self,
        index_name: &str,
        keys: &[SeparatorKey],
        read_time: u64,
    ) -> keyspan::Result<Vec<HostLocator>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(keyspan::Error::Lookup("locator unavailable".to_string()));
        }
        self.inner.locate_batch(index_name, keys, read_time).await
    }
}

#[tokio::test]
async fn test_fresh_index_overflow_skips_clean_partition() {
    let store = Arc::new(MemoryIndexStore::new("node-1"));
    let controller = controller_over(&store);
    store.register_index("orders").unwrap();

    let seal = store.seal_journal();
    let report = controller.run_cycle(&seal).await.unwrap();

    // Registration is administrative: the lone partition is clean, copies
    // forward, and needs no task.
    assert_eq!(report.done, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(
        report.builds + report.splits + report.joined + report.moves,
        0
    );
    assert_eq!(report.failed_tasks, 0);
    assert_eq!(store.local_partition_count("orders"), 1);
    assert!(store.scan("orders").unwrap().is_empty());
    assert_eq!(controller.cycles_completed(), 1);
}

#[tokio::test]
async fn test_build_drops_sealed_journal_dependency() {
    let store = Arc::new(MemoryIndexStore::new("node-1"));
    let controller = controller_over(&store);
    store.register_index("orders").unwrap();
    store.write("orders", &key(1), b"v").unwrap();

    let seal = store.seal_journal();
    let before = store.partition_meta("orders#0").unwrap();
    assert!(before.resources.depends_on(&seal.sealed_journal));

    let report = controller.run_cycle(&seal).await.unwrap();
    assert_eq!(report.builds, 1);
    assert_eq!(report.failed_tasks, 0);

    let after = store.partition_meta("orders#0").unwrap();
    assert!(!after.resources.depends_on(&seal.sealed_journal));
    assert_eq!(after.resources.journal(), "journal-2");
    assert_eq!(store.scan("orders").unwrap().len(), 1);
}

#[tokio::test]
async fn test_growth_splits_partition_over_capacity() {
    let store = Arc::new(MemoryIndexStore::new("node-1"));
    let controller = controller_over(&store);
    store.register_index("orders").unwrap();

    // Default policy: target 400 × multiplier 1.5 = split above 600.
    let mut truth = BTreeMap::new();
    let mut next = 0u32;
    let mut splits = 0;
    for _batch in 0..7 {
        for _ in 0..100 {
            store.write("orders", &key(next), b"payload").unwrap();
            truth.insert(key(next), b"payload".to_vec());
            next += 1;
        }
        let seal = store.seal_journal();
        let report = controller.run_cycle(&seal).await.unwrap();
        assert_eq!(report.failed_tasks, 0);
        splits += report.splits;
    }

    // Exactly the seventh batch crosses 600 entries.
    assert_eq!(splits, 1);
    assert_eq!(store.local_partition_count("orders"), 2);

    let scanned: BTreeMap<Vec<u8>, Vec<u8>> =
        store.scan("orders").unwrap().into_iter().collect();
    assert_eq!(scanned, truth, "split must not lose or reorder entries");
}

#[tokio::test]
async fn test_tombstone_debt_defers_join_one_cycle() {
    let store = Arc::new(MemoryIndexStore::new("node-1"));
    let controller = controller_over(&store);
    store.register_index("orders").unwrap();

    let mut truth = BTreeMap::new();
    for i in 0..700 {
        store.write("orders", &key(i), b"v").unwrap();
        truth.insert(key(i), b"v".to_vec());
    }
    let seal = store.seal_journal();
    let report = controller.run_cycle(&seal).await.unwrap();
    assert_eq!(report.splits, 1);
    assert_eq!(store.local_partition_count("orders"), 2);

    // Shrink the left partition to 90 live entries. The estimate keeps
    // counting the tombstones until a compaction recomputes it.
    for i in 0..260 {
        store.delete("orders", &key(i)).unwrap();
        truth.remove(&key(i));
    }
    let seal = store.seal_journal();
    let report = controller.run_cycle(&seal).await.unwrap();
    assert_eq!(report.joined, 0, "inflated estimate defers the join");
    assert_eq!(report.builds, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(store.local_partition_count("orders"), 2);

    // Next cycle sees the compacted estimate and joins the siblings.
    store.write("orders", &key(700), b"v").unwrap();
    truth.insert(key(700), b"v".to_vec());
    let seal = store.seal_journal();
    let report = controller.run_cycle(&seal).await.unwrap();
    assert_eq!(report.joined, 2);
    assert_eq!(report.done, 2);
    assert_eq!(store.local_partition_count("orders"), 1);

    let scanned: BTreeMap<Vec<u8>, Vec<u8>> =
        store.scan("orders").unwrap().into_iter().collect();
    assert_eq!(scanned, truth, "join must not lose or reorder entries");
}

#[tokio::test]
async fn test_lookup_outage_skips_join_and_recovers_next_cycle() {
    let store = Arc::new(MemoryIndexStore::new("node-1"));
    let locator = Arc::new(FlakyLocator {
        inner: store.clone(),
        fail: AtomicBool::new(false),
    });
    let controller = controller_with(
        &store,
        locator.clone() as Arc<dyn MetadataLookupService>,
        Arc::new(LocalLoadBalancer::new()),
    );
    store.register_index("orders").unwrap();

    // Reach a join-eligible left partition: split, shrink, compact.
    for i in 0..700 {
        store.write("orders", &key(i), b"v").unwrap();
    }
    let seal = store.seal_journal();
    controller.run_cycle(&seal).await.unwrap();
    for i in 0..260 {
        store.delete("orders", &key(i)).unwrap();
    }
    let seal = store.seal_journal();
    controller.run_cycle(&seal).await.unwrap();

    // Locator down: the candidate group is skipped without failing the
    // cycle and the topology is untouched.
    locator.fail.store(true, Ordering::SeqCst);
    let seal = store.seal_journal();
    let report = controller.run_cycle(&seal).await.unwrap();
    assert_eq!(report.joined, 0);
    assert_eq!(report.failed_tasks, 0);
    assert_eq!(store.local_partition_count("orders"), 2);

    // Locator back: the deferred join happens on the next cycle.
    locator.fail.store(false, Ordering::SeqCst);
    let seal = store.seal_journal();
    let report = controller.run_cycle(&seal).await.unwrap();
    assert_eq!(report.joined, 2);
    assert_eq!(store.local_partition_count("orders"), 1);
}

#[tokio::test]
async fn test_high_utilization_moves_warm_partitions() {
    let store = Arc::new(MemoryIndexStore::new("node-1"));
    let balancer = Arc::new(LocalLoadBalancer::new());
    balancer.set_highly_utilized("node-1", true);
    balancer.set_under_utilized(vec!["node-2".to_string(), "node-3".to_string()]);
    let controller = controller_with(
        &store,
        store.clone() as Arc<dyn MetadataLookupService>,
        balancer,
    );

    // Ten single-partition indices with strictly increasing traffic; with
    // ten ranked partitions the open (0.3, 0.8) band holds exactly four.
    let indices: Vec<String> = (0..10).map(|i| format!("idx{}", i)).collect();
    for (i, index) in indices.iter().enumerate() {
        store.register_index(index).unwrap();
        for k in 0..(i as u32 + 1) * 10 {
            store.write(index, &key(k), b"v").unwrap();
        }
    }

    let seal = store.seal_journal();
    let report = controller.run_cycle(&seal).await.unwrap();
    assert_eq!(report.done, 10);
    assert_eq!(report.moves, 4);
    assert_eq!(report.builds, 6);
    assert_eq!(report.failed_tasks, 0);

    let local_total: usize = indices
        .iter()
        .map(|i| store.local_partition_count(i))
        .sum();
    assert_eq!(local_total, 6);

    for index in &indices {
        let node = store
            .locate_partition(&format!("{}#0", index))
            .expect("partition still in locator");
        assert!(
            ["node-1", "node-2", "node-3"].contains(&node.as_str()),
            "unexpected host {}",
            node
        );
    }
}
