//! End-to-end coordinator tests against an in-memory remote.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::FakeSource;
use futures::StreamExt;
use histream::client::ExportToken;
use histream::config::ExportConfig;
use histream::coordinator::{FetchOptions, ShardCoordinator};
use histream::retry::RetryConfig;
use histream_core::types::MessageId;
use std::sync::Arc;

fn config(root: &std::path::Path) -> ExportConfig {
    ExportConfig {
        export_root: root.to_path_buf(),
        enable_density_estimation: false,
        enable_hot_zones: false,
        shard_count: 1,
        // Small chunks so even modest histories exercise the planner.
        shard_chunk_size: 1_000,
        chunk_size_low_density: 1_000,
        // No second attempts: failure-path tests should fail fast.
        retry: RetryConfig {
            max_attempts: 1,
            jitter: false,
            base_delay: Duration::from_millis(1),
            ..RetryConfig::default()
        },
        ..ExportConfig::default()
    }
}

async fn collect_ids(
    coordinator: &ShardCoordinator,
    target: &str,
    opts: FetchOptions,
) -> Vec<MessageId> {
    let mut stream = coordinator.fetch(target, opts).await.unwrap();
    let mut ids = Vec::new();
    while let Some(item) = stream.next().await {
        ids.push(item.unwrap().id());
    }
    ids
}

async fn wait_for_teardown(spill_dir: &std::path::Path) {
    for _ in 0..50 {
        if !spill_dir.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("spill dir was not removed: {}", spill_dir.display());
}

#[tokio::test]
async fn sharded_export_yields_every_message_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let source = FakeSource::new((1..=5_000).collect());
    let coordinator = ShardCoordinator::new(config.clone(), Arc::new(source.clone()));

    let ids = collect_ids(&coordinator, "ordered-chat", FetchOptions::default()).await;

    let expected: Vec<MessageId> = (1..=5_000).collect();
    assert_eq!(ids, expected);

    wait_for_teardown(&config.spill_dir()).await;
    assert_eq!(source.inner.tokens_opened.load(Ordering::SeqCst), 1);
    assert_eq!(source.inner.tokens_finished.lock().len(), 1);
    assert_eq!(source.inner.workers_cloned.load(Ordering::SeqCst), 1);
    assert_eq!(source.inner.workers_cleaned.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn sparse_ids_survive_the_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let source = FakeSource::new((1..=4_000).filter(|id| id % 7 == 0).collect());
    let coordinator = ShardCoordinator::new(config(dir.path()), Arc::new(source));

    let ids = collect_ids(&coordinator, "sparse-chat", FetchOptions::default()).await;
    let expected: Vec<MessageId> = (1..=4_000).filter(|id| id % 7 == 0).collect();
    assert_eq!(ids, expected);
}

#[tokio::test]
async fn multiple_workers_cover_the_range_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let config = ExportConfig {
        shard_count: 3,
        ..config(dir.path())
    };
    let source = FakeSource::new((1..=9_000).collect());
    let coordinator = ShardCoordinator::new(config, Arc::new(source.clone()));

    let mut ids = collect_ids(&coordinator, "parallel-chat", FetchOptions::default()).await;
    ids.sort_unstable();

    let expected: Vec<MessageId> = (1..=9_000).collect();
    assert_eq!(ids, expected);
    assert_eq!(source.inner.workers_cloned.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn small_limit_bypasses_sharding() {
    let dir = tempfile::tempdir().unwrap();
    let source = FakeSource::new((1..=2_000).collect());
    let coordinator = ShardCoordinator::new(config(dir.path()), Arc::new(source.clone()));

    let ids = collect_ids(
        &coordinator,
        "limited-chat",
        FetchOptions {
            limit: Some(10),
            ..FetchOptions::default()
        },
    )
    .await;

    // The newest 10, in ascending order, fetched without any export
    // session or worker clones.
    let expected: Vec<MessageId> = (1_991..=2_000).collect();
    assert_eq!(ids, expected);
    assert_eq!(source.inner.tokens_opened.load(Ordering::SeqCst), 0);
    assert_eq!(source.inner.workers_cloned.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn pagination_bypasses_sharding() {
    let dir = tempfile::tempdir().unwrap();
    let source = FakeSource::new((1..=1_500).collect());
    let coordinator = ShardCoordinator::new(config(dir.path()), Arc::new(source.clone()));

    let ids = collect_ids(
        &coordinator,
        "paged-chat",
        FetchOptions {
            paginated: true,
            ..FetchOptions::default()
        },
    )
    .await;

    assert_eq!(ids, (1..=1_500).collect::<Vec<_>>());
    assert_eq!(source.inner.workers_cloned.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn disabled_sharding_still_yields_ascending_output() {
    let dir = tempfile::tempdir().unwrap();
    let config = ExportConfig {
        enable_shard_fetch: false,
        ..config(dir.path())
    };
    let source = FakeSource::new((1..=3_000).filter(|id| id % 3 == 0).collect());
    let coordinator = ShardCoordinator::new(config, Arc::new(source.clone()));

    let ids = collect_ids(&coordinator, "fallback-chat", FetchOptions::default()).await;
    assert_eq!(ids, (1..=3_000).filter(|id| id % 3 == 0).collect::<Vec<_>>());
    assert_eq!(source.inner.tokens_opened.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn resume_point_skips_already_exported_messages() {
    let dir = tempfile::tempdir().unwrap();
    let source = FakeSource::new((1..=3_000).collect());
    let coordinator = ShardCoordinator::new(config(dir.path()), Arc::new(source));

    let ids = collect_ids(
        &coordinator,
        "resumed-chat",
        FetchOptions {
            min_id: Some(2_500),
            ..FetchOptions::default()
        },
    )
    .await;

    assert_eq!(ids, (2_501..=3_000).collect::<Vec<_>>());
}

#[tokio::test]
async fn external_token_is_used_but_never_closed() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let source = FakeSource::new((1..=2_000).collect());
    let coordinator = ShardCoordinator::new(config.clone(), Arc::new(source.clone()));

    let ids = collect_ids(
        &coordinator,
        "adopted-token-chat",
        FetchOptions {
            export_token: Some(ExportToken(99)),
            ..FetchOptions::default()
        },
    )
    .await;

    assert_eq!(ids.len(), 2_000);
    wait_for_teardown(&config.spill_dir()).await;
    assert_eq!(source.inner.tokens_opened.load(Ordering::SeqCst), 0);
    assert!(source.inner.tokens_finished.lock().is_empty());
}

#[tokio::test]
async fn empty_history_yields_empty_stream() {
    let dir = tempfile::tempdir().unwrap();
    let source = FakeSource::new(Vec::new());
    let coordinator = ShardCoordinator::new(config(dir.path()), Arc::new(source));

    let ids = collect_ids(&coordinator, "empty-chat", FetchOptions::default()).await;
    assert!(ids.is_empty());
}

#[tokio::test]
async fn unresolvable_entity_fails_fast() {
    let dir = tempfile::tempdir().unwrap();
    let source = FakeSource::new((1..=100).collect());
    let coordinator = ShardCoordinator::new(config(dir.path()), Arc::new(source));

    let result = coordinator.fetch("missing", FetchOptions::default()).await;
    assert!(matches!(
        result,
        Err(histream_core::Error::EntityUnresolved { .. })
    ));
}

#[tokio::test]
async fn slow_chunk_is_split_and_no_message_appears_twice() {
    let dir = tempfile::tempdir().unwrap();
    // One 40k chunk whose 40 delayed pages cross the slow threshold; its
    // four ~10k sub-chunks (10 pages each) stay under it.
    let config = ExportConfig {
        shard_chunk_size: 40_000,
        chunk_size_low_density: 40_000,
        slow_chunk_threshold: Duration::from_millis(100),
        ..config(dir.path())
    };
    let ids: Vec<MessageId> = (1..=4_000).map(|i| i * 10).collect();
    let source = FakeSource::with_delay(ids.clone(), Duration::from_millis(5));
    let coordinator = ShardCoordinator::new(config, Arc::new(source.clone()));

    let out = collect_ids(&coordinator, "dense-chat", FetchOptions::default()).await;

    // Exactly once each, still in order: the discarded first walk left no
    // trace in the spill file.
    assert_eq!(out, ids);

    // The split actually happened: pages were issued for the sub-chunk
    // boundaries of the 40k range.
    assert!(source.requests_for(20_003) > 0 || source.requests_for(20_000) > 0);
}

#[tokio::test]
async fn server_waits_are_honored_and_retried() {
    let dir = tempfile::tempdir().unwrap();
    let source = FakeSource::rate_limited_once((1..=2_000).collect(), 0);
    let coordinator = ShardCoordinator::new(config(dir.path()), Arc::new(source.clone()));

    let out = collect_ids(&coordinator, "flooded-chat", FetchOptions::default()).await;
    assert_eq!(out, (1..=2_000).collect::<Vec<_>>());
}

#[tokio::test]
async fn failing_worker_does_not_stop_the_others() {
    let dir = tempfile::tempdir().unwrap();
    let config = ExportConfig {
        shard_count: 2,
        ..config(dir.path())
    };
    // Pages for the chunk starting at 3000 always fail; exactly one worker
    // grabs that chunk and dies, the other drains the rest of the queue.
    let source = FakeSource::poisoned((1..=6_000).collect(), 3_000);
    let coordinator = ShardCoordinator::new(config, Arc::new(source));

    let mut stream = coordinator
        .fetch("wounded-chat", FetchOptions::default())
        .await
        .unwrap();
    let mut ids = Vec::new();
    while let Some(item) = stream.next().await {
        if let Ok(message) = item {
            ids.push(message.id());
        }
    }
    ids.sort_unstable();
    ids.dedup();

    // Everything outside the poisoned chunk (3000, 4000] made it through.
    let survivors: Vec<MessageId> = (1..=6_000)
        .filter(|id| !(3_001..=4_000).contains(id))
        .collect();
    for id in &survivors {
        assert!(ids.contains(id), "missing id {id}");
    }
    // And nothing from the poisoned chunk was emitted twice or at all
    // after the worker died mid-chunk.
    assert!(ids.iter().all(|id| !(3_001..=4_000).contains(id)));
}
