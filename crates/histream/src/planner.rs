//! Chunk planning and the shared work queue.
//!
//! The planner walks the target ID range once, asking the hot-zone registry
//! for a chunk size at every position and falling back to the density-based
//! size when no zone matches. Chunks are pushed in monotonically increasing
//! order onto a shared queue that workers drain with non-blocking pops.
//! The whole plan is enqueued before any worker starts, so there is no
//! producer/consumer deadlock to reason about.

use std::collections::VecDeque;

use histream_core::types::{ChunkRange, Datacenter, MessageId};
use parking_lot::Mutex;

use crate::config::ExportConfig;
use crate::hotzones::{chunk_size_for_density, HotZonesRegistry};

/// Shared single-producer / many-consumer chunk queue.
///
/// Workers pop non-blockingly and exit when the queue is empty; each task is
/// consumed exactly once.
#[derive(Default)]
pub struct TaskQueue {
    inner: Mutex<VecDeque<ChunkRange>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, chunk: ChunkRange) {
        self.inner.lock().push_back(chunk);
    }

    /// Non-blocking pop; `None` means the plan is drained.
    pub fn try_pop(&self) -> Option<ChunkRange> {
        self.inner.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Plans adaptive chunks for `[lo, hi)` and enqueues them in order.
///
/// At each position the hot-zone registry is consulted first; when it
/// returns the configured default (meaning no zone matched), the
/// density-based size is substituted. Returns the number of chunks created.
pub fn plan_chunks(
    lo: MessageId,
    hi: MessageId,
    datacenter: &Datacenter,
    density: f64,
    registry: &HotZonesRegistry,
    config: &ExportConfig,
    queue: &TaskQueue,
) -> usize {
    let mut current = lo;
    let mut created = 0;

    while current < hi {
        let mut size = registry.optimal_chunk_size(current, hi, datacenter);
        if size == config.shard_chunk_size {
            size = chunk_size_for_density(density, config);
        }

        let chunk_end = (current + size).min(hi);
        if current < chunk_end {
            queue.push(ChunkRange::new(current, chunk_end));
            created += 1;
        }
        current = chunk_end;
    }

    tracing::info!(
        lo,
        hi,
        chunks = created,
        density = format!("{density:.1}"),
        "planned adaptive chunks"
    );
    created
}

#[cfg(test)]
mod tests {
    use super::*;
    use histream_core::types::Datacenter;

    fn drain(queue: &TaskQueue) -> Vec<ChunkRange> {
        let mut out = Vec::new();
        while let Some(chunk) = queue.try_pop() {
            out.push(chunk);
        }
        out
    }

    fn registry(config: &ExportConfig) -> HotZonesRegistry {
        // Point the registry at a fresh directory so only seeded defaults
        // load.
        let dir = tempfile::tempdir().unwrap();
        let config = ExportConfig {
            export_root: dir.path().to_path_buf(),
            ..config.clone()
        };
        HotZonesRegistry::open(&config)
    }

    #[test]
    fn low_density_range_uses_default_chunks() {
        let config = ExportConfig::default();
        let registry = registry(&config);
        let queue = TaskQueue::new();

        let created = plan_chunks(
            10_000_000,
            10_200_000,
            &Datacenter::from("DC1"),
            10.0,
            &registry,
            &config,
            &queue,
        );

        let chunks = drain(&queue);
        assert_eq!(created, 4);
        assert_eq!(chunks.len(), 4);
        assert!(chunks.iter().all(|c| c.span() == 50_000));
    }

    #[test]
    fn chunks_are_contiguous_and_increasing() {
        let config = ExportConfig::default();
        let registry = registry(&config);
        let queue = TaskQueue::new();

        plan_chunks(
            1_250_000,
            1_450_000,
            &Datacenter::from("DC2"),
            60.0,
            &registry,
            &config,
            &queue,
        );

        let chunks = drain(&queue);
        assert_eq!(chunks.first().unwrap().lo, 1_250_000);
        assert_eq!(chunks.last().unwrap().hi, 1_450_000);
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].hi, pair[1].lo);
            assert!(pair[0].lo < pair[1].lo);
        }
    }

    #[test]
    fn hot_zone_shrinks_chunks_inside_it() {
        let config = ExportConfig::default();
        let registry = registry(&config);
        let queue = TaskQueue::new();

        // 1.3M-1.4M is a seeded CRITICAL zone with chunk size 5000. The
        // remaining-range query means the whole plan inside [lo, hi)
        // overlapping that zone uses its size.
        plan_chunks(
            1_300_000,
            1_400_000,
            &Datacenter::from("DC2"),
            10.0,
            &registry,
            &config,
            &queue,
        );

        let chunks = drain(&queue);
        assert_eq!(chunks.len(), 20);
        assert!(chunks.iter().all(|c| c.span() == 5_000));
    }

    #[test]
    fn density_substitutes_when_no_zone_matches() {
        let config = ExportConfig::default();
        let registry = registry(&config);
        let queue = TaskQueue::new();

        // Very high density in an unknown datacenter: 5000-ID chunks.
        plan_chunks(
            0,
            50_000,
            &Datacenter::unknown(),
            200.0,
            &registry,
            &config,
            &queue,
        );

        let chunks = drain(&queue);
        assert_eq!(chunks.len(), 10);
        assert!(chunks.iter().all(|c| c.span() == 5_000));
    }

    #[test]
    fn final_chunk_is_clamped_to_hi() {
        let config = ExportConfig::default();
        let registry = registry(&config);
        let queue = TaskQueue::new();

        plan_chunks(
            0,
            120_000,
            &Datacenter::unknown(),
            10.0,
            &registry,
            &config,
            &queue,
        );

        let chunks = drain(&queue);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2], ChunkRange::new(100_000, 120_000));
    }

    #[test]
    fn queue_tasks_are_consumed_exactly_once() {
        let queue = TaskQueue::new();
        queue.push(ChunkRange::new(0, 10));
        queue.push(ChunkRange::new(10, 20));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.try_pop(), Some(ChunkRange::new(0, 10)));
        assert_eq!(queue.try_pop(), Some(ChunkRange::new(10, 20)));
        assert_eq!(queue.try_pop(), None);
        assert!(queue.is_empty());
    }
}
