//! Per-worker telemetry and the end-of-run report.
//!
//! Every worker maintains counters for messages, requests, flood waits and
//! I/O time, plus the list of chunks that crossed the slow thresholds. At
//! the end of a shard run the coordinator aggregates them into a
//! [`ShardRunReport`]: per-datacenter breakdown, top-5 slowest ranges and
//! split counts. The report is `Serialize` so it can double as a JSON
//! metrics export.

use std::collections::HashMap;

use histream_core::types::{ChunkRange, Datacenter};
use serde::Serialize;

/// What the fetcher did about a slow chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlowChunkAction {
    /// Logged and written normally.
    Logged,
    /// Buffer discarded, range re-fetched as 4 sub-chunks.
    SplitAttempted,
}

/// One slow chunk as seen from a worker.
#[derive(Debug, Clone, Serialize)]
pub struct SlowChunkNote {
    pub range: ChunkRange,
    pub duration_sec: f64,
    pub messages: u64,
    pub action: SlowChunkAction,
    pub datacenter: Datacenter,
    pub worker_id: usize,
}

/// Counters kept by one worker across its whole run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerTelemetry {
    pub messages: u64,
    pub flood_waits: u64,
    pub requests: u64,
    /// Page requests given up by the retry service.
    pub failed: u64,
    /// How many of those failures were per-attempt timeouts.
    pub timeout_count: u64,
    pub total_latency_ms: u64,
    pub io_time_ms: u64,
    pub chunks_processed: u64,
    pub slow_chunks: Vec<SlowChunkNote>,
}

impl WorkerTelemetry {
    pub fn avg_latency_ms(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.total_latency_ms as f64 / self.requests as f64
        }
    }
}

/// Per-datacenter aggregation of slow chunks.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DatacenterSlowStats {
    pub count: usize,
    pub total_duration_sec: f64,
}

impl DatacenterSlowStats {
    pub fn avg_duration_sec(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_duration_sec / self.count as f64
        }
    }
}

/// Aggregated view of one shard run.
#[derive(Debug, Clone, Serialize)]
pub struct ShardRunReport {
    pub workers: Vec<WorkerTelemetry>,
    pub total_messages: u64,
    pub total_requests: u64,
    pub total_flood_waits: u64,
    pub slow_chunk_count: usize,
    pub split_attempts: usize,
}

impl ShardRunReport {
    pub fn from_workers(workers: Vec<WorkerTelemetry>) -> Self {
        let total_messages = workers.iter().map(|w| w.messages).sum();
        let total_requests = workers.iter().map(|w| w.requests).sum();
        let total_flood_waits = workers.iter().map(|w| w.flood_waits).sum();
        let slow_chunk_count = workers.iter().map(|w| w.slow_chunks.len()).sum();
        let split_attempts = workers
            .iter()
            .flat_map(|w| &w.slow_chunks)
            .filter(|c| c.action == SlowChunkAction::SplitAttempted)
            .count();
        Self {
            workers,
            total_messages,
            total_requests,
            total_flood_waits,
            slow_chunk_count,
            split_attempts,
        }
    }

    pub fn slow_chunks(&self) -> impl Iterator<Item = &SlowChunkNote> {
        self.workers.iter().flat_map(|w| &w.slow_chunks)
    }

    /// Slow chunks grouped by datacenter.
    pub fn by_datacenter(&self) -> HashMap<Datacenter, DatacenterSlowStats> {
        let mut map: HashMap<Datacenter, DatacenterSlowStats> = HashMap::new();
        for chunk in self.slow_chunks() {
            let entry = map.entry(chunk.datacenter.clone()).or_default();
            entry.count += 1;
            entry.total_duration_sec += chunk.duration_sec;
        }
        map
    }

    /// The `n` slowest chunks, worst first.
    pub fn top_slowest(&self, n: usize) -> Vec<&SlowChunkNote> {
        let mut chunks: Vec<&SlowChunkNote> = self.slow_chunks().collect();
        chunks.sort_by(|a, b| {
            b.duration_sec
                .partial_cmp(&a.duration_sec)
                .unwrap_or(core::cmp::Ordering::Equal)
        });
        chunks.truncate(n);
        chunks
    }

    /// JSON form of the report for the optional metrics export.
    pub fn to_json(&self) -> histream_core::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Logs the aggregate slow-chunk statistics the way operators read
    /// them: totals, per-DC breakdown, top-5 ranges.
    pub fn log_summary(&self) {
        if self.slow_chunk_count == 0 {
            tracing::info!("no slow chunks detected");
            return;
        }

        let avg = self.slow_chunks().map(|c| c.duration_sec).sum::<f64>()
            / self.slow_chunk_count as f64;
        tracing::warn!(
            slow_chunks = self.slow_chunk_count,
            split_attempts = self.split_attempts,
            avg_duration = format!("{avg:.1}s"),
            "slow chunks summary"
        );

        if let Some(worst) = self.top_slowest(1).first() {
            tracing::warn!(
                range = %worst.range,
                duration = format!("{:.1}s", worst.duration_sec),
                worker = worst.worker_id,
                messages = worst.messages,
                dc = %worst.datacenter,
                "slowest chunk"
            );
        }

        for (dc, stats) in self.by_datacenter() {
            tracing::info!(
                %dc,
                chunks = stats.count,
                avg = format!("{:.1}s", stats.avg_duration_sec()),
                total = format!("{:.1}s", stats.total_duration_sec),
                "slow chunks by datacenter"
            );
        }

        for (idx, chunk) in self.top_slowest(5).iter().enumerate() {
            tracing::info!(
                rank = idx + 1,
                range = %chunk.range,
                duration = format!("{:.1}s", chunk.duration_sec),
                messages = chunk.messages,
                dc = %chunk.datacenter,
                worker = chunk.worker_id,
                action = ?chunk.action,
                "slow range"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(
        lo: i64,
        duration: f64,
        dc: &str,
        worker_id: usize,
        action: SlowChunkAction,
    ) -> SlowChunkNote {
        SlowChunkNote {
            range: ChunkRange::new(lo, lo + 10_000),
            duration_sec: duration,
            messages: 500,
            action,
            datacenter: Datacenter::from(dc),
            worker_id,
        }
    }

    fn report() -> ShardRunReport {
        let worker0 = WorkerTelemetry {
            messages: 1_000,
            requests: 20,
            total_latency_ms: 4_000,
            slow_chunks: vec![
                note(0, 12.0, "DC2", 0, SlowChunkAction::SplitAttempted),
                note(50_000, 3.0, "DC2", 0, SlowChunkAction::Logged),
            ],
            ..WorkerTelemetry::default()
        };
        let worker1 = WorkerTelemetry {
            messages: 2_000,
            requests: 40,
            flood_waits: 2,
            slow_chunks: vec![note(100_000, 30.0, "DC4", 1, SlowChunkAction::Logged)],
            ..WorkerTelemetry::default()
        };
        ShardRunReport::from_workers(vec![worker0, worker1])
    }

    #[test]
    fn totals_aggregate_across_workers() {
        let report = report();
        assert_eq!(report.total_messages, 3_000);
        assert_eq!(report.total_requests, 60);
        assert_eq!(report.total_flood_waits, 2);
        assert_eq!(report.slow_chunk_count, 3);
        assert_eq!(report.split_attempts, 1);
    }

    #[test]
    fn datacenter_breakdown() {
        let report = report();
        let by_dc = report.by_datacenter();
        assert_eq!(by_dc[&Datacenter::from("DC2")].count, 2);
        assert!((by_dc[&Datacenter::from("DC2")].avg_duration_sec() - 7.5).abs() < 1e-9);
        assert_eq!(by_dc[&Datacenter::from("DC4")].count, 1);
    }

    #[test]
    fn top_slowest_orders_by_duration() {
        let report = report();
        let top = report.top_slowest(2);
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].duration_sec, 30.0);
        assert_eq!(top[1].duration_sec, 12.0);
    }

    #[test]
    fn avg_latency_guards_zero_requests() {
        let telemetry = WorkerTelemetry::default();
        assert_eq!(telemetry.avg_latency_ms(), 0.0);
    }

    #[test]
    fn report_serializes_to_json() {
        let json = report().to_json().unwrap();
        assert!(json.contains("\"split_attempts\": 1"));
        assert!(json.contains("\"DC4\""));
    }
}
