//! Worker loop and the chunk fetcher.
//!
//! A worker drains the shared queue chunk by chunk. For each chunk it walks
//! the ID range backwards in pages of at most 100, buffering every page in
//! memory. Only when the walk terminates is the buffer serialized into a
//! single spill frame; a chunk that crossed the slow threshold instead
//! discards its buffer entirely and re-issues itself as 4 equal sub-chunks.
//! The discard is what keeps messages from appearing twice in the output.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::FutureExt;
use histream_core::frame::encode_frame;
use histream_core::types::{ChunkRange, Datacenter, MessageRecord};
use histream_core::{Error, Result};
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::client::{EntityInfo, HistoryConnection, PageRequest, PAGE_LIMIT};
use crate::config::ExportConfig;
use crate::hotzones::{HotZonesRegistry, SlowChunkRecord};
use crate::planner::TaskQueue;
use crate::retry::{ExecuteOptions, PoolKind, RetryExecutor};
use crate::stats::{SlowChunkAction, SlowChunkNote, WorkerTelemetry};

/// Chunks slower than this are noted even when they are not split.
const WARN_THRESHOLD: Duration = Duration::from_secs(2);
/// A chunk must span more IDs than this to be worth splitting.
const MIN_SPLIT_SPAN: i64 = 1000;

/// Everything a worker task needs; deliberately no handle back to the
/// coordinator.
pub(crate) struct WorkerContext {
    pub worker_id: usize,
    pub conn: Arc<dyn HistoryConnection>,
    pub entity: EntityInfo,
    pub queue: Arc<TaskQueue>,
    pub registry: Arc<HotZonesRegistry>,
    pub telemetry: Arc<Mutex<WorkerTelemetry>>,
    pub datacenter: Datacenter,
    pub config: ExportConfig,
    pub retry: RetryExecutor,
    pub cancel: CancellationToken,
}

/// Runs one worker until the queue is drained, shutdown is requested or a
/// non-recoverable error occurs.
pub(crate) async fn worker_loop(ctx: WorkerContext, spill_path: std::path::PathBuf) -> Result<()> {
    tracing::trace!(worker = ctx.worker_id, "worker started");
    let mut file = tokio::fs::File::create(&spill_path).await?;

    let result = drain_queue(&ctx, &mut file).await;
    let _ = file.flush().await;

    let telemetry = ctx.telemetry.lock().clone();
    if telemetry.requests > 0 {
        tracing::debug!(
            worker = ctx.worker_id,
            messages = telemetry.messages,
            requests = telemetry.requests,
            avg_latency_ms = format!("{:.1}", telemetry.avg_latency_ms()),
            io_time_ms = telemetry.io_time_ms,
            chunks = telemetry.chunks_processed,
            "worker telemetry"
        );
    }
    tracing::trace!(worker = ctx.worker_id, "worker stopped");
    result
}

async fn drain_queue(ctx: &WorkerContext, file: &mut tokio::fs::File) -> Result<()> {
    loop {
        if ctx.cancel.is_cancelled() {
            tracing::debug!(worker = ctx.worker_id, "worker observed shutdown");
            return Ok(());
        }
        let Some(chunk) = ctx.queue.try_pop() else {
            tracing::debug!(worker = ctx.worker_id, "queue empty, worker finishing");
            return Ok(());
        };
        ctx.telemetry.lock().chunks_processed += 1;
        tracing::debug!(worker = ctx.worker_id, %chunk, "worker grabbed chunk");

        fetch_chunk(
            ctx,
            file,
            chunk,
            ctx.config.slow_chunk_threshold,
            ctx.config.slow_chunk_max_retries,
        )
        .await?;
    }
}

/// Fetches one chunk into the spill file, splitting adaptively when the
/// walk turns out slow.
pub(crate) fn fetch_chunk<'a>(
    ctx: &'a WorkerContext,
    file: &'a mut tokio::fs::File,
    range: ChunkRange,
    slow_threshold: Duration,
    max_splits: u32,
) -> BoxFuture<'a, Result<()>> {
    async move {
        let started = Instant::now();
        let mut buffer: Vec<MessageRecord> = Vec::new();
        let mut offset = range.hi + 1;

        while offset > range.lo {
            let page = PageRequest {
                offset_id: offset,
                min_id: range.lo,
                limit: PAGE_LIMIT,
            };

            // Every page request funnels through the retry service; the
            // closure body runs once per attempt, so the per-worker request
            // and flood-wait counters stay accurate.
            let telemetry = &ctx.telemetry;
            let conn = &ctx.conn;
            let entity = &ctx.entity;
            let request_started = Instant::now();
            let outcome = ctx
                .retry
                .execute(
                    "history_page",
                    PoolKind::Api,
                    || async move {
                        telemetry.lock().requests += 1;
                        match conn.history_page(entity, page).await {
                            Ok(batch) => Ok(batch),
                            Err(error) => {
                                if error.server_wait().is_some() {
                                    telemetry.lock().flood_waits += 1;
                                }
                                Err(error)
                            }
                        }
                    },
                    ExecuteOptions::default(),
                )
                .await;
            ctx.telemetry.lock().total_latency_ms +=
                request_started.elapsed().as_millis() as u64;

            let batch = match outcome {
                Ok(batch) => batch,
                Err(error) => {
                    let mut telemetry = ctx.telemetry.lock();
                    telemetry.failed += 1;
                    if matches!(error, Error::Timeout { .. }) {
                        telemetry.timeout_count += 1;
                    }
                    return Err(error);
                }
            };

            if batch.is_empty() {
                break;
            }
            let fetched = batch.len();
            // Pages arrive newest first; the last entry is the next offset.
            if let Some(last) = batch.last() {
                offset = last.id;
            }
            buffer.extend(batch);
            if fetched < PAGE_LIMIT {
                break;
            }
        }

        let duration = started.elapsed();
        let message_count = buffer.len() as u64;

        if duration > slow_threshold && range.span() > MIN_SPLIT_SPAN && max_splits > 0 {
            tracing::warn!(
                worker = ctx.worker_id,
                %range,
                span = range.span(),
                messages = message_count,
                dc = %ctx.datacenter,
                secs = format!("{:.1}", duration.as_secs_f64()),
                "very slow chunk, discarding buffer and re-fetching as 4 sub-chunks"
            );
            ctx.telemetry.lock().slow_chunks.push(SlowChunkNote {
                range,
                duration_sec: duration.as_secs_f64(),
                messages: message_count,
                action: SlowChunkAction::SplitAttempted,
                datacenter: ctx.datacenter.clone(),
                worker_id: ctx.worker_id,
            });

            // The buffered pages must not reach the spill file, otherwise
            // the sub-chunks would duplicate them.
            drop(buffer);

            for sub in range.split4() {
                tracing::debug!(worker = ctx.worker_id, %sub, "fetching sub-chunk");
                fetch_chunk(ctx, &mut *file, sub, slow_threshold, max_splits - 1).await?;
            }
            return Ok(());
        }

        if !buffer.is_empty() {
            let io_started = Instant::now();
            let frame = encode_frame(&buffer)?;
            file.write_all(&frame).await?;
            file.flush().await?;
            let mut telemetry = ctx.telemetry.lock();
            telemetry.io_time_ms += io_started.elapsed().as_millis() as u64;
            telemetry.messages += message_count;
        }

        if duration > WARN_THRESHOLD {
            tracing::warn!(
                worker = ctx.worker_id,
                %range,
                span = range.span(),
                messages = message_count,
                dc = %ctx.datacenter,
                secs = format!("{:.1}", duration.as_secs_f64()),
                "slow chunk"
            );
            ctx.telemetry.lock().slow_chunks.push(SlowChunkNote {
                range,
                duration_sec: duration.as_secs_f64(),
                messages: message_count,
                action: SlowChunkAction::Logged,
                datacenter: ctx.datacenter.clone(),
                worker_id: ctx.worker_id,
            });

            let mut record = SlowChunkRecord::new(
                range.lo,
                range.hi,
                duration.as_secs_f64(),
                message_count,
                ctx.datacenter.clone(),
                ctx.worker_id,
            );
            record.chat_name = Some(ctx.entity.name.clone());
            ctx.registry.record_slow_chunk(record.clone());
            ctx.registry.learn_from(&record);
            Arc::clone(&ctx.registry).save_best_effort();
        } else {
            tracing::debug!(
                worker = ctx.worker_id,
                %range,
                messages = message_count,
                secs = format!("{:.1}", duration.as_secs_f64()),
                "chunk done"
            );
        }

        Ok(())
    }
    .boxed()
}
