//! Ordered merge of worker spill files.
//!
//! The merger walks spill files in worker-index order and turns them back
//! into one chronological message stream. It tails files while their
//! workers are still writing: a partial frame at the end of the buffer just
//! means "read more"; a partial frame after the worker finished is a
//! truncated tail and is skipped. Each decoded frame is sorted by id before
//! emission (the fetch walk runs backwards, so frames arrive in reverse ID
//! order internally).

use std::time::{Duration, Instant};

use bytes::BytesMut;
use histream_core::frame::{decode_batch, try_split_frame};
use histream_core::Result;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

use crate::client::FetchedMessage;
use crate::pool::WorkerHandle;

/// How long to sleep between polls of a still-growing spill file.
const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Merge progress is logged at most once per this interval.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

async fn spill_present(handle: &WorkerHandle) -> bool {
    tokio::fs::try_exists(&handle.spill_path).await.unwrap_or(false)
}

#[derive(Debug, Default)]
struct MergeTelemetry {
    bytes_read: u64,
    read_time_ms: u64,
    decode_time_ms: u64,
}

/// Streams the spill files of `handles` into `tx` in chronological order.
///
/// Stops early when `limit` messages have been emitted or when the receiver
/// goes away (the caller dropped the stream). Returns the number of
/// messages emitted.
pub(crate) async fn merge_spills(
    handles: &[WorkerHandle],
    limit: Option<usize>,
    tx: &mpsc::Sender<Result<FetchedMessage>>,
) -> Result<usize> {
    let merge_started = Instant::now();
    let mut telemetry = MergeTelemetry::default();
    let mut count = 0usize;
    let mut last_log = Instant::now();
    let mut last_count = 0usize;

    'workers: for handle in handles {
        // Wait for the file to appear, unless the worker already finished
        // without producing one (then it fetched nothing).
        while !spill_present(handle).await && !handle.is_finished() {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        if !spill_present(handle).await {
            tracing::warn!(worker = handle.worker_id, "worker produced no spill file");
            continue;
        }

        let mut file = tokio::fs::File::open(&handle.spill_path).await?;
        let mut buf = BytesMut::with_capacity(64 * 1024);
        let worker_started = Instant::now();
        let mut worker_bytes = 0u64;
        let mut finished_seen = false;

        loop {
            while let Some(payload) = try_split_frame(&mut buf) {
                let decode_started = Instant::now();
                let mut batch = decode_batch(&payload)?;
                telemetry.decode_time_ms += decode_started.elapsed().as_millis() as u64;

                // Frames hold one backwards-walked chunk; sort restores
                // chronological order within the frame.
                batch.sort_by_key(|record| record.id);

                for record in batch {
                    if limit.is_some_and(|limit| count >= limit) {
                        tracing::debug!(count, "merge limit reached");
                        break 'workers;
                    }
                    let message = FetchedMessage {
                        record,
                        conn: handle.conn.clone(),
                    };
                    if tx.send(Ok(message)).await.is_err() {
                        tracing::debug!("merge consumer went away, stopping");
                        break 'workers;
                    }
                    count += 1;

                    if last_log.elapsed() >= PROGRESS_INTERVAL {
                        tracing::debug!(
                            count,
                            rate = count - last_count,
                            worker = handle.worker_id,
                            elapsed = format!("{:.1}s", merge_started.elapsed().as_secs_f64()),
                            "merge progress"
                        );
                        last_log = Instant::now();
                        last_count = count;
                    }
                }
            }

            let read_started = Instant::now();
            let n = file.read_buf(&mut buf).await?;
            telemetry.read_time_ms += read_started.elapsed().as_millis() as u64;
            worker_bytes += n as u64;

            if n == 0 {
                if finished_seen {
                    if !buf.is_empty() {
                        tracing::warn!(
                            worker = handle.worker_id,
                            trailing = buf.len(),
                            "skipping truncated trailing frame"
                        );
                    }
                    break;
                }
                if handle.is_finished() {
                    // One more read pass: the worker may have flushed
                    // between our read and the finished check.
                    finished_seen = true;
                    continue;
                }
                // Worker still writing; wait for more bytes.
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        }

        telemetry.bytes_read += worker_bytes;
        tracing::debug!(
            worker = handle.worker_id,
            bytes = worker_bytes,
            elapsed_ms = worker_started.elapsed().as_millis() as u64,
            "worker spill merged"
        );
    }

    tracing::info!(
        messages = count,
        bytes = telemetry.bytes_read,
        read_time_ms = telemetry.read_time_ms,
        decode_time_ms = telemetry.decode_time_ms,
        total = format!("{:.2}s", merge_started.elapsed().as_secs_f64()),
        "merge telemetry"
    );
    Ok(count)
}
