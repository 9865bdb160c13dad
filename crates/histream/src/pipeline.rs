//! Three-stage fetch → process → write pipeline.
//!
//! The fetcher stamps every message with a 1-based sequence number and
//! feeds a bounded queue. A configurable number of processor workers share
//! that queue and run the user's `process` callable concurrently; results
//! (or captured errors) flow into a second bounded queue. A single writer
//! holds a small seq-keyed reorder buffer and applies `write` strictly in
//! fetch order, skipping errored sequences so one bad message never stalls
//! the rest.
//!
//! Termination rides on channel closure: the fetcher dropping its sender
//! drains the processors, the processors dropping theirs drains the
//! writer. Memory is bounded by the two queue capacities plus one in-flight
//! message per processor.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{Stream, StreamExt};
use histream_core::{Error, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Stage parallelism and queue bounds.
#[derive(Debug, Clone)]
pub struct AsyncPipeline {
    /// Kept for interface parity; the fetch stage is one task.
    pub fetch_workers: usize,
    /// Parallelism of the user `process` callable.
    pub process_workers: usize,
    /// Kept at 1: a single writer preserves ordering.
    pub write_workers: usize,
    pub fetch_queue_size: usize,
    pub process_queue_size: usize,
}

impl Default for AsyncPipeline {
    fn default() -> Self {
        Self {
            fetch_workers: 1,
            process_workers: 4,
            write_workers: 1,
            fetch_queue_size: 64,
            process_queue_size: 256,
        }
    }
}

/// Outcome of one pipeline run.
#[derive(Debug, Clone, Default)]
pub struct PipelineReport {
    /// Messages successfully written.
    pub processed: u64,
    /// Messages skipped at the writer because a stage failed them.
    pub errors: u64,
    /// Messages the fetch stage emitted.
    pub fetched: u64,
    pub duration: Duration,
    pub fetch_time: Duration,
    pub process_time: Duration,
    pub write_time: Duration,
    pub max_fetch_queue: usize,
    pub max_write_queue: usize,
    pub max_writer_buffered: usize,
}

impl PipelineReport {
    pub fn avg_process_time_per_message(&self) -> Duration {
        if self.processed == 0 {
            Duration::ZERO
        } else {
            self.process_time / self.processed as u32
        }
    }

    pub fn avg_write_time_per_message(&self) -> Duration {
        if self.processed == 0 {
            Duration::ZERO
        } else {
            self.write_time / self.processed as u32
        }
    }
}

/// Depth/peak gauge for a bounded queue.
///
/// The depth is signed: a consumer may observe and dec a message before the
/// producer's inc lands, so the counter can dip below zero transiently.
#[derive(Default)]
struct QueueGauge {
    depth: AtomicI64,
    peak: AtomicUsize,
}

impl QueueGauge {
    fn inc(&self) {
        let now = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        if now > 0 {
            self.peak.fetch_max(now as usize, Ordering::Relaxed);
        }
    }

    fn dec(&self) {
        self.depth.fetch_sub(1, Ordering::Relaxed);
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }
}

impl AsyncPipeline {
    /// Runs the pipeline to completion over `source`.
    ///
    /// `process` runs on up to `process_workers` messages concurrently; its
    /// failures are recorded and skipped at the writer. `write` runs on one
    /// value at a time, strictly in fetch order. The `shutdown` token stops
    /// the fetch stage between messages; everything already fetched drains
    /// normally.
    pub async fn run<S, M, P, PF, V, W, WF>(
        &self,
        source: S,
        process: P,
        mut write: W,
        limit: Option<usize>,
        shutdown: CancellationToken,
    ) -> Result<PipelineReport>
    where
        S: Stream<Item = M> + Send + 'static,
        M: Send + 'static,
        P: Fn(M) -> PF + Send + Sync + 'static,
        PF: Future<Output = Result<V>> + Send + 'static,
        V: Send + 'static,
        W: FnMut(V) -> WF + Send + 'static,
        WF: Future<Output = Result<()>> + Send + 'static,
    {
        let run_started = Instant::now();

        let (fetch_tx, fetch_rx) = mpsc::channel::<(u64, M)>(self.fetch_queue_size);
        let (write_tx, mut write_rx) = mpsc::channel::<(u64, Result<V>)>(self.process_queue_size);

        let fetch_gauge = Arc::new(QueueGauge::default());
        let write_gauge = Arc::new(QueueGauge::default());

        // --- fetch stage ---
        let fetcher = {
            let gauge = Arc::clone(&fetch_gauge);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let started = Instant::now();
                let mut seq = 0u64;
                futures::pin_mut!(source);
                while let Some(message) = source.next().await {
                    if shutdown.is_cancelled() {
                        tracing::info!("pipeline fetch stopping on shutdown");
                        break;
                    }
                    seq += 1;
                    if fetch_tx.send((seq, message)).await.is_err() {
                        break;
                    }
                    gauge.inc();
                    if limit.is_some_and(|limit| seq >= limit as u64) {
                        break;
                    }
                }
                tracing::debug!(fetched = seq, "pipeline fetch stage done");
                (seq, started.elapsed())
                // fetch_tx drops here, draining the processors.
            })
        };

        // --- process stage ---
        let process = Arc::new(process);
        let shared_rx = Arc::new(tokio::sync::Mutex::new(fetch_rx));
        let process_nanos = Arc::new(AtomicU64::new(0));
        let mut processors = Vec::with_capacity(self.process_workers.max(1));
        for _ in 0..self.process_workers.max(1) {
            let shared_rx = Arc::clone(&shared_rx);
            let write_tx = write_tx.clone();
            let process = Arc::clone(&process);
            let fetch_gauge = Arc::clone(&fetch_gauge);
            let write_gauge = Arc::clone(&write_gauge);
            let process_nanos = Arc::clone(&process_nanos);
            processors.push(tokio::spawn(async move {
                loop {
                    let item = { shared_rx.lock().await.recv().await };
                    let Some((seq, message)) = item else { break };
                    fetch_gauge.dec();

                    let started = Instant::now();
                    let result = process(message).await;
                    process_nanos.fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);

                    if write_tx.send((seq, result)).await.is_err() {
                        break;
                    }
                    write_gauge.inc();
                }
            }));
        }
        // The processors own the only senders now; when they all exit the
        // writer drains and stops.
        drop(write_tx);

        // --- write stage ---
        let writer = {
            let write_gauge = Arc::clone(&write_gauge);
            tokio::spawn(async move {
                let mut expected = 1u64;
                let mut buffer: HashMap<u64, Result<V>> = HashMap::new();
                let mut max_buffered = 0usize;
                let mut processed = 0u64;
                let mut errors = 0u64;
                let mut write_time = Duration::ZERO;

                while let Some((seq, result)) = write_rx.recv().await {
                    write_gauge.dec();
                    buffer.insert(seq, result);
                    max_buffered = max_buffered.max(buffer.len());

                    while let Some(result) = buffer.remove(&expected) {
                        match result {
                            Err(error) => {
                                errors += 1;
                                tracing::debug!(seq = expected, %error, "skipping failed message");
                            }
                            Ok(value) => {
                                let started = Instant::now();
                                match write(value).await {
                                    Ok(()) => {
                                        processed += 1;
                                        write_time += started.elapsed();
                                    }
                                    Err(error) => {
                                        errors += 1;
                                        tracing::error!(seq = expected, %error, "write failed");
                                    }
                                }
                            }
                        }
                        expected += 1;
                    }
                }
                (processed, errors, write_time, max_buffered)
            })
        };

        // --- orchestrated termination ---
        let (fetched, fetch_time) = match fetcher.await {
            Ok(out) => out,
            Err(join_error) => {
                for task in &processors {
                    task.abort();
                }
                writer.abort();
                return Err(Error::Channel {
                    context: format!("pipeline fetch stage failed: {join_error}"),
                });
            }
        };
        for task in processors {
            if let Err(join_error) = task.await {
                writer.abort();
                return Err(Error::Channel {
                    context: format!("pipeline process stage failed: {join_error}"),
                });
            }
        }
        let (processed, errors, write_time, max_writer_buffered) =
            writer.await.map_err(|join_error| Error::Channel {
                context: format!("pipeline write stage failed: {join_error}"),
            })?;

        let report = PipelineReport {
            processed,
            errors,
            fetched,
            duration: run_started.elapsed(),
            fetch_time,
            process_time: Duration::from_nanos(process_nanos.load(Ordering::Relaxed)),
            write_time,
            max_fetch_queue: fetch_gauge.peak(),
            max_write_queue: write_gauge.peak(),
            max_writer_buffered,
        };
        tracing::debug!(?report, "pipeline completed");
        Ok(report)
    }
}
