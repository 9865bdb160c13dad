//! Spawning and supervising the fetch workers.
//!
//! The pool spawns one task per worker connection and supports coordinated
//! shutdown via a shared [`CancellationToken`]. Workers observe the token
//! between chunks; an in-flight page request is allowed to drain. A worker
//! that fails is not restarted within the run; its spill file is still
//! consumed up to the last intact frame and the other workers continue.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use histream_core::types::Datacenter;
use histream_core::Result;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::{EntityInfo, HistoryConnection};
use crate::config::ExportConfig;
use crate::hotzones::HotZonesRegistry;
use crate::planner::TaskQueue;
use crate::retry::RetryExecutor;
use crate::stats::WorkerTelemetry;

use super::worker::{worker_loop, WorkerContext};

/// One spawned worker and everything the merger needs to follow it.
pub struct WorkerHandle {
    pub worker_id: usize,
    pub spill_path: PathBuf,
    pub telemetry: Arc<Mutex<WorkerTelemetry>>,
    pub conn: Arc<dyn HistoryConnection>,
    task: JoinHandle<Result<()>>,
}

impl WorkerHandle {
    /// True once the worker task has returned, successfully or not.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// The set of workers of one shard run.
pub struct WorkerPool {
    handles: Vec<WorkerHandle>,
    cancel: CancellationToken,
}

impl WorkerPool {
    /// Spawns one worker task per connection. Worker `i` writes
    /// `spill_dir/shard_i.bin`.
    pub fn spawn(
        conns: Vec<Arc<dyn HistoryConnection>>,
        entity: &EntityInfo,
        queue: Arc<TaskQueue>,
        registry: Arc<HotZonesRegistry>,
        datacenter: &Datacenter,
        config: &ExportConfig,
        retry: RetryExecutor,
        spill_dir: &Path,
        cancel: CancellationToken,
    ) -> Self {
        let mut handles = Vec::with_capacity(conns.len());
        for (worker_id, conn) in conns.into_iter().enumerate() {
            let spill_path = spill_dir.join(format!("shard_{worker_id}.bin"));
            let telemetry = Arc::new(Mutex::new(WorkerTelemetry::default()));

            let ctx = WorkerContext {
                worker_id,
                conn: Arc::clone(&conn),
                entity: entity.clone(),
                queue: Arc::clone(&queue),
                registry: Arc::clone(&registry),
                telemetry: Arc::clone(&telemetry),
                datacenter: datacenter.clone(),
                config: config.clone(),
                retry: retry.clone(),
                cancel: cancel.clone(),
            };

            let task = tokio::spawn(worker_loop(ctx, spill_path.clone()));
            handles.push(WorkerHandle {
                worker_id,
                spill_path,
                telemetry,
                conn,
                task,
            });
        }

        Self { handles, cancel }
    }

    pub fn handles(&self) -> &[WorkerHandle] {
        &self.handles
    }

    /// Signals all workers to stop after their current chunk.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Awaits every worker and collects the per-worker outcomes. Join
    /// errors (a panicked worker task) surface as channel errors.
    pub async fn join(self) -> Vec<(usize, Result<()>)> {
        let mut results = Vec::with_capacity(self.handles.len());
        for handle in self.handles {
            let outcome = match handle.task.await {
                Ok(result) => result,
                Err(join_error) => Err(histream_core::Error::Channel {
                    context: format!("worker {} task failed: {join_error}", handle.worker_id),
                }),
            };
            if let Err(error) = &outcome {
                tracing::error!(worker = handle.worker_id, %error, "worker failed");
            }
            results.push((handle.worker_id, outcome));
        }
        results
    }

    /// Telemetry snapshots of all workers, in index order.
    pub fn telemetry(&self) -> Vec<WorkerTelemetry> {
        self.handles
            .iter()
            .map(|handle| handle.telemetry.lock().clone())
            .collect()
    }
}
