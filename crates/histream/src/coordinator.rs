//! Top-level shard coordinator.
//!
//! Resolves the target entity, decides between the sharded path and the
//! simple paged fallback, owns the bulk-export token lifecycle, wires the
//! planner, workers and merger together, and cleans everything up when the
//! returned stream ends (or its consumer walks away).
//!
//! The caller gets a bounded stream of [`FetchedMessage`]s in strictly
//! ascending id order; all orchestration runs in a background driver task
//! feeding that stream.

use std::sync::Arc;

use histream_core::types::{MessageId, MessageRecord};
use histream_core::Result;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::client::{
    EntityInfo, ExportLimits, ExportToken, FetchedMessage, HistoryConnection, HistorySource,
    PageRequest, PAGE_LIMIT,
};
use crate::config::ExportConfig;
use crate::hotzones::{DensityEstimator, HotZonesRegistry};
use crate::merge::merge_spills;
use crate::planner::{plan_chunks, TaskQueue};
use crate::pool::WorkerPool;
use crate::retry::{ExecuteOptions, PoolKind, RetryExecutor};
use crate::stats::ShardRunReport;

/// Below this limit the sharded path is not worth its setup cost.
const SHARDING_MIN_LIMIT: usize = 1000;

/// Per-call options of [`ShardCoordinator::fetch`].
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Stop after this many messages.
    pub limit: Option<usize>,
    /// Resume point: only messages with id strictly greater than this are
    /// fetched.
    pub min_id: Option<MessageId>,
    /// The caller is paginating; sharding is for full exports.
    pub paginated: bool,
    /// Reuse an externally opened bulk-export token. The coordinator will
    /// not close a token it did not open.
    pub export_token: Option<ExportToken>,
}

/// Ordered message stream returned by [`ShardCoordinator::fetch`].
pub type MessageStream = ReceiverStream<Result<FetchedMessage>>;

/// Orchestrates one export source across worker connections.
pub struct ShardCoordinator {
    config: ExportConfig,
    source: Arc<dyn HistorySource>,
    registry: Arc<HotZonesRegistry>,
    retry: RetryExecutor,
    shutdown: CancellationToken,
}

impl ShardCoordinator {
    pub fn new(config: ExportConfig, source: Arc<dyn HistorySource>) -> Self {
        let registry = Arc::new(HotZonesRegistry::open(&config));
        let retry = RetryExecutor::new(config.retry.clone());
        Self {
            config,
            source,
            registry,
            retry,
            shutdown: CancellationToken::new(),
        }
    }

    /// Uses an externally owned shutdown token (typically from the
    /// [`ShutdownController`](crate::shutdown::ShutdownController)).
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn registry(&self) -> &Arc<HotZonesRegistry> {
        &self.registry
    }

    pub fn retry(&self) -> &RetryExecutor {
        &self.retry
    }

    /// Requests a graceful stop of any in-flight fetch.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.retry.shutdown();
    }

    /// Fetches the history of `target` as a stream in ascending id order.
    ///
    /// # Errors
    ///
    /// Fails fast on an unresolvable entity or an unreachable remote; all
    /// later failures arrive through the stream.
    pub async fn fetch(&self, target: &str, opts: FetchOptions) -> Result<MessageStream> {
        self.retry.start();

        let entity = self
            .retry
            .execute(
                "resolve_entity",
                PoolKind::Api,
                || self.source.resolve(target),
                ExecuteOptions::default(),
            )
            .await?;
        tracing::info!(entity = %entity.name, dc = %entity.datacenter, "resolved export target");

        let Some(max_id) = self
            .retry
            .execute(
                "latest_message_id",
                PoolKind::Api,
                || self.source.latest_message_id(&entity),
                ExecuteOptions::default(),
            )
            .await?
        else {
            tracing::info!(entity = %entity.name, "history is empty");
            let (_tx, rx) = mpsc::channel(1);
            return Ok(ReceiverStream::new(rx));
        };

        // The lower bound is exclusive (resume semantics). When it comes
        // from the oldest message we step one below it so the oldest
        // itself is included; with no history info at all the bound is 0.
        let mut lower = match opts.min_id {
            Some(min_id) => min_id,
            None => self
                .retry
                .execute(
                    "oldest_message_id",
                    PoolKind::Api,
                    || self.source.oldest_message_id(&entity),
                    ExecuteOptions::default(),
                )
                .await?
                .map(|oldest| oldest - 1)
                .unwrap_or(0),
        };
        // With an explicit limit only the newest span matters. IDs are not
        // dense, so this is an approximation biased toward fetching more.
        if let Some(limit) = opts.limit {
            lower = lower.max(max_id - limit as i64);
        }

        let use_sharding = self.config.enable_shard_fetch
            && !opts.paginated
            && !opts
                .limit
                .is_some_and(|limit| limit < SHARDING_MIN_LIMIT);

        if !use_sharding {
            tracing::info!(
                entity = %entity.name,
                limit = ?opts.limit,
                paginated = opts.paginated,
                "using simple paged fetch"
            );
            return Ok(self.paged_fetch(entity, max_id, lower, opts));
        }
        self.sharded_fetch(entity, max_id, lower, opts).await
    }

    /// Non-sharded fallback: walks fixed-size chunks from the bottom up on
    /// the master connection, buffering one chunk at a time so the output
    /// stays ascending under bounded memory.
    fn paged_fetch(
        &self,
        entity: EntityInfo,
        max_id: MessageId,
        lower: MessageId,
        opts: FetchOptions,
    ) -> MessageStream {
        let (tx, rx) = mpsc::channel(self.config.merge_buffer_size);
        let source = Arc::clone(&self.source);
        let chunk_size = self.config.shard_chunk_size;
        let shutdown = self.shutdown.clone();
        let retry = self.retry.clone();

        tokio::spawn(async move {
            let conn: Arc<dyn HistoryConnection> = Arc::new(Arc::clone(&source));
            let mut yielded = 0usize;
            let mut current = lower;

            'chunks: while current < max_id {
                if shutdown.is_cancelled() {
                    tracing::info!("paged fetch stopping on shutdown");
                    break;
                }
                let hi = (current + chunk_size).min(max_id);
                let batch = match walk_range(&retry, &*conn, &entity, current, hi).await {
                    Ok(batch) => batch,
                    Err(error) => {
                        let _ = tx.send(Err(error)).await;
                        break;
                    }
                };

                for record in batch {
                    if opts.limit.is_some_and(|limit| yielded >= limit) {
                        break 'chunks;
                    }
                    let message = FetchedMessage {
                        record,
                        conn: conn.clone(),
                    };
                    if tx.send(Ok(message)).await.is_err() {
                        break 'chunks;
                    }
                    yielded += 1;
                }
                current = hi;
            }
            tracing::debug!(yielded, "paged fetch finished");
        });

        ReceiverStream::new(rx)
    }

    async fn sharded_fetch(
        &self,
        entity: EntityInfo,
        max_id: MessageId,
        lower: MessageId,
        opts: FetchOptions,
    ) -> Result<MessageStream> {
        let span = max_id - lower;
        tracing::info!(
            entity = %entity.name,
            lower,
            max_id,
            span,
            workers = self.config.shard_count,
            "starting sharded export"
        );

        // Open or adopt the bulk-export token.
        let (token, owned) = match opts.export_token {
            Some(token) => {
                tracing::info!(?token, "reusing external bulk-export token");
                (token, false)
            }
            None => {
                let limits = ExportLimits {
                    max_file_size: self.config.max_file_size_mb * 1024 * 1024,
                };
                let token = self
                    .retry
                    .execute(
                        "begin_export",
                        PoolKind::Api,
                        || self.source.begin_export(limits),
                        ExecuteOptions::default(),
                    )
                    .await?;
                (token, true)
            }
        };

        // Clone and connect all workers concurrently.
        let conns = match futures::future::try_join_all((0..self.config.shard_count).map(|i| {
            self.retry.execute(
                "clone_worker",
                PoolKind::Api,
                move || self.source.clone_worker(i, token),
                ExecuteOptions::default(),
            )
        }))
        .await
        {
            Ok(conns) => conns,
            Err(error) => {
                if owned {
                    if let Err(close_error) = self
                        .retry
                        .execute(
                            "finish_export",
                            PoolKind::Api,
                            || self.source.finish_export(token, false),
                            ExecuteOptions::default(),
                        )
                        .await
                    {
                        tracing::warn!(%close_error, "failed to close bulk-export token");
                    }
                }
                return Err(error);
            }
        };
        tracing::info!(workers = conns.len(), "worker connections ready");

        // Estimate density through the master connection.
        let density = DensityEstimator::new(&self.config)
            .estimate(&self.source, &entity, lower, max_id)
            .await;

        // Plan every chunk up front.
        let queue = Arc::new(TaskQueue::new());
        plan_chunks(
            lower,
            max_id,
            &entity.datacenter,
            density,
            &self.registry,
            &self.config,
            &queue,
        );

        let spill_dir = self.config.spill_dir();
        tokio::fs::create_dir_all(&spill_dir).await?;

        let worker_cancel = self.shutdown.child_token();
        let cleanup_conns = conns.clone();
        let pool = WorkerPool::spawn(
            conns,
            &entity,
            queue,
            Arc::clone(&self.registry),
            &entity.datacenter,
            &self.config,
            self.retry.clone(),
            &spill_dir,
            worker_cancel,
        );

        let (tx, rx) = mpsc::channel(self.config.merge_buffer_size);
        let source = Arc::clone(&self.source);
        let registry = Arc::clone(&self.registry);
        let retry = self.retry.clone();
        let limit = opts.limit;

        tokio::spawn(async move {
            match merge_spills(pool.handles(), limit, &tx).await {
                Ok(count) => tracing::info!(messages = count, "sharded export merged"),
                Err(error) => {
                    tracing::error!(%error, "merge failed");
                    let _ = tx.send(Err(error)).await;
                }
            }
            // End the caller's stream before teardown starts.
            drop(tx);

            // Teardown: stop leftover workers, collect telemetry, report,
            // persist what was learned, release remote resources.
            pool.cancel();
            let telemetry = pool.telemetry();
            let _ = pool.join().await;

            let report = ShardRunReport::from_workers(telemetry);
            report.log_summary();
            for recommendation in registry.recommendations() {
                tracing::info!(advice = %recommendation, "hot-zone advisory");
            }
            registry.save_best_effort();

            for conn in cleanup_conns {
                if let Err(error) = conn.disconnect().await {
                    tracing::warn!(%error, "error disconnecting worker");
                }
            }
            if owned {
                if let Err(error) = retry
                    .execute(
                        "finish_export",
                        PoolKind::Api,
                        || source.finish_export(token, true),
                        ExecuteOptions::default(),
                    )
                    .await
                {
                    tracing::warn!(%error, "error finishing bulk-export token");
                }
            } else {
                tracing::debug!("skipping token finish, owned externally");
            }
            if let Err(error) = retry
                .execute(
                    "cleanup_worker_sessions",
                    PoolKind::Io,
                    || source.cleanup_workers(),
                    ExecuteOptions::default(),
                )
                .await
            {
                tracing::warn!(%error, "error cleaning worker sessions");
            }
            if let Err(error) = tokio::fs::remove_dir_all(&spill_dir).await {
                tracing::warn!(%error, "error removing spill directory");
            }
        });

        Ok(ReceiverStream::new(rx))
    }
}

/// Backwards page walk of one `(lower, hi]` range, returned sorted
/// ascending. Page requests funnel through the retry service, which honors
/// server waits and spaces failures.
async fn walk_range(
    retry: &RetryExecutor,
    conn: &dyn HistoryConnection,
    entity: &EntityInfo,
    lower: MessageId,
    hi: MessageId,
) -> Result<Vec<MessageRecord>> {
    let mut buffer: Vec<MessageRecord> = Vec::new();
    let mut offset = hi + 1;

    while offset > lower {
        let page = PageRequest {
            offset_id: offset,
            min_id: lower,
            limit: PAGE_LIMIT,
        };
        let batch = retry
            .execute(
                "history_page",
                PoolKind::Api,
                || conn.history_page(entity, page),
                ExecuteOptions::default(),
            )
            .await?;
        if batch.is_empty() {
            break;
        }
        let fetched = batch.len();
        if let Some(last) = batch.last() {
            offset = last.id;
        }
        buffer.extend(batch);
        if fetched < PAGE_LIMIT {
            break;
        }
    }

    buffer.sort_by_key(|record| record.id);
    Ok(buffer)
}
