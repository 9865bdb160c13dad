//! Remote history abstraction consumed by the engine.
//!
//! The engine never talks to a wire protocol directly. Callers provide a
//! [`HistorySource`] (the authenticated master connection) which can resolve
//! entities, report ID bounds, open a bulk-export session and clone itself
//! into worker connections. Every worker request must carry the bulk-export
//! token; implementors are expected to bind the token into their send
//! primitive when [`HistorySource::clone_worker`] is called, rather than
//! threading it through individual call sites.

use std::sync::Arc;

use async_trait::async_trait;
use histream_core::types::{Datacenter, MessageId, MessageRecord};
use histream_core::Result;

/// Page size used by the backwards history walk. The remote caps history
/// pages at 100 entries.
pub const PAGE_LIMIT: usize = 100;

/// Opaque bulk-export session identifier obtained from the remote.
///
/// Grants elevated throughput for read-only history access. The engine
/// treats it as a value to open, thread through workers and close; it never
/// inspects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportToken(pub i64);

/// Limits negotiated when opening a bulk-export session.
#[derive(Debug, Clone, Copy)]
pub struct ExportLimits {
    /// Largest file the session should grant access to, in bytes.
    pub max_file_size: u64,
}

/// A resolved export target.
#[derive(Debug, Clone)]
pub struct EntityInfo {
    pub id: i64,
    /// Display name, used in logs and slow-chunk records.
    pub name: String,
    /// Best-effort datacenter tag; [`Datacenter::unknown`] when the entity
    /// shape does not expose one.
    pub datacenter: Datacenter,
}

/// One page request of the backwards history walk.
///
/// Both bounds are exclusive: the page contains ids strictly below
/// `offset_id` and strictly above `min_id`, newest first, at most `limit`
/// records.
#[derive(Debug, Clone, Copy)]
pub struct PageRequest {
    pub offset_id: MessageId,
    pub min_id: MessageId,
    pub limit: usize,
}

/// A single remote connection able to serve history pages.
///
/// Worker connections returned by [`HistorySource::clone_worker`] implement
/// this with the bulk-export token already bound into every outbound
/// request. A connection is used by at most one task at a time.
#[async_trait]
pub trait HistoryConnection: Send + Sync {
    /// Fetches one history page, newest first.
    ///
    /// # Errors
    ///
    /// Rate-limit and slow-mode errors must surface as
    /// [`Error::RateLimited`]/[`Error::SlowMode`] carrying the server-told
    /// wait so the fetch loop can honor it.
    ///
    /// [`Error::RateLimited`]: histream_core::Error::RateLimited
    /// [`Error::SlowMode`]: histream_core::Error::SlowMode
    async fn history_page(
        &self,
        entity: &EntityInfo,
        page: PageRequest,
    ) -> Result<Vec<MessageRecord>>;

    /// Closes the underlying connection. Best-effort; errors are logged by
    /// the caller and otherwise ignored.
    async fn disconnect(&self) -> Result<()>;
}

/// The authenticated master connection.
#[async_trait]
pub trait HistorySource: HistoryConnection {
    /// Resolves a target (username, id, invite link) into an [`EntityInfo`].
    async fn resolve(&self, target: &str) -> Result<EntityInfo>;

    /// Id of the newest message, or `None` for an empty history.
    async fn latest_message_id(&self, entity: &EntityInfo) -> Result<Option<MessageId>>;

    /// Id of the oldest message, or `None` for an empty history.
    async fn oldest_message_id(&self, entity: &EntityInfo) -> Result<Option<MessageId>>;

    /// Opens a bulk-export session on the master connection.
    async fn begin_export(&self, limits: ExportLimits) -> Result<ExportToken>;

    /// Finishes a bulk-export session previously opened by
    /// [`begin_export`](Self::begin_export).
    async fn finish_export(&self, token: ExportToken, success: bool) -> Result<()>;

    /// Clones the authenticated session into an independent worker
    /// connection with `token` bound into every outbound request.
    async fn clone_worker(
        &self,
        worker_id: usize,
        token: ExportToken,
    ) -> Result<Arc<dyn HistoryConnection>>;

    /// Removes any per-worker session state the implementation keeps on
    /// disk. Called once at teardown; the default does nothing.
    async fn cleanup_workers(&self) -> Result<()> {
        Ok(())
    }
}

// Lets the master source stand in wherever a plain connection is expected
// (density probes, the non-sharded fallback) without trait upcasting.
#[async_trait]
impl HistoryConnection for Arc<dyn HistorySource> {
    async fn history_page(
        &self,
        entity: &EntityInfo,
        page: PageRequest,
    ) -> Result<Vec<MessageRecord>> {
        (**self).history_page(entity, page).await
    }

    async fn disconnect(&self) -> Result<()> {
        (**self).disconnect().await
    }
}

/// A message yielded by the engine: the record plus the worker connection
/// that fetched it, so downstream media operations can reuse the same
/// connection.
#[derive(Clone)]
pub struct FetchedMessage {
    pub record: MessageRecord,
    pub conn: Arc<dyn HistoryConnection>,
}

impl FetchedMessage {
    pub fn id(&self) -> MessageId {
        self.record.id
    }
}

impl core::fmt::Debug for FetchedMessage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FetchedMessage")
            .field("id", &self.record.id)
            .finish_non_exhaustive()
    }
}
