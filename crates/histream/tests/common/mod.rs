//! In-memory remote history used by the coordinator tests.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use histream::client::{
    EntityInfo, ExportLimits, ExportToken, HistoryConnection, HistorySource, PageRequest,
};
use histream_core::types::{Datacenter, MessageId, MessageRecord};
use histream_core::{Error, Result};
use parking_lot::Mutex;

pub struct Inner {
    ids: Vec<MessageId>,
    /// Sleep per served page; lets tests make chunks "slow".
    pub page_delay: Duration,
    /// Every page whose `min_id` equals this fails with an RPC error.
    pub poison_min_id: Option<MessageId>,
    /// One rate-limit error is served for this `min_id`, then cleared.
    pub rate_limit_once: Mutex<Option<MessageId>>,
    pub requests: Mutex<Vec<PageRequest>>,
    pub tokens_opened: AtomicUsize,
    pub tokens_finished: Mutex<Vec<(ExportToken, bool)>>,
    pub workers_cloned: AtomicUsize,
    pub workers_cleaned: AtomicUsize,
    next_token: AtomicI64,
}

/// Cheap-to-clone fake master connection.
#[derive(Clone)]
pub struct FakeSource {
    pub inner: Arc<Inner>,
}

impl FakeSource {
    pub fn new(ids: Vec<MessageId>) -> Self {
        Self::with_delay(ids, Duration::ZERO)
    }

    pub fn with_delay(ids: Vec<MessageId>, page_delay: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                ids,
                page_delay,
                poison_min_id: None,
                rate_limit_once: Mutex::new(None),
                requests: Mutex::new(Vec::new()),
                tokens_opened: AtomicUsize::new(0),
                tokens_finished: Mutex::new(Vec::new()),
                workers_cloned: AtomicUsize::new(0),
                workers_cleaned: AtomicUsize::new(0),
                next_token: AtomicI64::new(1),
            }),
        }
    }

    pub fn poisoned(ids: Vec<MessageId>, poison_min_id: MessageId) -> Self {
        let mut source = Self::new(ids);
        Arc::get_mut(&mut source.inner).unwrap().poison_min_id = Some(poison_min_id);
        source
    }

    pub fn rate_limited_once(ids: Vec<MessageId>, min_id: MessageId) -> Self {
        let source = Self::new(ids);
        *source.inner.rate_limit_once.lock() = Some(min_id);
        source
    }

    /// Page requests whose `min_id` matched `min_id`.
    pub fn requests_for(&self, min_id: MessageId) -> usize {
        self.inner
            .requests
            .lock()
            .iter()
            .filter(|r| r.min_id == min_id)
            .count()
    }

    fn serve(&self, page: PageRequest) -> Vec<MessageRecord> {
        let mut hits: Vec<MessageId> = self
            .inner
            .ids
            .iter()
            .copied()
            .filter(|id| *id > page.min_id && *id < page.offset_id)
            .collect();
        // Newest first, like the real remote.
        hits.sort_unstable_by(|a, b| b.cmp(a));
        hits.truncate(page.limit);
        hits.into_iter().map(MessageRecord::bare).collect()
    }
}

#[async_trait]
impl HistoryConnection for FakeSource {
    async fn history_page(
        &self,
        _entity: &EntityInfo,
        page: PageRequest,
    ) -> Result<Vec<MessageRecord>> {
        self.inner.requests.lock().push(page);

        if let Some(poison) = self.inner.poison_min_id {
            if page.min_id == poison {
                return Err(Error::rpc("poisoned range"));
            }
        }
        {
            let mut limited = self.inner.rate_limit_once.lock();
            if *limited == Some(page.min_id) {
                *limited = None;
                return Err(Error::RateLimited {
                    wait: Duration::from_millis(10),
                });
            }
        }

        if !self.inner.page_delay.is_zero() {
            tokio::time::sleep(self.inner.page_delay).await;
        }
        Ok(self.serve(page))
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl HistorySource for FakeSource {
    async fn resolve(&self, target: &str) -> Result<EntityInfo> {
        if target == "missing" {
            return Err(Error::EntityUnresolved {
                target: target.to_string(),
            });
        }
        Ok(EntityInfo {
            id: 1,
            name: target.to_string(),
            datacenter: Datacenter::from("DC2"),
        })
    }

    async fn latest_message_id(&self, _entity: &EntityInfo) -> Result<Option<MessageId>> {
        Ok(self.inner.ids.last().copied())
    }

    async fn oldest_message_id(&self, _entity: &EntityInfo) -> Result<Option<MessageId>> {
        Ok(self.inner.ids.first().copied())
    }

    async fn begin_export(&self, _limits: ExportLimits) -> Result<ExportToken> {
        self.inner.tokens_opened.fetch_add(1, Ordering::SeqCst);
        Ok(ExportToken(
            self.inner.next_token.fetch_add(1, Ordering::SeqCst),
        ))
    }

    async fn finish_export(&self, token: ExportToken, success: bool) -> Result<()> {
        self.inner.tokens_finished.lock().push((token, success));
        Ok(())
    }

    async fn clone_worker(
        &self,
        _worker_id: usize,
        _token: ExportToken,
    ) -> Result<Arc<dyn HistoryConnection>> {
        self.inner.workers_cloned.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(self.clone()))
    }

    async fn cleanup_workers(&self) -> Result<()> {
        self.inner.workers_cleaned.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
