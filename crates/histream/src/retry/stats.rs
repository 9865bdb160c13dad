//! Per-operation statistics backing the retry service.
//!
//! Every logical operation name gets an [`OperationStats`] entry created
//! lazily on first access. The stats drive adaptive backoff (success rate,
//! consecutive failures), adaptive timeouts (timeout count) and throttle
//! detection (speed history). A background sweep drops entries with no
//! activity in the last hour so long-lived processes do not accumulate
//! stats for operations that ran once.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;

/// Default size of the speed history window.
pub const SPEED_WINDOW: usize = 5;

/// Entries idle longer than this are swept.
const STATS_MAX_IDLE: Duration = Duration::from_secs(3600);
/// How often the background sweep runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// A transfer with no progress for this long counts as stalled.
const STALL_AFTER: Duration = Duration::from_secs(60);

/// Counters and derived signals for one logical operation.
#[derive(Debug, Clone)]
pub struct OperationStats {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub timeout_count: u32,
    pub stall_count: u32,
    /// Exponentially weighted response time in seconds (0.8 old / 0.2 new).
    pub avg_response_time: f64,
    pub last_success: Option<Instant>,
    pub last_failure: Option<Instant>,
    created: Instant,
    speed_history: VecDeque<f64>,
}

impl Default for OperationStats {
    fn default() -> Self {
        Self {
            total: 0,
            succeeded: 0,
            failed: 0,
            consecutive_failures: 0,
            consecutive_successes: 0,
            timeout_count: 0,
            stall_count: 0,
            avg_response_time: 0.0,
            last_success: None,
            last_failure: None,
            created: Instant::now(),
            speed_history: VecDeque::with_capacity(SPEED_WINDOW),
        }
    }
}

impl OperationStats {
    pub fn update_success(&mut self, response_time: Duration) {
        self.total += 1;
        self.succeeded += 1;
        self.consecutive_successes += 1;
        self.consecutive_failures = 0;
        self.last_success = Some(Instant::now());

        let secs = response_time.as_secs_f64();
        if self.avg_response_time == 0.0 {
            self.avg_response_time = secs;
        } else {
            self.avg_response_time = self.avg_response_time * 0.8 + secs * 0.2;
        }
    }

    pub fn update_failure(&mut self) {
        self.total += 1;
        self.failed += 1;
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
        self.last_failure = Some(Instant::now());
    }

    /// Fraction of attempts that succeeded. An untouched entry reports 1.0
    /// so a fresh operation is never penalized.
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.succeeded as f64 / self.total as f64
        }
    }

    pub fn record_speed(&mut self, speed_kbps: f64, window: usize) {
        self.speed_history.push_back(speed_kbps);
        while self.speed_history.len() > window {
            self.speed_history.pop_front();
        }
    }

    pub fn avg_speed_kbps(&self) -> f64 {
        if self.speed_history.is_empty() {
            0.0
        } else {
            self.speed_history.iter().sum::<f64>() / self.speed_history.len() as f64
        }
    }

    /// Mean of the most recent `window` speed samples, or `None` until that
    /// many samples have been recorded.
    pub fn recent_speed_mean(&self, window: usize) -> Option<f64> {
        if self.speed_history.len() < window {
            return None;
        }
        let recent: Vec<f64> = self
            .speed_history
            .iter()
            .rev()
            .take(window)
            .copied()
            .collect();
        Some(recent.iter().sum::<f64>() / recent.len() as f64)
    }

    fn last_activity(&self) -> Instant {
        [Some(self.created), self.last_success, self.last_failure]
            .into_iter()
            .flatten()
            .max()
            .unwrap_or(self.created)
    }
}

/// Progress of one long transfer, used to feed the speed history.
#[derive(Debug, Clone)]
pub struct TransferProgress {
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    started: Instant,
    last_progress: Instant,
}

impl TransferProgress {
    pub fn new(total_bytes: u64) -> Self {
        let now = Instant::now();
        Self {
            total_bytes,
            transferred_bytes: 0,
            started: now,
            last_progress: now,
        }
    }

    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            self.transferred_bytes as f64 / self.total_bytes as f64 * 100.0
        }
    }

    pub fn current_speed_kbps(&self) -> f64 {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            0.0
        } else {
            self.transferred_bytes as f64 / elapsed / 1024.0
        }
    }
}

/// Shared registry of [`OperationStats`] keyed by operation name.
#[derive(Clone, Default)]
pub struct StatsRegistry {
    inner: Arc<Mutex<HashMap<String, OperationStats>>>,
    sweeper: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` against the named entry, creating it on first access.
    pub fn with_stats<R>(&self, name: &str, f: impl FnOnce(&mut OperationStats) -> R) -> R {
        let mut map = self.inner.lock();
        let stats = map.entry(name.to_string()).or_default();
        f(stats)
    }

    /// Clone of the named entry, if it exists.
    pub fn snapshot(&self, name: &str) -> Option<OperationStats> {
        self.inner.lock().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Advances a transfer and records the observed speed. Returns the
    /// current speed when progress was made. A transfer that sits still for
    /// a minute increments the operation's stall count.
    pub fn update_transfer(
        &self,
        name: &str,
        progress: &mut TransferProgress,
        transferred: u64,
        window: usize,
    ) -> Option<f64> {
        let now = Instant::now();
        if transferred > progress.transferred_bytes {
            let elapsed = now.duration_since(progress.last_progress).as_secs_f64();
            if elapsed > 0.0 {
                let delta = transferred - progress.transferred_bytes;
                let speed = delta as f64 / elapsed / 1024.0;
                self.with_stats(name, |s| {
                    s.record_speed(speed, window);
                    s.stall_count = 0;
                });
                progress.transferred_bytes = transferred;
                progress.last_progress = now;
                return Some(speed);
            }
        } else if now.duration_since(progress.last_progress) > STALL_AFTER {
            progress.last_progress = now;
            let stalls = self.with_stats(name, |s| {
                s.stall_count += 1;
                s.stall_count
            });
            tracing::warn!(operation = name, stalls, "transfer stall detected");
        }
        None
    }

    /// Spawns the background sweep that drops entries idle for an hour.
    pub fn start_sweeper(&self) {
        let mut guard = self.sweeper.lock();
        if guard.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *guard = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(SWEEP_INTERVAL).await;
                let Some(cutoff) = Instant::now().checked_sub(STATS_MAX_IDLE) else {
                    continue;
                };
                let mut map = inner.lock();
                let before = map.len();
                map.retain(|_, stats| stats.last_activity() > cutoff);
                let swept = before - map.len();
                drop(map);
                if swept > 0 {
                    tracing::debug!(swept, "cleaned up idle operation stats");
                }
            }
        }));
    }

    /// Stops the background sweep. Safe to call when it never started, and
    /// safe to call twice.
    pub fn shutdown(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }
}
