//! Bounded task pools with auto-scaling ceilings.
//!
//! Each logical class of work (API calls, downloads, local I/O, CPU
//! processing, media transcode) runs inside its own [`AdaptiveTaskPool`]: a
//! semaphore-bounded executor whose ceiling moves between 2 and 20 permits
//! based on observed utilization, queue pressure and task-time trends. The
//! scaling decision itself is a pure function of a [`PoolSnapshot`], so it
//! is deterministic and tested without any concurrency.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use histream_core::{Error, Result};
use parking_lot::Mutex;
use tokio::sync::Semaphore;

/// Smallest ceiling a pool can shrink to.
pub const MIN_PERMITS: usize = 2;
/// Largest ceiling a pool can grow to.
pub const MAX_PERMITS: usize = 20;
/// Minimum spacing between two scaling actions on one pool.
const SCALE_COOLDOWN: Duration = Duration::from_secs(30);
/// Task-time samples kept for the degradation check.
const HISTORY_LEN: usize = 20;

/// Logical work classes, one pool each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    Download,
    Io,
    Processing,
    Transcode,
    Api,
}

impl PoolKind {
    pub const ALL: [PoolKind; 5] = [
        PoolKind::Download,
        PoolKind::Io,
        PoolKind::Processing,
        PoolKind::Transcode,
        PoolKind::Api,
    ];

    fn initial_permits(self) -> usize {
        match self {
            PoolKind::Download => 5,
            PoolKind::Io => 10,
            PoolKind::Processing => 4,
            PoolKind::Transcode => 2,
            PoolKind::Api => 10,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PoolKind::Download => "download",
            PoolKind::Io => "io",
            PoolKind::Processing => "processing",
            PoolKind::Transcode => "transcode",
            PoolKind::Api => "api",
        }
    }
}

/// Instantaneous view of a pool used to decide scaling.
#[derive(Debug, Clone, Copy)]
pub struct PoolSnapshot {
    pub ceiling: usize,
    pub active: usize,
    pub queued: usize,
    /// Mean of the 5 most recent task times, when at least 5 exist.
    pub recent_avg: Option<f64>,
    /// Mean over the whole history window.
    pub overall_avg: Option<f64>,
}

/// Outcome of a scaling evaluation: the new ceiling, or hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    Grow(usize),
    Shrink(usize),
    Hold,
}

/// Pure scaling policy.
///
/// Grows by 2 (capped at [`MAX_PERMITS`]) when the pool is saturated
/// (`utilization > 0.8`), backed up (`queue_pressure > 2`) and task times
/// have not degraded by more than 20% against the historical mean. Shrinks
/// by 1 (floored at [`MIN_PERMITS`]) when mostly idle.
pub fn decide_scale(snapshot: &PoolSnapshot) -> ScaleDecision {
    if snapshot.ceiling == 0 {
        return ScaleDecision::Hold;
    }
    let utilization = snapshot.active as f64 / snapshot.ceiling as f64;
    let queue_pressure = snapshot.queued as f64 / snapshot.active.max(1) as f64;

    let degraded = match (snapshot.recent_avg, snapshot.overall_avg) {
        (Some(recent), Some(overall)) if overall > 0.0 => recent / overall > 1.2,
        _ => false,
    };

    if utilization > 0.8 && queue_pressure > 2.0 && snapshot.ceiling < MAX_PERMITS && !degraded {
        ScaleDecision::Grow((snapshot.ceiling + 2).min(MAX_PERMITS))
    } else if utilization < 0.3 && queue_pressure < 0.5 && snapshot.ceiling > MIN_PERMITS {
        ScaleDecision::Shrink((snapshot.ceiling - 1).max(MIN_PERMITS))
    } else {
        ScaleDecision::Hold
    }
}

/// A semaphore-bounded executor for one work class.
pub struct AdaptiveTaskPool {
    kind: PoolKind,
    semaphore: Arc<Semaphore>,
    ceiling: AtomicUsize,
    active: AtomicUsize,
    queued: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    avg_task_time: Mutex<f64>,
    history: Mutex<VecDeque<f64>>,
    last_scale: Mutex<Instant>,
    auto_scale: bool,
}

impl AdaptiveTaskPool {
    pub fn new(kind: PoolKind, permits: usize, auto_scale: bool) -> Self {
        Self {
            kind,
            semaphore: Arc::new(Semaphore::new(permits)),
            ceiling: AtomicUsize::new(permits),
            active: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            avg_task_time: Mutex::new(0.0),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_LEN)),
            last_scale: Mutex::new(Instant::now()),
            auto_scale,
        }
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling.load(Ordering::Relaxed)
    }

    /// Runs `fut` once a permit is available, recording task time and
    /// outcome, then reconsiders the ceiling.
    pub async fn submit<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.queued.fetch_add(1, Ordering::Relaxed);
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::ServiceShutdown);
        self.queued.fetch_sub(1, Ordering::Relaxed);
        let _permit = permit?;

        self.active.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let out = fut.await;
        let elapsed = started.elapsed().as_secs_f64();
        self.active.fetch_sub(1, Ordering::Relaxed);

        match out {
            Ok(_) => {
                self.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
        }

        {
            let mut avg = self.avg_task_time.lock();
            *avg = if *avg == 0.0 {
                elapsed
            } else {
                *avg * 0.8 + elapsed * 0.2
            };
            let mut history = self.history.lock();
            history.push_back(elapsed);
            while history.len() > HISTORY_LEN {
                history.pop_front();
            }
        }

        if self.auto_scale {
            self.consider_scaling();
        }

        out
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let history = self.history.lock();
        let overall_avg = if history.is_empty() {
            None
        } else {
            Some(history.iter().sum::<f64>() / history.len() as f64)
        };
        let recent_avg = if history.len() >= 5 {
            Some(history.iter().rev().take(5).sum::<f64>() / 5.0)
        } else {
            None
        };
        PoolSnapshot {
            ceiling: self.ceiling(),
            active: self.active.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            recent_avg,
            overall_avg,
        }
    }

    fn consider_scaling(&self) {
        {
            let mut last = self.last_scale.lock();
            if last.elapsed() < SCALE_COOLDOWN {
                return;
            }
            *last = Instant::now();
        }

        match decide_scale(&self.snapshot()) {
            ScaleDecision::Grow(target) => {
                let current = self.ceiling();
                if target > current {
                    self.semaphore.add_permits(target - current);
                    self.ceiling.store(target, Ordering::Relaxed);
                    tracing::info!(pool = self.kind.as_str(), target, "scaled pool up");
                }
            }
            ScaleDecision::Shrink(target) => {
                let current = self.ceiling();
                if target < current {
                    // Best-effort: permits held by running tasks are not
                    // revoked, the ceiling just stops being replenished.
                    self.semaphore.forget_permits(current - target);
                    self.ceiling.store(target, Ordering::Relaxed);
                    tracing::info!(pool = self.kind.as_str(), target, "scaled pool down");
                }
            }
            ScaleDecision::Hold => {}
        }
    }

    /// Counters exposed for reports and tests.
    pub fn stats(&self) -> PoolStats {
        let completed = self.completed.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let total = completed + failed;
        PoolStats {
            kind: self.kind,
            ceiling: self.ceiling(),
            active: self.active.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            completed,
            failed,
            success_rate: if total == 0 {
                1.0
            } else {
                completed as f64 / total as f64
            },
            avg_task_time: *self.avg_task_time.lock(),
        }
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStats {
    #[serde(serialize_with = "serialize_kind")]
    pub kind: PoolKind,
    pub ceiling: usize,
    pub active: usize,
    pub queued: usize,
    pub completed: usize,
    pub failed: usize,
    pub success_rate: f64,
    pub avg_task_time: f64,
}

fn serialize_kind<S: serde::Serializer>(kind: &PoolKind, s: S) -> core::result::Result<S::Ok, S::Error> {
    s.serialize_str(kind.as_str())
}

/// One pool per [`PoolKind`].
#[derive(Clone)]
pub struct PoolSet {
    pools: Arc<Vec<AdaptiveTaskPool>>,
}

impl PoolSet {
    pub fn new(auto_scale: bool) -> Self {
        let pools = PoolKind::ALL
            .iter()
            .map(|&kind| AdaptiveTaskPool::new(kind, kind.initial_permits(), auto_scale))
            .collect();
        Self {
            pools: Arc::new(pools),
        }
    }

    pub fn get(&self, kind: PoolKind) -> &AdaptiveTaskPool {
        // Pools are built in `PoolKind::ALL` declaration order.
        &self.pools[kind as usize]
    }

    pub fn stats(&self) -> Vec<PoolStats> {
        self.pools.iter().map(AdaptiveTaskPool::stats).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(ceiling: usize, active: usize, queued: usize) -> PoolSnapshot {
        PoolSnapshot {
            ceiling,
            active,
            queued,
            recent_avg: None,
            overall_avg: None,
        }
    }

    #[test]
    fn grows_under_saturation_and_pressure() {
        let s = snapshot(4, 4, 10);
        assert_eq!(decide_scale(&s), ScaleDecision::Grow(6));
    }

    #[test]
    fn growth_caps_at_max_permits() {
        let s = snapshot(19, 19, 50);
        assert_eq!(decide_scale(&s), ScaleDecision::Grow(MAX_PERMITS));
        let s = snapshot(MAX_PERMITS, MAX_PERMITS, 50);
        assert_eq!(decide_scale(&s), ScaleDecision::Hold);
    }

    #[test]
    fn does_not_grow_when_degraded() {
        let s = PoolSnapshot {
            recent_avg: Some(1.3),
            overall_avg: Some(1.0),
            ..snapshot(4, 4, 10)
        };
        assert_eq!(decide_scale(&s), ScaleDecision::Hold);
    }

    #[test]
    fn shrinks_when_idle() {
        let s = snapshot(10, 1, 0);
        assert_eq!(decide_scale(&s), ScaleDecision::Shrink(9));
    }

    #[test]
    fn shrink_floors_at_min_permits() {
        let s = snapshot(MIN_PERMITS, 0, 0);
        assert_eq!(decide_scale(&s), ScaleDecision::Hold);
    }

    #[test]
    fn holds_in_the_middle() {
        let s = snapshot(10, 5, 3);
        assert_eq!(decide_scale(&s), ScaleDecision::Hold);
    }

    #[tokio::test]
    async fn submit_runs_and_counts() {
        let pool = AdaptiveTaskPool::new(PoolKind::Api, 2, false);
        let ok: Result<u32> = pool.submit(async { Ok(1) }).await;
        assert_eq!(ok.unwrap(), 1);
        let err: Result<u32> = pool
            .submit(async { Err(Error::rpc("nope")) })
            .await;
        assert!(err.is_err());

        let stats = pool.stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert!((stats.success_rate - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn submit_bounds_concurrency() {
        use std::sync::atomic::AtomicUsize;

        let pool = Arc::new(AdaptiveTaskPool::new(PoolKind::Processing, 2, false));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                pool.submit(async {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
