//! Retry service: adaptive backoff, adaptive timeouts, throttle detection.
//!
//! All remote operations funnel through [`RetryExecutor::execute`] rather
//! than ad-hoc retry loops at call sites. The executor runs each attempt
//! inside a bounded task pool under a per-attempt timeout, classifies
//! failures into the engine's error kinds, and spaces attempts according to
//! the configured [`BackoffStrategy`] informed by per-operation statistics.
//!
//! Server-told waits (rate limit, slow mode) are special: the engine sleeps
//! exactly what the server asked and retries at the same attempt count.
//! They are operating conditions, not failures.

pub mod pool;
pub mod stats;

use std::future::Future;
use std::time::Duration;

use histream_core::{Error, Result};
use rand::Rng;

pub use pool::{AdaptiveTaskPool, PoolKind, PoolSet, ScaleDecision};
pub use stats::{OperationStats, StatsRegistry, TransferProgress, SPEED_WINDOW};

/// Spacing policy between retry attempts.
#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackoffStrategy {
    /// Always `base_delay`.
    Fixed,
    /// `base_delay * attempt`.
    Linear,
    /// `base_delay * multiplier^(attempt-1)`.
    #[default]
    Exponential,
    /// Exponential scaled by the operation's observed success rate.
    Adaptive,
}

/// Retry, timeout and throttling knobs for one class of operations.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    pub jitter: bool,
    pub jitter_range: f64,
    pub backoff_multiplier: f64,

    pub base_timeout: Duration,
    pub large_file_timeout: Duration,
    pub huge_file_timeout: Duration,

    pub speed_threshold_kbps: f64,
    pub detection_window: usize,

    pub max_concurrent: usize,
    pub auto_scale: bool,
    pub scale_threshold: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
            jitter: true,
            jitter_range: 0.1,
            backoff_multiplier: 2.0,
            base_timeout: Duration::from_secs(300),
            large_file_timeout: Duration::from_secs(3600),
            huge_file_timeout: Duration::from_secs(7200),
            speed_threshold_kbps: 50.0,
            detection_window: SPEED_WINDOW,
            max_concurrent: 5,
            auto_scale: true,
            scale_threshold: 0.8,
        }
    }
}

impl RetryConfig {
    /// Tuned for short remote API calls.
    pub fn api_request() -> Self {
        Self {
            max_attempts: 8,
            base_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(180),
            strategy: BackoffStrategy::Adaptive,
            base_timeout: Duration::from_secs(60),
            ..Self::default()
        }
    }

    /// Tuned for multi-gigabyte transfers.
    pub fn large_transfer() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(120),
            strategy: BackoffStrategy::Adaptive,
            base_timeout: Duration::from_secs(1800),
            large_file_timeout: Duration::from_secs(3600),
            huge_file_timeout: Duration::from_secs(7200),
            max_concurrent: 2,
            ..Self::default()
        }
    }

    /// Tuned for local file I/O.
    pub fn file_io() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Linear,
            base_timeout: Duration::from_secs(30),
            max_concurrent: 10,
            ..Self::default()
        }
    }
}

/// Lower clamp for adaptive timeouts.
const TIMEOUT_FLOOR: Duration = Duration::from_secs(180);
/// Upper clamp for adaptive timeouts.
const TIMEOUT_CEILING: Duration = Duration::from_secs(14_400);

/// Success-rate multiplier applied on top of the exponential delay by the
/// adaptive strategy.
///
/// Healthy operations (success rate ≥ 0.8) back off less, down to half the
/// exponential delay; struggling ones (≤ 0.3) back off up to 5x, with an
/// extra 1.5x kick after more than three consecutive failures.
fn adaptive_multiplier(stats: &OperationStats) -> f64 {
    let sr = stats.success_rate();
    if sr >= 0.8 {
        (1.0 - (sr - 0.8) * 2.0).max(0.5)
    } else if sr <= 0.3 {
        let mut multiplier = 1.0 + (0.3 - sr) * 3.0;
        if stats.consecutive_failures > 3 {
            multiplier *= 1.5;
        }
        multiplier.min(5.0)
    } else {
        1.0
    }
}

fn apply_jitter(delay_secs: f64, jitter_range: f64) -> f64 {
    if jitter_range <= 0.0 {
        return delay_secs;
    }
    let jitter = rand::rng().random_range(-jitter_range..=jitter_range);
    (delay_secs * (1.0 + jitter)).max(0.1)
}

/// Delay before retry attempt `attempt` (1-based).
pub fn calculate_delay(attempt: u32, stats: &OperationStats, config: &RetryConfig) -> Duration {
    let base = config.base_delay.as_secs_f64();
    let exponential = || base * config.backoff_multiplier.powi(attempt as i32 - 1);

    let mut delay = match config.strategy {
        BackoffStrategy::Fixed => base,
        BackoffStrategy::Linear => base * attempt as f64,
        BackoffStrategy::Exponential => exponential(),
        BackoffStrategy::Adaptive => exponential() * adaptive_multiplier(stats),
    };

    delay = delay.min(config.max_delay.as_secs_f64());
    if config.jitter {
        delay = apply_jitter(delay, config.jitter_range);
    }
    Duration::from_secs_f64(delay.max(0.0))
}

/// Per-attempt timeout for an operation, adapted to file size and timeout
/// history, clamped to `[180s, 4h]`.
pub fn calculate_timeout(
    file_size: Option<u64>,
    stats: &OperationStats,
    config: &RetryConfig,
) -> Duration {
    let size = file_size.unwrap_or(0);
    let size_mb = size as f64 / (1024.0 * 1024.0);

    let mut base = if size_mb > 1000.0 {
        config.huge_file_timeout.as_secs_f64()
    } else if size_mb > 500.0 {
        config.large_file_timeout.as_secs_f64()
    } else {
        config.base_timeout.as_secs_f64()
    };

    if stats.timeout_count > 0 {
        let multiplier = 1.0 + stats.timeout_count as f64 * 0.5;
        base *= multiplier.min(3.0);
    }

    // Conservative lower bound: 1 MB/s with a 2x safety factor.
    let conservative_kbps = 1000.0;
    let size_based = (size as f64 / 1024.0) / conservative_kbps * 2.0;

    let adaptive = base.max(size_based);
    Duration::from_secs_f64(
        adaptive
            .min(TIMEOUT_CEILING.as_secs_f64())
            .max(TIMEOUT_FLOOR.as_secs_f64()),
    )
}

/// True once the mean of the last `detection_window` speed samples sits
/// strictly below the configured threshold. Never true before a full
/// window of samples exists.
pub fn is_throttled(stats: &OperationStats, config: &RetryConfig) -> bool {
    match stats.recent_speed_mean(config.detection_window) {
        Some(mean) => mean < config.speed_threshold_kbps,
        None => false,
    }
}

/// Cool-down injected before the next attempt of a throttled operation.
pub fn throttle_delay(stats: &OperationStats, config: &RetryConfig) -> Duration {
    if !is_throttled(stats, config) {
        return Duration::ZERO;
    }
    let base = (stats.consecutive_failures as f64 * 2.0).min(30.0);
    let jitter = rand::rng().random_range(0.8..=1.2);
    Duration::from_secs_f64(base * jitter)
}

/// Translates a failed attempt into the delay before the next one,
/// updating timeout history on the way.
///
/// Server waits are handled before this is reached; see
/// [`RetryExecutor::execute`].
pub fn error_delay(error: &Error, attempt: u32, stats: &mut OperationStats) -> Duration {
    match error {
        Error::RateLimited { wait } | Error::SlowMode { wait } => *wait,
        Error::Timeout { .. } => {
            stats.timeout_count += 1;
            let mut delay = 10.0 + 5.0 * attempt as f64;
            if stats.timeout_count > 1 {
                delay *= stats.timeout_count.min(5) as f64;
            }
            Duration::from_secs_f64(delay.min(300.0))
        }
        Error::Rpc { .. } => {
            let delay = 3.0 + 1.5 * attempt as f64;
            Duration::from_secs_f64(delay.min(30.0))
        }
        _ => {
            let delay = 2.0 + attempt as f64;
            Duration::from_secs_f64(delay.min(60.0))
        }
    }
}

/// Options for one [`RetryExecutor::execute`] call.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Per-call config; falls back to the executor default.
    pub config: Option<RetryConfig>,
    /// Hard per-attempt timeout, bypassing the adaptive calculation.
    pub timeout_override: Option<Duration>,
    /// Expected transfer size, feeding the adaptive timeout.
    pub file_size: Option<u64>,
}

/// The retry front door: owns the stats registry and the task pools.
#[derive(Clone)]
pub struct RetryExecutor {
    registry: StatsRegistry,
    pools: PoolSet,
    default_config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(default_config: RetryConfig) -> Self {
        let pools = PoolSet::new(default_config.auto_scale);
        Self {
            registry: StatsRegistry::new(),
            pools,
            default_config,
        }
    }

    pub fn registry(&self) -> &StatsRegistry {
        &self.registry
    }

    pub fn pools(&self) -> &PoolSet {
        &self.pools
    }

    /// Starts the background stats sweep.
    pub fn start(&self) {
        self.registry.start_sweeper();
    }

    /// Stops background tasks. Idempotent.
    pub fn shutdown(&self) {
        self.registry.shutdown();
    }

    /// Runs `op` with retry, per-attempt timeout and throttle cool-downs.
    ///
    /// `op` is invoked once per attempt inside the pool for `kind`. Server
    /// waits are slept and do not consume an attempt; every other failure
    /// consumes one and is spaced by the error-specific delay.
    ///
    /// # Errors
    ///
    /// Returns the last attempt's error once `max_attempts` is exhausted.
    pub async fn execute<T, F, Fut>(
        &self,
        name: &str,
        kind: PoolKind,
        op: F,
        opts: ExecuteOptions,
    ) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let config = opts.config.unwrap_or_else(|| self.default_config.clone());
        let timeout = match opts.timeout_override {
            Some(t) => t,
            None => {
                let stats = self.registry.snapshot(name).unwrap_or_default();
                if opts.file_size.is_some() {
                    calculate_timeout(opts.file_size, &stats, &config)
                } else {
                    config.base_timeout
                }
            }
        };
        let pool = self.pools.get(kind);

        let mut attempt = 1;
        loop {
            let cooldown = self
                .registry
                .snapshot(name)
                .map(|s| throttle_delay(&s, &config))
                .unwrap_or(Duration::ZERO);
            if !cooldown.is_zero() {
                tracing::info!(operation = name, secs = cooldown.as_secs_f64(), "throttle cool-down");
                tokio::time::sleep(cooldown).await;
            }

            let started = std::time::Instant::now();
            let outcome = match tokio::time::timeout(timeout, pool.submit(op())).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout { elapsed: timeout }),
            };

            match outcome {
                Ok(value) => {
                    self.registry
                        .with_stats(name, |s| s.update_success(started.elapsed()));
                    if attempt > 1 {
                        tracing::info!(
                            operation = name,
                            attempt,
                            max = config.max_attempts,
                            "succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(error) => {
                    // Server-told waits retry the same attempt.
                    if let Some(wait) = error.server_wait() {
                        tracing::warn!(
                            operation = name,
                            secs = wait.as_secs(),
                            "server wait, retrying same attempt"
                        );
                        tokio::time::sleep(wait).await;
                        continue;
                    }

                    self.registry.with_stats(name, |s| s.update_failure());

                    if attempt >= config.max_attempts {
                        tracing::error!(
                            operation = name,
                            attempts = config.max_attempts,
                            %error,
                            "giving up"
                        );
                        return Err(error);
                    }

                    let delay = self
                        .registry
                        .with_stats(name, |s| match &error {
                            Error::Timeout { .. } | Error::Rpc { .. } | Error::Other { .. } => {
                                error_delay(&error, attempt, s)
                            }
                            _ => calculate_delay(attempt, s, &config),
                        });
                    tracing::warn!(
                        operation = name,
                        attempt,
                        max = config.max_attempts,
                        %error,
                        delay_secs = delay.as_secs_f64(),
                        "attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
