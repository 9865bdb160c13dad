//! Runtime configuration for the export engine.
//!
//! All knobs are parsed from CLI arguments or environment variables with
//! defaults suitable for production, then validated into an
//! [`ExportConfig`]. Each field is independently tunable so deployments can
//! trade memory, concurrency and remote load against export speed.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::bail;
use clap::Parser;

use crate::retry::{BackoffStrategy, RetryConfig};

/// Command-line / environment surface of the engine.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "histream",
    version,
    about = "Sharded parallel chat-history export engine"
)]
pub struct CliArgs {
    /// Root directory of the export. Spill files land under
    /// `<root>/temp_shards`, the slow-range database under
    /// `<root>/.monitoring`.
    ///
    /// Environment variable: `EXPORT_ROOT`
    #[arg(long, env = "EXPORT_ROOT", default_value = "./export")]
    pub export_root: PathBuf,

    /// Master switch for the sharded fetch path. When disabled every export
    /// uses the simple paged walk on the master connection.
    ///
    /// Environment variable: `ENABLE_SHARD_FETCH`
    #[arg(long, env = "ENABLE_SHARD_FETCH", default_value_t = true, action = clap::ArgAction::Set)]
    pub enable_shard_fetch: bool,

    /// Number of worker connections cloned from the master session.
    ///
    /// Each worker holds its own connection to the remote, so this is also
    /// the remote-side connection footprint of an export.
    ///
    /// Environment variable: `SHARD_COUNT`
    #[arg(long, env = "SHARD_COUNT", default_value_t = 4)]
    pub shard_count: usize,

    /// Default chunk size in IDs when neither a hot zone nor the density
    /// estimate applies.
    ///
    /// Environment variable: `SHARD_CHUNK_SIZE`
    #[arg(long, env = "SHARD_CHUNK_SIZE", default_value_t = 50_000)]
    pub shard_chunk_size: i64,

    /// Load, consult and update the hot-zone registry.
    ///
    /// Environment variable: `ENABLE_HOT_ZONES`
    #[arg(long, env = "ENABLE_HOT_ZONES", default_value_t = true, action = clap::ArgAction::Set)]
    pub enable_hot_zones: bool,

    /// Probe the target ID range to estimate message density before
    /// planning chunks.
    ///
    /// Environment variable: `ENABLE_DENSITY_ESTIMATION`
    #[arg(long, env = "ENABLE_DENSITY_ESTIMATION", default_value_t = true, action = clap::ArgAction::Set)]
    pub enable_density_estimation: bool,

    /// Number of probe points for density estimation.
    ///
    /// Environment variable: `DENSITY_SAMPLE_POINTS`
    #[arg(long, env = "DENSITY_SAMPLE_POINTS", default_value_t = 3)]
    pub density_sample_points: usize,

    /// Width in IDs of the window fetched around each probe point.
    ///
    /// Environment variable: `DENSITY_SAMPLE_RANGE`
    #[arg(long, env = "DENSITY_SAMPLE_RANGE", default_value_t = 1_000)]
    pub density_sample_range: i64,

    /// Density above which a range counts as very high density
    /// (messages per 1000 IDs).
    #[arg(long, env = "DENSITY_VERY_HIGH_THRESHOLD", default_value_t = 150.0)]
    pub density_very_high_threshold: f64,

    /// Density above which a range counts as high density.
    #[arg(long, env = "DENSITY_HIGH_THRESHOLD", default_value_t = 100.0)]
    pub density_high_threshold: f64,

    /// Density above which a range counts as medium density.
    #[arg(long, env = "DENSITY_MEDIUM_THRESHOLD", default_value_t = 50.0)]
    pub density_medium_threshold: f64,

    /// Chunk size used in very-high-density ranges.
    #[arg(long, env = "CHUNK_SIZE_VERY_HIGH_DENSITY", default_value_t = 5_000)]
    pub chunk_size_very_high_density: i64,

    /// Chunk size used in high-density ranges.
    #[arg(long, env = "CHUNK_SIZE_HIGH_DENSITY", default_value_t = 10_000)]
    pub chunk_size_high_density: i64,

    /// Chunk size used in medium-density ranges.
    #[arg(long, env = "CHUNK_SIZE_MEDIUM_DENSITY", default_value_t = 15_000)]
    pub chunk_size_medium_density: i64,

    /// Chunk size used in low-density ranges.
    #[arg(long, env = "CHUNK_SIZE_LOW_DENSITY", default_value_t = 50_000)]
    pub chunk_size_low_density: i64,

    /// Wall-time in seconds after which a chunk counts as slow enough to
    /// discard and re-fetch as 4 sub-chunks.
    ///
    /// Environment variable: `SLOW_CHUNK_THRESHOLD`
    #[arg(long, env = "SLOW_CHUNK_THRESHOLD", default_value_t = 10.0)]
    pub slow_chunk_threshold: f64,

    /// Adaptive-split recursion budget per chunk.
    ///
    /// Environment variable: `SLOW_CHUNK_MAX_RETRIES`
    #[arg(long, env = "SLOW_CHUNK_MAX_RETRIES", default_value_t = 2)]
    pub slow_chunk_max_retries: u32,

    /// Largest file in MB the bulk-export session should grant access to.
    ///
    /// Environment variable: `MAX_FILE_SIZE_MB`
    #[arg(long, env = "MAX_FILE_SIZE_MB", default_value_t = 2_000)]
    pub max_file_size_mb: u64,

    /// Capacity of the merged-output channel between the merge task and the
    /// caller's stream. Lower values tighten backpressure, higher values
    /// allow deeper pipelining.
    ///
    /// Environment variable: `MERGE_BUFFER_SIZE`
    #[arg(long, env = "MERGE_BUFFER_SIZE", default_value_t = 64)]
    pub merge_buffer_size: usize,

    // --- retry / timeout / throttling ---
    /// Retry attempts before an operation is given up.
    #[arg(long, env = "RETRY_MAX_ATTEMPTS", default_value_t = 3)]
    pub max_attempts: u32,

    /// Base retry delay in seconds.
    #[arg(long, env = "RETRY_BASE_DELAY", default_value_t = 1.0)]
    pub base_delay: f64,

    /// Upper clamp on the retry delay in seconds.
    #[arg(long, env = "RETRY_MAX_DELAY", default_value_t = 60.0)]
    pub max_delay: f64,

    /// Backoff strategy between attempts.
    #[arg(long, env = "RETRY_STRATEGY", value_enum, default_value_t = BackoffStrategy::Exponential)]
    pub strategy: BackoffStrategy,

    /// Randomize delays to avoid thundering herds.
    #[arg(long, env = "RETRY_JITTER", default_value_t = true, action = clap::ArgAction::Set)]
    pub jitter: bool,

    /// Relative jitter range applied to each delay.
    #[arg(long, env = "RETRY_JITTER_RANGE", default_value_t = 0.1)]
    pub jitter_range: f64,

    /// Multiplier of the exponential backoff.
    #[arg(long, env = "RETRY_BACKOFF_MULTIPLIER", default_value_t = 2.0)]
    pub backoff_multiplier: f64,

    /// Per-attempt timeout in seconds for ordinary operations.
    #[arg(long, env = "RETRY_BASE_TIMEOUT", default_value_t = 300.0)]
    pub base_timeout: f64,

    /// Per-attempt timeout in seconds for transfers over 500 MB.
    #[arg(long, env = "RETRY_LARGE_FILE_TIMEOUT", default_value_t = 3600.0)]
    pub large_file_timeout: f64,

    /// Per-attempt timeout in seconds for transfers over 1 GB.
    #[arg(long, env = "RETRY_HUGE_FILE_TIMEOUT", default_value_t = 7200.0)]
    pub huge_file_timeout: f64,

    /// Mean speed in KB/s below which an operation counts as throttled.
    #[arg(long, env = "SPEED_THRESHOLD_KBPS", default_value_t = 50.0)]
    pub speed_threshold_kbps: f64,

    /// Number of speed samples the throttle detector averages over.
    #[arg(long, env = "THROTTLE_DETECTION_WINDOW", default_value_t = 5)]
    pub detection_window: usize,

    /// Baseline concurrent operations per task pool.
    #[arg(long, env = "MAX_CONCURRENT", default_value_t = 5)]
    pub max_concurrent: usize,

    /// Let task pools move their ceilings with observed load.
    #[arg(long, env = "POOL_AUTO_SCALE", default_value_t = true, action = clap::ArgAction::Set)]
    pub auto_scale: bool,

    /// Utilization above which a pool considers growing.
    #[arg(long, env = "POOL_SCALE_THRESHOLD", default_value_t = 0.8)]
    pub scale_threshold: f64,
}

/// Validated engine configuration.
#[derive(Debug, Clone)]
pub struct ExportConfig {
    pub export_root: PathBuf,
    pub enable_shard_fetch: bool,
    pub shard_count: usize,
    pub shard_chunk_size: i64,
    pub enable_hot_zones: bool,
    pub enable_density_estimation: bool,
    pub density_sample_points: usize,
    pub density_sample_range: i64,
    pub density_very_high_threshold: f64,
    pub density_high_threshold: f64,
    pub density_medium_threshold: f64,
    pub chunk_size_very_high_density: i64,
    pub chunk_size_high_density: i64,
    pub chunk_size_medium_density: i64,
    pub chunk_size_low_density: i64,
    pub slow_chunk_threshold: Duration,
    pub slow_chunk_max_retries: u32,
    pub max_file_size_mb: u64,
    pub merge_buffer_size: usize,
    pub retry: RetryConfig,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            export_root: PathBuf::from("./export"),
            enable_shard_fetch: true,
            shard_count: 4,
            shard_chunk_size: 50_000,
            enable_hot_zones: true,
            enable_density_estimation: true,
            density_sample_points: 3,
            density_sample_range: 1_000,
            density_very_high_threshold: 150.0,
            density_high_threshold: 100.0,
            density_medium_threshold: 50.0,
            chunk_size_very_high_density: 5_000,
            chunk_size_high_density: 10_000,
            chunk_size_medium_density: 15_000,
            chunk_size_low_density: 50_000,
            slow_chunk_threshold: Duration::from_secs(10),
            slow_chunk_max_retries: 2,
            max_file_size_mb: 2_000,
            merge_buffer_size: 64,
            retry: RetryConfig::default(),
        }
    }
}

impl ExportConfig {
    /// Loads `.env`, parses CLI arguments and validates them.
    pub fn load() -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();
        Self::try_from(CliArgs::parse())
    }

    /// Directory the merge spill files live in during a run.
    pub fn spill_dir(&self) -> PathBuf {
        self.export_root.join("temp_shards")
    }

    /// Path of the persistent slow-range database.
    pub fn slow_range_db_path(&self) -> PathBuf {
        self.export_root.join(".monitoring").join("slow_ranges_db.json")
    }
}

impl TryFrom<CliArgs> for ExportConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.shard_count == 0 {
            bail!("SHARD_COUNT must be greater than 0");
        }
        if args.shard_chunk_size < 1_000 {
            bail!(
                "SHARD_CHUNK_SIZE ({}) must be at least 1000 IDs",
                args.shard_chunk_size
            );
        }
        if args.merge_buffer_size == 0 {
            bail!("MERGE_BUFFER_SIZE must be greater than 0");
        }
        if args.density_sample_points == 0 || args.density_sample_range <= 0 {
            bail!("density sampling requires at least one probe point and a positive range");
        }
        if args.max_attempts == 0 {
            bail!("RETRY_MAX_ATTEMPTS must be greater than 0");
        }

        let retry = RetryConfig {
            max_attempts: args.max_attempts,
            base_delay: Duration::from_secs_f64(args.base_delay),
            max_delay: Duration::from_secs_f64(args.max_delay),
            strategy: args.strategy,
            jitter: args.jitter,
            jitter_range: args.jitter_range,
            backoff_multiplier: args.backoff_multiplier,
            base_timeout: Duration::from_secs_f64(args.base_timeout),
            large_file_timeout: Duration::from_secs_f64(args.large_file_timeout),
            huge_file_timeout: Duration::from_secs_f64(args.huge_file_timeout),
            speed_threshold_kbps: args.speed_threshold_kbps,
            detection_window: args.detection_window,
            max_concurrent: args.max_concurrent,
            auto_scale: args.auto_scale,
            scale_threshold: args.scale_threshold,
        };

        Ok(Self {
            export_root: args.export_root,
            enable_shard_fetch: args.enable_shard_fetch,
            shard_count: args.shard_count,
            shard_chunk_size: args.shard_chunk_size,
            enable_hot_zones: args.enable_hot_zones,
            enable_density_estimation: args.enable_density_estimation,
            density_sample_points: args.density_sample_points,
            density_sample_range: args.density_sample_range,
            density_very_high_threshold: args.density_very_high_threshold,
            density_high_threshold: args.density_high_threshold,
            density_medium_threshold: args.density_medium_threshold,
            chunk_size_very_high_density: args.chunk_size_very_high_density,
            chunk_size_high_density: args.chunk_size_high_density,
            chunk_size_medium_density: args.chunk_size_medium_density,
            chunk_size_low_density: args.chunk_size_low_density,
            slow_chunk_threshold: Duration::from_secs_f64(args.slow_chunk_threshold),
            slow_chunk_max_retries: args.slow_chunk_max_retries,
            max_file_size_mb: args.max_file_size_mb,
            merge_buffer_size: args.merge_buffer_size,
            retry,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> CliArgs {
        let mut argv = vec!["histream"];
        argv.extend_from_slice(extra);
        CliArgs::parse_from(argv)
    }

    #[test]
    fn defaults_validate() {
        let config = ExportConfig::try_from(args(&[])).unwrap();
        assert_eq!(config.shard_count, 4);
        assert_eq!(config.shard_chunk_size, 50_000);
        assert!(config.enable_shard_fetch);
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn zero_shards_rejected() {
        let err = ExportConfig::try_from(args(&["--shard-count", "0"])).unwrap_err();
        assert!(err.to_string().contains("SHARD_COUNT"));
    }

    #[test]
    fn tiny_chunk_size_rejected() {
        let err = ExportConfig::try_from(args(&["--shard-chunk-size", "500"])).unwrap_err();
        assert!(err.to_string().contains("SHARD_CHUNK_SIZE"));
    }

    #[test]
    fn strategy_parses_from_cli() {
        let config = ExportConfig::try_from(args(&["--strategy", "adaptive"])).unwrap();
        assert_eq!(config.retry.strategy, BackoffStrategy::Adaptive);
    }

    #[test]
    fn paths_derive_from_export_root() {
        let config = ExportConfig::try_from(args(&["--export-root", "/tmp/x"])).unwrap();
        assert_eq!(config.spill_dir(), PathBuf::from("/tmp/x/temp_shards"));
        assert_eq!(
            config.slow_range_db_path(),
            PathBuf::from("/tmp/x/.monitoring/slow_ranges_db.json")
        );
    }
}
