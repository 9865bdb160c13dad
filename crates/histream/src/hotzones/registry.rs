//! Persistent knowledge base of slow ID ranges per datacenter.
//!
//! The registry answers two questions for the planner: "what chunk size
//! should I use for this range?" and "record that this chunk was slow".
//! Observations accumulate across runs in a small JSON database under
//! `<export_root>/.monitoring/slow_ranges_db.json`; a built-in default set
//! of zones is always loaded first so a cold start on a known-problematic
//! datacenter already benefits.

use std::fs;
use std::path::PathBuf;

use histream_core::types::{Datacenter, MessageId, Severity};
use histream_core::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::ExportConfig;

/// On-disk schema version.
const DB_VERSION: &str = "1.0";
/// Slow-chunk records kept on save.
const SLOW_CHUNK_KEEP: usize = 1000;
/// Records examined by [`HotZonesRegistry::recommendations`].
const RECENT_WINDOW: usize = 50;

fn one() -> u64 {
    1
}

/// A known problematic ID range in a specific datacenter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HotZone {
    pub id_start: MessageId,
    pub id_end: MessageId,
    pub datacenter: Datacenter,
    /// Recommended chunk size in IDs; lower severity means a larger value.
    pub optimal_chunk_size: i64,
    pub avg_latency_sec: f64,
    /// Average messages per 1000 IDs observed in the zone.
    pub message_density: f64,
    pub severity: Severity,
    /// `YYYY-MM-DD` of the latest observation.
    pub last_observed: String,
    #[serde(default = "one")]
    pub observation_count: u64,
}

impl HotZone {
    /// Closed-interval intersection with `[lo, hi]`.
    pub fn overlaps(&self, lo: MessageId, hi: MessageId) -> bool {
        !(hi < self.id_start || lo > self.id_end)
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.id_start <= id && id <= self.id_end
    }
}

/// One observed slow chunk, as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlowChunkRecord {
    /// `[lo, hi]` of the chunk.
    pub id_range: (MessageId, MessageId),
    pub duration_sec: f64,
    pub message_count: u64,
    /// `message_count * 1000 / (hi - lo)`.
    pub density: f64,
    pub datacenter: Datacenter,
    /// ISO-8601 timestamp of the observation.
    pub timestamp: String,
    pub worker_id: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_name: Option<String>,
}

impl SlowChunkRecord {
    pub fn new(
        lo: MessageId,
        hi: MessageId,
        duration_sec: f64,
        message_count: u64,
        datacenter: Datacenter,
        worker_id: usize,
    ) -> Self {
        let span = hi - lo;
        let density = if span > 0 {
            message_count as f64 * 1000.0 / span as f64
        } else {
            0.0
        };
        Self {
            id_range: (lo, hi),
            duration_sec,
            message_count,
            density,
            datacenter,
            timestamp: chrono::Utc::now().to_rfc3339(),
            worker_id,
            chat_name: None,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Database {
    version: String,
    last_updated: String,
    hot_zones: Vec<HotZone>,
    slow_chunks: Vec<SlowChunkRecord>,
}

#[derive(Default)]
struct RegistryState {
    hot_zones: Vec<HotZone>,
    slow_chunks: Vec<SlowChunkRecord>,
}

/// Default zones observed on the known-problematic datacenter, so a cold
/// start already avoids the worst ranges.
fn default_zones() -> Vec<HotZone> {
    let zone = |id_start, id_end, chunk, latency, density, severity, count| HotZone {
        id_start,
        id_end,
        datacenter: Datacenter::from("DC2"),
        optimal_chunk_size: chunk,
        avg_latency_sec: latency,
        message_density: density,
        severity,
        last_observed: "2025-12-05".to_string(),
        observation_count: count,
    };
    vec![
        zone(1_300_000, 1_400_000, 5_000, 91.4, 181.0, Severity::Critical, 1),
        zone(1_400_000, 1_500_000, 10_000, 3.6, 175.0, Severity::High, 2),
        zone(1_600_000, 1_700_000, 10_000, 3.3, 149.0, Severity::High, 3),
        zone(700_000, 1_000_000, 15_000, 32.0, 90.0, Severity::Medium, 1),
    ]
}

/// In-memory + on-disk registry of hot zones and slow-chunk history.
pub struct HotZonesRegistry {
    enabled: bool,
    default_chunk_size: i64,
    db_path: PathBuf,
    state: Mutex<RegistryState>,
}

impl HotZonesRegistry {
    /// Builds the registry from config: defaults first, then the on-disk
    /// database merged over them. A missing database is not an error; a
    /// malformed one logs a warning and leaves the defaults in place.
    pub fn open(config: &ExportConfig) -> Self {
        let registry = Self {
            enabled: config.enable_hot_zones,
            default_chunk_size: config.shard_chunk_size,
            db_path: config.slow_range_db_path(),
            state: Mutex::new(RegistryState::default()),
        };

        if registry.enabled {
            registry.state.lock().hot_zones = default_zones();
            registry.load();
            let state = registry.state.lock();
            tracing::info!(
                zones = state.hot_zones.len(),
                slow_chunks = state.slow_chunks.len(),
                "hot-zone registry loaded"
            );
        } else {
            tracing::info!("hot zones disabled in configuration");
        }

        registry
    }

    /// Smallest recommended chunk size among zones intersecting `[lo, hi]`
    /// in `dc`, or the configured default when none match (or the registry
    /// is disabled).
    pub fn optimal_chunk_size(&self, lo: MessageId, hi: MessageId, dc: &Datacenter) -> i64 {
        if !self.enabled {
            return self.default_chunk_size;
        }
        let zones = self.zones_for(lo, hi, dc);
        match zones.iter().map(|z| z.optimal_chunk_size).min() {
            Some(size) => {
                tracing::debug!(lo, hi, %dc, size, "hot zone sized chunk");
                size
            }
            None => self.default_chunk_size,
        }
    }

    /// All zones intersecting `[lo, hi]` in `dc`.
    pub fn zones_for(&self, lo: MessageId, hi: MessageId, dc: &Datacenter) -> Vec<HotZone> {
        self.state
            .lock()
            .hot_zones
            .iter()
            .filter(|z| z.datacenter == *dc && z.overlaps(lo, hi))
            .cloned()
            .collect()
    }

    /// Appends a slow-chunk observation to the in-memory history. The
    /// history is ring-truncated to the most recent 1000 on save.
    pub fn record_slow_chunk(&self, record: SlowChunkRecord) {
        tracing::debug!(
            range = ?record.id_range,
            duration = record.duration_sec,
            density = record.density,
            "recorded slow chunk"
        );
        self.state.lock().slow_chunks.push(record);
    }

    /// Learns from one slow-chunk observation: updates the running averages
    /// of every overlapping same-datacenter zone, or promotes the record to
    /// a new zone when it is severe enough.
    pub fn learn_from(&self, record: &SlowChunkRecord) {
        if !self.enabled {
            return;
        }
        let (lo, hi) = record.id_range;
        let mut state = self.state.lock();

        let mut updated = false;
        for zone in state
            .hot_zones
            .iter_mut()
            .filter(|z| z.datacenter == record.datacenter && z.overlaps(lo, hi))
        {
            let old = zone.observation_count as f64;
            let new = old + 1.0;
            zone.avg_latency_sec = (zone.avg_latency_sec * old + record.duration_sec) / new;
            zone.message_density = (zone.message_density * old + record.density) / new;
            zone.observation_count += 1;
            zone.last_observed = chrono::Utc::now().format("%Y-%m-%d").to_string();
            updated = true;
            tracing::debug!(
                start = zone.id_start,
                end = zone.id_end,
                observations = zone.observation_count,
                avg_latency = zone.avg_latency_sec,
                "updated hot zone"
            );
        }
        if updated {
            return;
        }

        let (duration, density) = (record.duration_sec, record.density);
        if duration <= 10.0 && density <= 150.0 {
            return;
        }
        let (severity, chunk_size) = if duration > 60.0 || density > 180.0 {
            (Severity::Critical, 5_000)
        } else if duration > 20.0 || density > 150.0 {
            (Severity::High, 10_000)
        } else if duration > 10.0 || density > 100.0 {
            (Severity::Medium, 15_000)
        } else {
            (Severity::Low, 25_000)
        };

        tracing::info!(lo, hi, %severity, chunk_size, "created new hot zone");
        state.hot_zones.push(HotZone {
            id_start: lo,
            id_end: hi,
            datacenter: record.datacenter.clone(),
            optimal_chunk_size: chunk_size,
            avg_latency_sec: duration,
            message_density: density,
            severity,
            last_observed: chrono::Utc::now().format("%Y-%m-%d").to_string(),
            observation_count: 1,
        });
    }

    /// Writes the database atomically (write temp, then rename), keeping
    /// only the most recent 1000 slow chunks.
    pub fn save(&self) -> Result<()> {
        let data = {
            let mut state = self.state.lock();
            if state.slow_chunks.len() > SLOW_CHUNK_KEEP {
                let drop_count = state.slow_chunks.len() - SLOW_CHUNK_KEEP;
                state.slow_chunks.drain(..drop_count);
            }
            Database {
                version: DB_VERSION.to_string(),
                last_updated: chrono::Utc::now().to_rfc3339(),
                hot_zones: state.hot_zones.clone(),
                slow_chunks: state.slow_chunks.clone(),
            }
        };

        if let Some(parent) = self.db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.db_path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&data)?)?;
        fs::rename(&tmp, &self.db_path)?;
        tracing::debug!(path = %self.db_path.display(), "saved slow-range database");
        Ok(())
    }

    /// Best-effort save from async contexts: runs on the blocking pool and
    /// only logs failures.
    pub fn save_best_effort(self: std::sync::Arc<Self>) {
        tokio::task::spawn_blocking(move || {
            if let Err(error) = self.save() {
                tracing::warn!(%error, "failed to save slow-range database");
            }
        });
    }

    fn load(&self) {
        if !self.db_path.exists() {
            tracing::debug!(path = %self.db_path.display(), "no slow-range database yet");
            return;
        }
        let data: Database = match fs::read(&self.db_path)
            .map_err(histream_core::Error::from)
            .and_then(|bytes| Ok(serde_json::from_slice(&bytes)?))
        {
            Ok(data) => data,
            Err(error) => {
                tracing::warn!(%error, "failed to load slow-range database, using defaults");
                return;
            }
        };

        let mut state = self.state.lock();
        for db_zone in data.hot_zones {
            let existing = state
                .hot_zones
                .iter_mut()
                .find(|z| z.datacenter == db_zone.datacenter && z.id_start == db_zone.id_start);
            match existing {
                // Exact (dc, id_start) match: the disk entry wins.
                Some(zone) => *zone = db_zone,
                None => state.hot_zones.push(db_zone),
            }
        }
        state.slow_chunks = data.slow_chunks;
    }

    /// Derived advisories for the operator, based on the recent history.
    pub fn recommendations(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut out = Vec::new();

        let recent: Vec<&SlowChunkRecord> = state
            .slow_chunks
            .iter()
            .rev()
            .take(RECENT_WINDOW)
            .collect();

        if recent.len() > 10 {
            let mut dc_counts: std::collections::HashMap<&Datacenter, usize> =
                std::collections::HashMap::new();
            for chunk in &recent {
                *dc_counts.entry(&chunk.datacenter).or_default() += 1;
            }
            for (dc, count) in dc_counts {
                if count * 2 > recent.len() {
                    out.push(format!(
                        "{dc} accounts for {count}/{} recent slow chunks. \
                         Consider reducing chunk sizes for this datacenter.",
                        recent.len()
                    ));
                }
            }
        }

        let high_density = recent.iter().filter(|c| c.density > 150.0).count();
        if high_density > 5 {
            out.push(format!(
                "{high_density} recent chunks had very high density (>150 msgs/1K IDs). \
                 Density-based chunking is active and should help."
            ));
        }

        let critical = state
            .hot_zones
            .iter()
            .filter(|z| z.severity == Severity::Critical)
            .count();
        if critical > 0 {
            out.push(format!(
                "{critical} CRITICAL hot zones active. Future exports in these \
                 ranges will use 5K chunk sizes."
            ));
        }

        out
    }

    pub fn zone_count(&self) -> usize {
        self.state.lock().hot_zones.len()
    }

    pub fn slow_chunk_count(&self) -> usize {
        self.state.lock().slow_chunks.len()
    }
}
