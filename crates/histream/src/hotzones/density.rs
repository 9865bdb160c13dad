//! Message-density estimation by probe sampling.
//!
//! Before planning chunks for a large ID range, the engine fetches a few
//! small windows spread across the range and extrapolates messages per
//! 1000 IDs. Density feeds the chunk-size table whenever no hot zone
//! matches a position.

use histream_core::types::MessageId;

use crate::client::{EntityInfo, HistoryConnection, PageRequest};
use crate::config::ExportConfig;

/// Safe assumption when estimation is disabled, the range is too small to
/// sample, or every probe failed.
pub const DEFAULT_DENSITY: f64 = 50.0;

/// Chunk size for an estimated density, per the configured table.
pub fn chunk_size_for_density(density: f64, config: &ExportConfig) -> i64 {
    if density > config.density_very_high_threshold {
        config.chunk_size_very_high_density
    } else if density > config.density_high_threshold {
        config.chunk_size_high_density
    } else if density > config.density_medium_threshold {
        config.chunk_size_medium_density
    } else {
        config.chunk_size_low_density
    }
}

/// Probe-samples an ID range through the master connection.
pub struct DensityEstimator<'a> {
    config: &'a ExportConfig,
}

impl<'a> DensityEstimator<'a> {
    pub fn new(config: &'a ExportConfig) -> Self {
        Self { config }
    }

    /// Estimates messages per 1000 IDs in `[lo, hi]`.
    ///
    /// Picks `density_sample_points` probe positions (for the default 3:
    /// start, middle, end), fetches a ±`sample_range/2` window around each
    /// and averages `count / sample_range * 1000`. Failed probes are logged
    /// and skipped; with no surviving sample the default is returned.
    pub async fn estimate(
        &self,
        conn: &dyn HistoryConnection,
        entity: &EntityInfo,
        lo: MessageId,
        hi: MessageId,
    ) -> f64 {
        if !self.config.enable_density_estimation {
            tracing::debug!("density estimation disabled in config");
            return DEFAULT_DENSITY;
        }

        let sample_range = self.config.density_sample_range;
        let sample_points = self.config.density_sample_points;
        let span = hi - lo;
        if span < sample_range * 3 {
            tracing::debug!(span, "range too small for density sampling");
            return DEFAULT_DENSITY;
        }

        let positions: Vec<MessageId> = if sample_points == 3 {
            vec![lo, lo + span / 2, hi]
        } else {
            let step = span / (sample_points as i64 + 1);
            (1..=sample_points as i64).map(|i| lo + i * step).collect()
        };

        let mut samples: Vec<usize> = Vec::with_capacity(positions.len());
        for pos in positions {
            let page = PageRequest {
                // Exclusive bounds widen the window by one on each side,
                // covering exactly [pos - range/2, pos + range/2].
                min_id: (pos - sample_range / 2 - 1).max(0),
                offset_id: pos + sample_range / 2 + 1,
                limit: sample_range as usize,
            };
            match conn.history_page(entity, page).await {
                Ok(batch) => {
                    tracing::debug!(pos, count = batch.len(), "density sample");
                    samples.push(batch.len());
                }
                Err(error) => {
                    tracing::debug!(pos, %error, "density sample failed");
                }
            }
        }

        if samples.is_empty() {
            tracing::warn!("all density samples failed, using default");
            return DEFAULT_DENSITY;
        }

        let avg = samples.iter().sum::<usize>() as f64 / samples.len() as f64;
        let density = avg / sample_range as f64 * 1000.0;
        tracing::info!(
            density = format!("{density:.1}"),
            samples = samples.len(),
            "estimated message density"
        );
        density
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;
    use histream_core::types::{Datacenter, MessageRecord};
    use histream_core::{Error, Result};
    use parking_lot::Mutex;

    fn entity() -> EntityInfo {
        EntityInfo {
            id: 1,
            name: "probe-target".to_string(),
            datacenter: Datacenter::from("DC2"),
        }
    }

    /// Serves a fixed number of records per probe window, optionally
    /// failing some positions.
    struct ProbeConn {
        per_window: usize,
        fail_below: MessageId,
        requests: Arc<Mutex<Vec<PageRequest>>>,
    }

    #[async_trait]
    impl HistoryConnection for ProbeConn {
        async fn history_page(
            &self,
            _entity: &EntityInfo,
            page: PageRequest,
        ) -> Result<Vec<MessageRecord>> {
            self.requests.lock().push(page);
            if page.offset_id < self.fail_below {
                return Err(Error::rpc("probe failed"));
            }
            Ok((0..self.per_window as i64)
                .map(|i| MessageRecord::bare(page.min_id + 1 + i))
                .collect())
        }

        async fn disconnect(&self) -> Result<()> {
            Ok(())
        }
    }

    fn probe_conn(per_window: usize) -> ProbeConn {
        ProbeConn {
            per_window,
            fail_below: 0,
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    #[tokio::test]
    async fn three_point_sampling_averages_windows() {
        let config = ExportConfig::default();
        let conn = probe_conn(120);
        let estimator = DensityEstimator::new(&config);

        let density = estimator.estimate(&conn, &entity(), 0, 100_000).await;
        // 120 messages per 1000-ID window.
        assert!((density - 120.0).abs() < 1e-9);
        assert_eq!(conn.requests.lock().len(), 3);
    }

    #[tokio::test]
    async fn small_range_returns_default_without_probing() {
        let config = ExportConfig::default();
        let conn = probe_conn(120);
        let estimator = DensityEstimator::new(&config);

        let density = estimator.estimate(&conn, &entity(), 0, 2_500).await;
        assert_eq!(density, DEFAULT_DENSITY);
        assert!(conn.requests.lock().is_empty());
    }

    #[tokio::test]
    async fn disabled_estimation_returns_default() {
        let config = ExportConfig {
            enable_density_estimation: false,
            ..ExportConfig::default()
        };
        let conn = probe_conn(120);
        let estimator = DensityEstimator::new(&config);

        let density = estimator.estimate(&conn, &entity(), 0, 100_000).await;
        assert_eq!(density, DEFAULT_DENSITY);
        assert!(conn.requests.lock().is_empty());
    }

    #[tokio::test]
    async fn failed_probes_are_skipped() {
        let config = ExportConfig::default();
        // Fail the first probe (offset near lo), keep the other two.
        let conn = ProbeConn {
            per_window: 90,
            fail_below: 10_000,
            requests: Arc::new(Mutex::new(Vec::new())),
        };
        let estimator = DensityEstimator::new(&config);

        let density = estimator.estimate(&conn, &entity(), 0, 100_000).await;
        assert!((density - 90.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn all_probes_failing_returns_default() {
        let config = ExportConfig::default();
        let conn = ProbeConn {
            per_window: 90,
            fail_below: MessageId::MAX,
            requests: Arc::new(Mutex::new(Vec::new())),
        };
        let estimator = DensityEstimator::new(&config);

        let density = estimator.estimate(&conn, &entity(), 0, 100_000).await;
        assert_eq!(density, DEFAULT_DENSITY);
    }

    #[tokio::test]
    async fn five_point_sampling_distributes_evenly() {
        let config = ExportConfig {
            density_sample_points: 5,
            ..ExportConfig::default()
        };
        let conn = probe_conn(60);
        let estimator = DensityEstimator::new(&config);

        let density = estimator.estimate(&conn, &entity(), 0, 60_000).await;
        assert!((density - 60.0).abs() < 1e-9);
        let requests = conn.requests.lock();
        assert_eq!(requests.len(), 5);
        // Probes at i * span/6 for i in 1..=5.
        let centers: Vec<MessageId> = requests
            .iter()
            .map(|r| (r.offset_id + r.min_id) / 2)
            .collect();
        assert!(centers.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn density_table_matches_thresholds() {
        let config = ExportConfig::default();
        assert_eq!(chunk_size_for_density(200.0, &config), 5_000);
        assert_eq!(chunk_size_for_density(120.0, &config), 10_000);
        assert_eq!(chunk_size_for_density(80.0, &config), 15_000);
        assert_eq!(chunk_size_for_density(50.0, &config), 50_000);
        assert_eq!(chunk_size_for_density(10.0, &config), 50_000);
        // Boundary: exactly at a threshold stays in the lower tier.
        assert_eq!(chunk_size_for_density(150.0, &config), 10_000);
        assert_eq!(chunk_size_for_density(100.0, &config), 15_000);
    }
}
