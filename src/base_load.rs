//! Base load estimation
//!
//! The base load is a low percentile of instantaneous load power over a
//! trailing window: the sustained minimum draw of the site, robust against
//! short spikes. Current PV output above it marks "solar daytime".

use crate::cache::{Cached, needs_refresh};
use crate::config::BaseLoadConfig;
use crate::error::{GridwiseError, Result};
use crate::logging::{StructuredLogger, get_logger};
use crate::plant::Plant;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

/// Estimated sustained minimum load in kW
pub type BaseLoadEstimate = Cached<f64>;

/// Percentile of `values` with linear interpolation between closest ranks.
///
/// `pct` is clamped to `0..=100`. Non-finite values are ignored; `None` when
/// nothing remains.
pub fn percentile(values: &[f64], pct: f64) -> Option<f64> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(f64::total_cmp);

    let rank = pct.clamp(0.0, 100.0) / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let weight = rank - lower as f64;
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * weight)
}

/// Whether current PV output exceeds the base load
pub fn is_solar_daytime(pv_power_kw: f64, base_load_kw: f64) -> bool {
    pv_power_kw > base_load_kw
}

/// Percentile-based base load estimator with a lazily refreshed cache
pub struct BaseLoadEstimator {
    plant: Arc<dyn Plant>,
    entity_id: String,
    percentile: f64,
    window: Duration,
    ttl: Duration,
    cached: Option<BaseLoadEstimate>,
    logger: StructuredLogger,
}

impl BaseLoadEstimator {
    pub fn new(plant: Arc<dyn Plant>, entity_id: impl Into<String>, config: &BaseLoadConfig) -> Self {
        Self {
            plant,
            entity_id: entity_id.into(),
            percentile: config.percentile,
            window: Duration::days(i64::from(config.window_days)),
            ttl: Duration::hours(i64::from(config.ttl_hours)),
            cached: None,
            logger: get_logger("base_load"),
        }
    }

    /// Last computed estimate, if any
    pub fn cached(&self) -> Option<&BaseLoadEstimate> {
        self.cached.as_ref()
    }

    /// Return the cached estimate, recomputing it first when absent or older
    /// than the TTL. A failed recomputation leaves the previous value intact.
    pub async fn refresh_if_stale(&mut self, now: DateTime<Utc>) -> Result<f64> {
        if let Some(cached) = &self.cached
            && !needs_refresh(&self.cached, now, self.ttl)
        {
            return Ok(cached.value);
        }

        let estimate = self.compute(now).await?;
        self.logger.info(&format!(
            "Base load estimate {:.3} kW (p{} over {} days)",
            estimate,
            self.percentile,
            self.window.num_days()
        ));
        self.cached = Some(Cached::new(estimate, now));
        Ok(estimate)
    }

    async fn compute(&self, now: DateTime<Utc>) -> Result<f64> {
        let samples = self
            .plant
            .get_history(&self.entity_id, now - self.window, now)
            .await?;
        let values: Vec<f64> = samples.iter().filter_map(|s| s.value).collect();
        percentile(&values, self.percentile).ok_or_else(|| {
            GridwiseError::insufficient_history(format!(
                "no readings of {} in the last {} days",
                self.entity_id,
                self.window.num_days()
            ))
        })
    }
}
