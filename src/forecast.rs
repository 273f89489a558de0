//! Consumption forecasting over the daily load profile
//!
//! The profile is a cumulative curve that restarts at local midnight, so the
//! consumption between two times of day is the difference of their bucket
//! values, plus one full day when the window crosses midnight.

use crate::cache::{Cached, needs_refresh};
use crate::config::ProfileConfig;
use crate::error::{GridwiseError, Result};
use crate::logging::{StructuredLogger, get_logger};
use crate::plant::Plant;
use crate::profile::{ProfileBuilder, TimeBucketProfile, check_bucket_minutes, floor_instant, local_day_range};
use chrono::{DateTime, Duration, NaiveTime, Utc};
use chrono_tz::Tz;
use std::sync::Arc;

/// Target of a forecast
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ForecastWindow {
    /// A number of hours after now, at most 24
    FromNowHours(f64),
    /// The next occurrence of a local time of day
    Until(NaiveTime),
}

impl ForecastWindow {
    /// Exactly one of the two options must be given
    pub fn from_options(from_now_hours: Option<f64>, until: Option<NaiveTime>) -> Result<Self> {
        match (from_now_hours, until) {
            (Some(hours), None) => {
                if !(0.0..=24.0).contains(&hours) {
                    return Err(GridwiseError::invalid_configuration(format!(
                        "forecast window of {} h is outside 0..=24",
                        hours
                    )));
                }
                Ok(ForecastWindow::FromNowHours(hours))
            }
            (None, Some(time)) => Ok(ForecastWindow::Until(time)),
            (None, None) => Err(GridwiseError::invalid_configuration(
                "forecast needs either from_now_hours or until_time",
            )),
            (Some(_), Some(_)) => Err(GridwiseError::invalid_configuration(
                "forecast accepts only one of from_now_hours and until_time",
            )),
        }
    }
}

/// Net consumption (kWh) between `now` and the window's target
pub fn forecast_with_profile(
    profile: &TimeBucketProfile,
    now: DateTime<Utc>,
    window: ForecastWindow,
    tz: Tz,
) -> Result<f64> {
    let local_now = now.with_timezone(&tz).time();
    let start_idx = profile.index_of(local_now);

    let (end_idx, same_bucket) = match window {
        ForecastWindow::Until(time) => {
            let end_idx = profile.index_of(time);
            (end_idx, end_idx == start_idx)
        }
        ForecastWindow::FromNowHours(hours) => {
            if !(0.0..=24.0).contains(&hours) {
                return Err(GridwiseError::invalid_configuration(format!(
                    "forecast window of {} h is outside 0..=24",
                    hours
                )));
            }
            let target = now + Duration::milliseconds((hours * 3_600_000.0).round() as i64);
            let end_idx = profile.index_of(target.with_timezone(&tz).time());
            let bucket = profile.bucket_minutes();
            (
                end_idx,
                floor_instant(target, tz, bucket) == floor_instant(now, tz, bucket),
            )
        }
    };

    if same_bucket {
        return Ok(0.0);
    }

    let value = |idx: usize| {
        profile.value(idx).ok_or_else(|| {
            GridwiseError::insufficient_history(format!("profile has no bucket {}", idx))
        })
    };
    let start = value(start_idx)?;
    let end = value(end_idx)?;

    if end_idx > start_idx {
        Ok(end - start)
    } else {
        Ok(end - start + profile.last_value())
    }
}

/// Forecasts consumption from a cached daily load profile
pub struct ConsumptionForecaster {
    plant: Arc<dyn Plant>,
    entity_id: String,
    tz: Tz,
    bucket_minutes: u32,
    reset_epsilon: f64,
    history_days: u32,
    refresh_interval: Duration,
    cutoff: NaiveTime,
    profile: Option<Cached<TimeBucketProfile>>,
    logger: StructuredLogger,
}

impl ConsumptionForecaster {
    pub fn new(
        plant: Arc<dyn Plant>,
        entity_id: impl Into<String>,
        config: &ProfileConfig,
        tz: Tz,
    ) -> Result<Self> {
        check_bucket_minutes(config.bucket_minutes)?;
        Ok(Self {
            plant,
            entity_id: entity_id.into(),
            tz,
            bucket_minutes: config.bucket_minutes,
            reset_epsilon: config.reset_epsilon_kwh,
            history_days: config.history_days,
            refresh_interval: Duration::hours(i64::from(config.refresh_interval_hours)),
            cutoff: config.cutoff()?,
            profile: None,
            logger: get_logger("forecast"),
        })
    }

    /// Currently cached profile, if one has been built
    pub fn profile(&self) -> Option<&TimeBucketProfile> {
        self.profile.as_ref().map(|c| &c.value)
    }

    /// Return the cached profile, rebuilding it first when absent or older
    /// than the refresh interval. The previous profile survives a failed
    /// rebuild.
    pub async fn refresh_if_stale(&mut self, now: DateTime<Utc>) -> Result<&TimeBucketProfile> {
        if needs_refresh(&self.profile, now, self.refresh_interval) {
            let profile = self.build_profile(now).await?;
            self.logger.info(&format!(
                "Load profile rebuilt: {} buckets of {} min, daily total {:.2} kWh",
                profile.len(),
                profile.bucket_minutes(),
                profile.last_value()
            ));
            self.profile = Some(Cached::new(profile, now));
        }
        self.profile
            .as_ref()
            .map(|c| &c.value)
            .ok_or_else(|| GridwiseError::insufficient_history("load profile unavailable"))
    }

    async fn build_profile(&self, now: DateTime<Utc>) -> Result<TimeBucketProfile> {
        let mut builder = ProfileBuilder::new(self.bucket_minutes, self.reset_epsilon, self.tz)?;
        let today = now.with_timezone(&self.tz).date_naive();

        // Oldest day first; today is partial and excluded
        for days_ago in (1..=self.history_days).rev() {
            let date = today - Duration::days(i64::from(days_ago));
            let (start, end) = local_day_range(date, self.tz)?;
            let samples = self.plant.get_history(&self.entity_id, start, end).await?;
            self.logger
                .trace(&format!("{}: {} samples", date, samples.len()));
            builder.add_day(&samples);
        }

        builder.build()
    }

    /// Net expected consumption between `now` and the window's target
    pub async fn forecast(&mut self, now: DateTime<Utc>, window: ForecastWindow) -> Result<f64> {
        let tz = self.tz;
        let profile = self.refresh_if_stale(now).await?;
        forecast_with_profile(profile, now, window, tz)
    }

    /// Energy needed until the next daily cutoff, floored at zero, plus a
    /// safety buffer
    pub async fn required_remaining_energy(
        &mut self,
        now: DateTime<Utc>,
        buffer_kwh: f64,
    ) -> Result<f64> {
        let tz = self.tz;
        let cutoff = self.cutoff;
        let profile = self.refresh_if_stale(now).await?;
        let now_idx = profile.index_of(now.with_timezone(&tz).time());
        let until_cutoff = if now_idx == profile.index_of(cutoff) {
            // Inside the cutoff bucket: the next cutoff is a full day away
            profile.last_value()
        } else {
            forecast_with_profile(profile, now, ForecastWindow::Until(cutoff), tz)?
        };
        Ok(until_cutoff.max(0.0) + buffer_kwh)
    }
}
