//! Electricity price feed
//!
//! [`PriceFeed`] is what the controller needs from the market: current
//! general and feed-in prices and a short forecast of both. [`AmberClient`]
//! implements it against the Amber Electric REST API.

pub mod client;
pub mod types;

pub use client::AmberClient;
pub use types::{CurrentPrices, PriceForecastSet, PriceInterval, PriceSnapshot};

use crate::error::Result;

/// Source of current and forecast prices. Implementations retry rate-limited
/// requests themselves.
#[async_trait::async_trait]
pub trait PriceFeed: Send + Sync {
    /// Prices of the interval in progress
    async fn current_prices(&self) -> Result<CurrentPrices>;

    /// `(general, feed_in)` forecasts over the next `intervals` intervals of
    /// `resolution_minutes` each
    async fn forecast(
        &self,
        intervals: u32,
        resolution_minutes: u32,
    ) -> Result<(PriceForecastSet, PriceForecastSet)>;

    /// Requests left in the current rate-limit window, when known
    fn rate_limit_remaining(&self) -> Option<u32> {
        None
    }
}

/// Fetch a full snapshot, or only current prices on top of `previous`
pub async fn fetch_snapshot(
    feed: &dyn PriceFeed,
    intervals: u32,
    resolution_minutes: u32,
    previous: Option<&PriceSnapshot>,
) -> Result<PriceSnapshot> {
    let current = feed.current_prices().await?;
    if let Some(previous) = previous {
        return Ok(previous.with_current(current));
    }
    let (general_forecast, feed_in_forecast) = feed.forecast(intervals, resolution_minutes).await?;
    Ok(PriceSnapshot {
        current,
        general_forecast,
        feed_in_forecast,
    })
}
