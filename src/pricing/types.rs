use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Price over one interval, in c/kWh. Feed-in prices are positive when
/// exporting earns money.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceInterval {
    pub price: f64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Forecast intervals, held both in time order and by descending price.
///
/// Both views are built together at construction and never change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriceForecastSet {
    chronological: Vec<PriceInterval>,
    descending: Vec<PriceInterval>,
}

impl PriceForecastSet {
    pub fn new(mut intervals: Vec<PriceInterval>) -> Self {
        intervals.retain(|i| i.price.is_finite());
        intervals.sort_by_key(|i| i.start);
        let mut descending = intervals.clone();
        // Stable sort keeps earlier intervals first among equal prices
        descending.sort_by(|a, b| b.price.total_cmp(&a.price));
        Self {
            chronological: intervals,
            descending,
        }
    }

    pub fn intervals(&self) -> &[PriceInterval] {
        &self.chronological
    }

    pub fn descending(&self) -> &[PriceInterval] {
        &self.descending
    }

    pub fn max_price(&self) -> Option<f64> {
        self.descending.first().map(|i| i.price)
    }

    pub fn len(&self) -> usize {
        self.chronological.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chronological.is_empty()
    }
}

/// Prices of the current interval, rounded to whole c/kWh
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct CurrentPrices {
    pub general: f64,
    pub feed_in: f64,
    /// The market has not settled this interval's price yet
    pub estimated: bool,
}

impl CurrentPrices {
    pub fn new(general: f64, feed_in: f64, estimated: bool) -> Self {
        Self {
            general: general.round(),
            feed_in: feed_in.round(),
            estimated,
        }
    }
}

/// Everything a decision tick needs from the price feed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriceSnapshot {
    pub current: CurrentPrices,
    pub general_forecast: PriceForecastSet,
    pub feed_in_forecast: PriceForecastSet,
}

impl PriceSnapshot {
    /// Same forecasts with refreshed current prices
    pub fn with_current(&self, current: CurrentPrices) -> Self {
        Self {
            current,
            general_forecast: self.general_forecast.clone(),
            feed_in_forecast: self.feed_in_forecast.clone(),
        }
    }
}

/// Amber channel types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChannelType {
    General,
    FeedIn,
    ControlledLoad,
    #[serde(other)]
    Other,
}

/// One interval as returned by the Amber prices endpoint
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AmberInterval {
    pub channel_type: ChannelType,
    pub per_kwh: f64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default)]
    pub estimate: bool,
}

impl AmberInterval {
    /// Price from the customer's point of view. Amber reports feed-in as a
    /// cost, so its sign is flipped.
    pub fn customer_price(&self) -> f64 {
        match self.channel_type {
            ChannelType::FeedIn => -self.per_kwh,
            _ => self.per_kwh,
        }
    }

    pub fn to_interval(&self) -> PriceInterval {
        PriceInterval {
            price: self.customer_price(),
            start: self.start_time,
            end: self.end_time,
        }
    }
}
