use super::PriceFeed;
use super::types::{AmberInterval, ChannelType, CurrentPrices, PriceForecastSet};
use crate::config::AmberConfig;
use crate::error::{GridwiseError, Result};
use crate::logging::{StructuredLogger, get_logger};
use reqwest::header::{ACCEPT, HeaderMap};
use reqwest::{Client, StatusCode};
use std::sync::Mutex;
use std::time::Duration;

/// Amber Electric API client
pub struct AmberClient {
    base_url: String,
    access_token: String,
    site_id: String,
    client: Client,
    default_wait_secs: u64,
    max_retries: u32,
    rate_limit_remaining: Mutex<Option<u32>>,
    logger: StructuredLogger,
}

/// Window length in seconds from a `RateLimit-Policy` header such as `50;w=300`
pub fn parse_rate_limit_policy(policy: &str) -> Option<u64> {
    policy
        .split(',')
        .next()?
        .split(';')
        .skip(1)
        .find_map(|param| {
            let (key, value) = param.trim().split_once('=')?;
            if key.trim() == "w" {
                value.trim().parse::<u64>().ok()
            } else {
                None
            }
        })
}

fn header_u32(headers: &HeaderMap, name: &str) -> Option<u32> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u32>().ok())
}

/// Current general and feed-in prices from one `prices/current` response
pub fn current_from_intervals(intervals: &[AmberInterval]) -> Result<CurrentPrices> {
    let find = |channel: ChannelType| intervals.iter().find(|i| i.channel_type == channel);
    let (Some(general), Some(feed_in)) = (find(ChannelType::General), find(ChannelType::FeedIn))
    else {
        return Err(GridwiseError::api(
            "Amber response lacks a general or feed-in price",
        ));
    };
    Ok(CurrentPrices::new(
        general.customer_price(),
        feed_in.customer_price(),
        general.estimate || feed_in.estimate,
    ))
}

/// Split a forecast response into `(general, feed_in)` sets
pub fn forecasts_from_intervals(
    intervals: &[AmberInterval],
) -> (PriceForecastSet, PriceForecastSet) {
    let channel = |channel: ChannelType| {
        intervals
            .iter()
            .filter(|i| i.channel_type == channel)
            .map(AmberInterval::to_interval)
            .collect::<Vec<_>>()
    };
    (
        PriceForecastSet::new(channel(ChannelType::General)),
        PriceForecastSet::new(channel(ChannelType::FeedIn)),
    )
}

impl AmberClient {
    pub fn new(config: &AmberConfig) -> Result<Self> {
        if config.access_token.trim().is_empty() {
            return Err(GridwiseError::auth("Amber access token is empty"));
        }
        if config.site_id.trim().is_empty() {
            return Err(GridwiseError::config("Amber site id is empty"));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            access_token: config.access_token.trim().to_string(),
            site_id: config.site_id.trim().to_string(),
            client,
            default_wait_secs: config.rate_limit_default_wait_secs,
            max_retries: config.max_rate_limit_retries,
            rate_limit_remaining: Mutex::new(None),
            logger: get_logger("amber"),
        })
    }

    fn record_remaining(&self, headers: &HeaderMap) {
        if let Some(remaining) = header_u32(headers, "RateLimit-Remaining")
            && let Ok(mut guard) = self.rate_limit_remaining.lock()
        {
            *guard = Some(remaining);
        }
    }

    /// GET `prices/current`, waiting out rate limits
    async fn get_prices(&self, query: &[(&str, String)]) -> Result<Vec<AmberInterval>> {
        let url = format!("{}/sites/{}/prices/current", self.base_url, self.site_id);
        let mut attempt = 0;
        loop {
            let response = self
                .client
                .get(&url)
                .bearer_auth(&self.access_token)
                .header(ACCEPT, "application/json")
                .query(query)
                .send()
                .await?;
            self.record_remaining(response.headers());

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS {
                let policy = response
                    .headers()
                    .get("RateLimit-Policy")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                let wait = policy
                    .as_deref()
                    .and_then(parse_rate_limit_policy)
                    .unwrap_or(self.default_wait_secs);
                if attempt >= self.max_retries {
                    return Err(GridwiseError::rate_limited(wait));
                }
                attempt += 1;
                self.logger.warn(&format!(
                    "Rate limited (policy {}), waiting {}s before retry {}/{}",
                    policy.as_deref().unwrap_or("n/a"),
                    wait,
                    attempt,
                    self.max_retries
                ));
                tokio::time::sleep(Duration::from_secs(wait)).await;
                continue;
            }

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(match status {
                    StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                        GridwiseError::auth(format!("Amber rejected token: {}", body))
                    }
                    s if s.is_server_error() => {
                        GridwiseError::network(format!("Amber API {}: {}", s, body))
                    }
                    s => GridwiseError::api(format!("Amber API {}: {}", s, body)),
                });
            }

            return Ok(response.json::<Vec<AmberInterval>>().await?);
        }
    }
}

#[async_trait::async_trait]
impl PriceFeed for AmberClient {
    async fn current_prices(&self) -> Result<CurrentPrices> {
        let intervals = self.get_prices(&[]).await?;
        let prices = current_from_intervals(&intervals)?;
        self.logger.debug(&format!(
            "Current prices: general={} feed_in={} estimated={}",
            prices.general, prices.feed_in, prices.estimated
        ));
        Ok(prices)
    }

    async fn forecast(
        &self,
        intervals: u32,
        resolution_minutes: u32,
    ) -> Result<(PriceForecastSet, PriceForecastSet)> {
        if resolution_minutes != 5 && resolution_minutes != 30 {
            return Err(GridwiseError::invalid_configuration(format!(
                "resolution must be 5 or 30 minutes, not {}",
                resolution_minutes
            )));
        }
        let raw = self
            .get_prices(&[
                ("next", intervals.to_string()),
                ("previous", "0".to_string()),
                ("resolution", resolution_minutes.to_string()),
            ])
            .await?;
        let (general, feed_in) = forecasts_from_intervals(&raw);
        self.logger.debug(&format!(
            "Forecast: {} general, {} feed-in intervals, max feed-in {:?}",
            general.len(),
            feed_in.len(),
            feed_in.max_price()
        ));
        Ok((general, feed_in))
    }

    fn rate_limit_remaining(&self) -> Option<u32> {
        self.rate_limit_remaining.lock().ok().and_then(|g| *g)
    }
}
