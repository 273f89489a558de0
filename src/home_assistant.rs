//! Home Assistant REST API client
//!
//! Thin wrapper over `/api/states`, `/api/history/period` and
//! `/api/services`. Plant telemetry, plant control, notifications and sensor
//! publishing all go through this client.

use crate::config::HomeAssistantConfig;
use crate::error::{GridwiseError, Result};
use crate::logging::{StructuredLogger, get_logger};
use crate::profile::Sample;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;

/// Current state of one entity
#[derive(Debug, Clone, Deserialize)]
pub struct EntityState {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: Value,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

impl EntityState {
    /// State parsed as a number; `unavailable`/`unknown` yield `None`
    pub fn numeric(&self) -> Option<f64> {
        self.state.trim().parse::<f64>().ok().filter(|v| v.is_finite())
    }
}

#[derive(Debug, Deserialize)]
struct HistoryState {
    state: String,
    #[serde(default)]
    last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    last_changed: Option<DateTime<Utc>>,
}

/// Convert a history response into samples. Unparsable states become absent
/// samples; entries without any timestamp are skipped.
fn parse_history(body: Vec<Vec<HistoryState>>) -> Vec<Sample> {
    let Some(states) = body.into_iter().next() else {
        return Vec::new();
    };
    let mut samples: Vec<Sample> = states
        .into_iter()
        .filter_map(|s| {
            let timestamp = s.last_updated.or(s.last_changed)?;
            Some(match s.state.trim().parse::<f64>() {
                Ok(v) if v.is_finite() => Sample::new(v, timestamp),
                _ => Sample::absent(timestamp),
            })
        })
        .collect();
    samples.sort_by_key(|s| s.timestamp);
    samples
}

/// Home Assistant REST client
#[derive(Clone)]
pub struct HomeAssistantClient {
    base_url: String,
    token: String,
    client: Client,
    max_retries: u32,
    retry_delay: Duration,
    logger: StructuredLogger,
}

impl HomeAssistantClient {
    pub fn new(config: &HomeAssistantConfig) -> Result<Self> {
        if config.access_token.trim().is_empty() {
            return Err(GridwiseError::auth("Home Assistant access token is empty"));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .build()?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.access_token.trim().to_string(),
            client,
            max_retries: 2,
            retry_delay: Duration::from_millis(500),
            logger: get_logger("home_assistant"),
        })
    }

    /// Get the state of a specific entity
    pub async fn get_state(&self, entity_id: &str) -> Result<EntityState> {
        let url = format!("{}/api/states/{}", self.base_url, entity_id);
        let response = self
            .send_with_retry(|| self.client.get(&url).bearer_auth(&self.token))
            .await?;
        let response = check_status(response, entity_id).await?;
        Ok(response.json::<EntityState>().await?)
    }

    /// State of an entity as a number
    pub async fn get_numeric_state(&self, entity_id: &str) -> Result<f64> {
        let state = self.get_state(entity_id).await?;
        state.numeric().ok_or_else(|| {
            GridwiseError::api(format!(
                "{} has non-numeric state '{}'",
                entity_id, state.state
            ))
        })
    }

    /// Recorded states of an entity in `[start, end)`, oldest first
    pub async fn get_history(
        &self,
        entity_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Sample>> {
        let url = format!(
            "{}/api/history/period/{}",
            self.base_url,
            start.to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        let end_time = end.to_rfc3339_opts(SecondsFormat::Secs, true);
        let response = self
            .send_with_retry(|| {
                self.client
                    .get(&url)
                    .bearer_auth(&self.token)
                    .query(&[
                        ("filter_entity_id", entity_id),
                        ("end_time", end_time.as_str()),
                        ("no_attributes", "true"),
                    ])
            })
            .await?;
        let response = check_status(response, entity_id).await?;
        let body: Vec<Vec<HistoryState>> = response.json().await?;
        let samples: Vec<Sample> = parse_history(body)
            .into_iter()
            .filter(|s| s.timestamp < end)
            .collect();
        self.logger.debug(&format!(
            "History {} [{} .. {}): {} samples",
            entity_id,
            start,
            end,
            samples.len()
        ));
        Ok(samples)
    }

    /// Call a service such as `number.set_value`
    pub async fn call_service(&self, domain: &str, service: &str, data: Value) -> Result<()> {
        if domain.is_empty() || service.is_empty() || domain.contains('/') || service.contains('/') {
            return Err(GridwiseError::invalid_configuration(format!(
                "invalid service '{}.{}'",
                domain, service
            )));
        }
        let url = format!("{}/api/services/{}/{}", self.base_url, domain, service);
        self.logger
            .debug(&format!("Calling {}.{} with {}", domain, service, data));
        let response = self
            .send_with_retry(|| self.client.post(&url).bearer_auth(&self.token).json(&data))
            .await?;
        check_status(response, &format!("{}.{}", domain, service)).await?;
        Ok(())
    }

    pub async fn set_number(&self, entity_id: &str, value: f64) -> Result<()> {
        self.call_service(
            "number",
            "set_value",
            json!({ "entity_id": entity_id, "value": value }),
        )
        .await
    }

    pub async fn set_select(&self, entity_id: &str, option: &str) -> Result<()> {
        self.call_service(
            "select",
            "select_option",
            json!({ "entity_id": entity_id, "option": option }),
        )
        .await
    }

    /// Send a notification through `notify.<target>`
    pub async fn send_notification(&self, title: &str, message: &str, target: &str) -> Result<()> {
        self.call_service(
            "notify",
            target,
            json!({ "title": title, "message": message }),
        )
        .await
    }

    /// Create or overwrite an entity's state
    pub async fn set_state(&self, entity_id: &str, state: Value, attributes: Value) -> Result<()> {
        let url = format!("{}/api/states/{}", self.base_url, entity_id);
        let body = json!({ "state": state, "attributes": attributes });
        let response = self
            .send_with_retry(|| self.client.post(&url).bearer_auth(&self.token).json(&body))
            .await?;
        check_status(response, entity_id).await?;
        Ok(())
    }

    /// Retry connection failures with exponential backoff; HTTP errors are
    /// returned to the caller untouched
    async fn send_with_retry<F>(&self, build: F) -> Result<Response>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0;
        let mut delay = self.retry_delay;
        loop {
            match build().send().await {
                Ok(response) => return Ok(response),
                Err(e) if attempt < self.max_retries && (e.is_connect() || e.is_timeout()) => {
                    attempt += 1;
                    self.logger.warn(&format!(
                        "Request failed (attempt {}/{}): {}",
                        attempt, self.max_retries, e
                    ));
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

async fn check_status(response: Response, what: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            GridwiseError::auth(format!("Home Assistant rejected token for {}", what))
        }
        StatusCode::NOT_FOUND => GridwiseError::api(format!("{} not found", what)),
        s if s.is_server_error() => {
            GridwiseError::network(format!("Home Assistant {} for {}: {}", s, what, body))
        }
        s => GridwiseError::api(format!("Home Assistant {} for {}: {}", s, what, body)),
    })
}
