//! Outbound side channels: user notifications and published sensors
//!
//! Both sinks are best effort from the controller's point of view. A failed
//! notification or sensor write is logged and never aborts a tick.

use crate::config::{MetricsConfig, NotificationConfig};
use crate::error::Result;
use crate::home_assistant::HomeAssistantClient;
use crate::logging::{StructuredLogger, get_logger};
use serde_json::json;

/// Delivers short human-readable messages
#[async_trait::async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, title: &str, message: &str) -> Result<()>;
}

/// Write-only store of named values
#[async_trait::async_trait]
pub trait MetricsSink: Send + Sync {
    async fn publish_number(&self, name: &str, value: f64, unit: Option<&str>) -> Result<()>;
    async fn publish_text(&self, name: &str, value: &str) -> Result<()>;
}

/// Notifications through a Home Assistant `notify.<target>` service
pub struct HomeAssistantNotifier {
    client: HomeAssistantClient,
    target: String,
    enabled: bool,
    logger: StructuredLogger,
}

impl HomeAssistantNotifier {
    pub fn new(client: HomeAssistantClient, config: &NotificationConfig) -> Self {
        Self {
            client,
            target: config.target.clone(),
            enabled: config.enabled && !config.target.trim().is_empty(),
            logger: get_logger("notify"),
        }
    }
}

#[async_trait::async_trait]
impl NotificationSink for HomeAssistantNotifier {
    async fn notify(&self, title: &str, message: &str) -> Result<()> {
        if !self.enabled {
            self.logger
                .debug(&format!("Notification suppressed: {}: {}", title, message));
            return Ok(());
        }
        self.client
            .send_notification(title, message, &self.target)
            .await
    }
}

/// Entity id of a published sensor, e.g. `sensor.gridwise_feed_in_price`
pub fn sensor_entity_id(prefix: &str, name: &str) -> String {
    let prefix = prefix.trim_end_matches('_');
    if prefix.is_empty() {
        format!("sensor.{}", name)
    } else if prefix.contains('.') {
        format!("{}_{}", prefix, name)
    } else {
        format!("sensor.{}_{}", prefix, name)
    }
}

fn friendly_name(name: &str) -> String {
    name.split('_')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Sensors written through the Home Assistant states endpoint
pub struct HomeAssistantMetrics {
    client: HomeAssistantClient,
    prefix: String,
    enabled: bool,
}

impl HomeAssistantMetrics {
    pub fn new(client: HomeAssistantClient, config: &MetricsConfig) -> Self {
        Self {
            client,
            prefix: config.entity_prefix.clone(),
            enabled: config.enabled,
        }
    }
}

#[async_trait::async_trait]
impl MetricsSink for HomeAssistantMetrics {
    async fn publish_number(&self, name: &str, value: f64, unit: Option<&str>) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let mut attributes = json!({ "friendly_name": friendly_name(name) });
        if let Some(unit) = unit {
            attributes["unit_of_measurement"] = json!(unit);
            attributes["state_class"] = json!("measurement");
        }
        self.client
            .set_state(
                &sensor_entity_id(&self.prefix, name),
                json!(value),
                attributes,
            )
            .await
    }

    async fn publish_text(&self, name: &str, value: &str) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        self.client
            .set_state(
                &sensor_entity_id(&self.prefix, name),
                json!(value),
                json!({ "friendly_name": friendly_name(name) }),
            )
            .await
    }
}

/// Sink that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct Discard;

#[async_trait::async_trait]
impl NotificationSink for Discard {
    async fn notify(&self, _title: &str, _message: &str) -> Result<()> {
        Ok(())
    }
}

#[async_trait::async_trait]
impl MetricsSink for Discard {
    async fn publish_number(&self, _name: &str, _value: f64, _unit: Option<&str>) -> Result<()> {
        Ok(())
    }

    async fn publish_text(&self, _name: &str, _value: &str) -> Result<()> {
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HomeAssistantConfig;

    #[test]
    fn test_sensor_entity_id() {
        assert_eq!(
            sensor_entity_id("sensor.gridwise", "feed_in_price"),
            "sensor.gridwise_feed_in_price"
        );
        assert_eq!(
            sensor_entity_id("gridwise_", "uptime"),
            "sensor.gridwise_uptime"
        );
        assert_eq!(sensor_entity_id("", "uptime"), "sensor.uptime");
    }

    #[test]
    fn test_friendly_name() {
        assert_eq!(friendly_name("kwh_available"), "Kwh Available");
        assert_eq!(friendly_name("working_mode"), "Working Mode");
    }

    #[tokio::test]
    async fn test_disabled_sinks_do_not_touch_the_network() {
        let ha = HomeAssistantConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            access_token: "token".to_string(),
            ..HomeAssistantConfig::default()
        };
        let client = HomeAssistantClient::new(&ha).unwrap();

        let notifier = HomeAssistantNotifier::new(
            client.clone(),
            &NotificationConfig {
                enabled: false,
                target: "mobile_app_phone".to_string(),
            },
        );
        notifier.notify("title", "message").await.unwrap();

        let metrics = HomeAssistantMetrics::new(
            client,
            &MetricsConfig {
                enabled: false,
                entity_prefix: "sensor.gridwise".to_string(),
            },
        );
        metrics.publish_number("uptime", 1.0, Some("s")).await.unwrap();
        metrics.publish_text("working_mode", "Dispatching").await.unwrap();
    }

    #[tokio::test]
    async fn test_discard() {
        Discard.notify("a", "b").await.unwrap();
        MetricsSink::publish_number(&Discard, "x", 1.0, None)
            .await
            .unwrap();
    }
}
