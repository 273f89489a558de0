//! Configuration management for Gridwise
//!
//! This module handles loading, validation, and management of the application
//! configuration from YAML files, with environment variable overrides for the
//! API secrets.

use crate::error::{GridwiseError, Result};
use chrono::NaiveTime;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::Path;

mod defaults;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Home Assistant REST API connection
    pub home_assistant: HomeAssistantConfig,

    /// Amber Electric price API
    pub amber: AmberConfig,

    /// Plant ratings and entity mapping
    pub plant: PlantConfig,

    /// Daily load profile construction
    pub profile: ProfileConfig,

    /// Base load estimation
    pub base_load: BaseLoadConfig,

    /// Dispatch decision thresholds
    pub dispatch: DispatchConfig,

    /// Mode change notifications
    pub notifications: NotificationConfig,

    /// Sensor publishing
    pub metrics: MetricsConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Main loop period in milliseconds
    pub poll_interval_ms: u64,

    /// Fixed backoff after an upstream failure, in seconds
    pub error_backoff_secs: u64,

    /// IANA timezone of the site; local midnight resets the daily counters
    pub timezone: String,
}

/// Home Assistant connection parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HomeAssistantConfig {
    /// Base URL, e.g. `http://homeassistant.local:8123`
    pub base_url: String,

    /// Long-lived access token
    pub access_token: String,

    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,

    /// `input_select` whose state must be "On" for automatic control
    pub automatic_control_entity: Option<String>,

    /// Number entity overriding the minimum dispatch price at runtime
    pub min_dispatch_price_entity: Option<String>,
}

/// Amber Electric price API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AmberConfig {
    /// API base URL
    pub base_url: String,

    /// API access token
    pub access_token: String,

    /// Site identifier
    pub site_id: String,

    /// Number of forecast intervals to request
    pub forecast_intervals: u32,

    /// Forecast resolution in minutes (5 or 30)
    pub resolution_minutes: u32,

    /// Wait used on HTTP 429 when no `RateLimit-Policy` header is present
    pub rate_limit_default_wait_secs: u64,

    /// Retries on HTTP 429 before surfacing a rate-limit error
    pub max_rate_limit_retries: u32,

    /// Length of a price interval in seconds
    pub price_interval_secs: u64,

    /// Delay after an interval boundary before the actual price is published
    pub real_price_offset_secs: u64,

    /// Re-poll delay while the current price is still an estimate
    pub estimate_retry_secs: u64,
}

/// Plant ratings and Home Assistant entity mapping
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlantConfig {
    /// Maximum battery discharge power (kW)
    pub max_discharge_power_kw: f64,

    /// Maximum battery charge power (kW)
    pub max_charge_power_kw: f64,

    /// Maximum PV power (kW)
    pub max_pv_power_kw: f64,

    /// Maximum grid export power (kW)
    pub max_export_power_kw: f64,

    /// Maximum grid import power (kW)
    pub max_import_power_kw: f64,

    /// Entity ids
    pub entities: PlantEntities,
}

/// Entity ids used to read telemetry and write limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlantEntities {
    pub rated_capacity: String,
    pub backup_soc: String,
    pub discharge_capacity: String,
    pub charge_capacity: String,
    pub battery_power: String,
    pub pv_power: String,
    pub load_power: String,
    pub grid_export_power: String,
    pub solar_forecast_remaining: String,
    /// Daily cumulative load counter that resets at local midnight
    pub daily_load_consumption: String,
    pub control_mode: String,
    pub discharge_limit: String,
    pub charge_limit: String,
    pub pv_limit: String,
    pub export_limit: String,
    pub import_limit: String,
}

/// Load profile configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileConfig {
    /// Bucket width in minutes; must divide 1440
    pub bucket_minutes: u32,

    /// Number of full prior days sampled
    pub history_days: u32,

    /// Profile lifetime before a rebuild, in hours
    pub refresh_interval_hours: u32,

    /// Leading samples above this value belong to the previous day
    pub reset_epsilon_kwh: f64,

    /// Daily cutoff (HH:MM) up to which the remaining requirement is forecast
    pub cutoff_time: String,

    /// Safety buffer added to the remaining requirement (kWh)
    pub buffer_kwh: f64,
}

/// Base load estimation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BaseLoadConfig {
    /// Percentile (0..=100) of load power taken as the sustained minimum
    pub percentile: f64,

    /// Trailing window in days
    pub window_days: u32,

    /// Estimate lifetime in hours
    pub ttl_hours: u32,
}

/// Dispatch decision thresholds (prices in c/kWh)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Feed-in price at which the battery is run down regardless of target
    pub good_sell_price: f64,

    /// Prices at or above this are treated as bad data
    pub sanity_ceiling: f64,

    /// Energy that must remain available for the good-price override (kWh)
    pub minimal_energy_floor_kwh: f64,

    /// Percentage of the ideal sell price accepted as the dispatch target
    pub target_price_reduction_percent: f64,

    /// Lower bound for the dispatch target price
    pub minimum_dispatch_price: f64,

    /// Surplus solar export rule
    pub solar_export: SolarExportConfig,

    /// Effective price publication
    pub effective_price: EffectivePriceConfig,
}

/// Surplus solar export rule
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SolarExportConfig {
    /// Whether the rule is evaluated at all
    pub enabled: bool,

    /// Energy surplus over the requirement needed to export all solar (kWh)
    pub margin_kwh: f64,

    /// Feed-in price that must be exceeded
    pub min_price: f64,
}

/// Effective price inputs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EffectivePriceConfig {
    /// End of the solar day (HH:MM) used to size absorbable solar
    pub solar_horizon_time: String,

    /// Forecast solar held back as uncertainty before counting it available
    pub solar_reserve_kwh: f64,
}

/// Notification configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Whether notifications are sent
    pub enabled: bool,

    /// Home Assistant notify service, e.g. `mobile_app_phone`
    pub target: String,
}

/// Sensor publishing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether sensors are published
    pub enabled: bool,

    /// Entity id prefix, e.g. `sensor.gridwise`
    pub entity_prefix: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    pub level: String,

    /// Optional console level override
    pub console_level: Option<String>,

    /// Optional file level override
    pub file_level: Option<String>,

    /// Path to log file
    pub file: String,

    /// Number of rotated files to keep
    pub backup_count: u32,

    /// Whether to log to console
    pub console_output: bool,

    /// Whether to use JSON format
    pub json_format: bool,
}

fn parse_hhmm(field: &str, value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value, "%H:%M")
        .map_err(|e| GridwiseError::validation(field, format!("'{}': {}", value, e).as_str()))
}

impl ProfileConfig {
    /// Daily cutoff as a time of day
    pub fn cutoff(&self) -> Result<NaiveTime> {
        parse_hhmm("profile.cutoff_time", &self.cutoff_time)
    }
}

impl EffectivePriceConfig {
    /// End of the solar day as a time of day
    pub fn solar_horizon(&self) -> Result<NaiveTime> {
        parse_hhmm(
            "dispatch.effective_price.solar_horizon_time",
            &self.solar_horizon_time,
        )
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the first default location that exists,
    /// then apply environment overrides
    pub fn load() -> Result<Self> {
        let default_paths = [
            "gridwise_config.yaml",
            "/data/gridwise_config.yaml",
            "/etc/gridwise/config.yaml",
        ];

        let mut config = default_paths
            .iter()
            .find(|p| Path::new(p).exists())
            .map_or_else(|| Ok(Config::default()), Self::from_file)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Override secrets from `GRIDWISE_*` environment variables
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides<F: Fn(&str) -> Option<String>>(&mut self, lookup: F) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(v) = non_empty("GRIDWISE_HA_URL") {
            self.home_assistant.base_url = v;
        }
        if let Some(v) = non_empty("GRIDWISE_HA_TOKEN") {
            self.home_assistant.access_token = v;
        }
        if let Some(v) = non_empty("GRIDWISE_AMBER_TOKEN") {
            self.amber.access_token = v;
        }
        if let Some(v) = non_empty("GRIDWISE_AMBER_SITE_ID") {
            self.amber.site_id = v;
        }
    }

    /// Save configuration to a YAML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Parsed site timezone
    pub fn tz(&self) -> Result<Tz> {
        self.timezone
            .parse::<Tz>()
            .map_err(|e| GridwiseError::validation("timezone", e.to_string().as_str()))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.home_assistant.base_url.trim().is_empty() {
            return Err(GridwiseError::validation(
                "home_assistant.base_url",
                "URL cannot be empty",
            ));
        }

        if ![5, 30].contains(&self.amber.resolution_minutes) {
            return Err(GridwiseError::validation(
                "amber.resolution_minutes",
                "Must be 5 or 30",
            ));
        }

        if self.amber.price_interval_secs == 0 {
            return Err(GridwiseError::validation(
                "amber.price_interval_secs",
                "Must be greater than 0",
            ));
        }

        let ratings = [
            ("plant.max_discharge_power_kw", self.plant.max_discharge_power_kw),
            ("plant.max_charge_power_kw", self.plant.max_charge_power_kw),
            ("plant.max_pv_power_kw", self.plant.max_pv_power_kw),
            ("plant.max_export_power_kw", self.plant.max_export_power_kw),
            ("plant.max_import_power_kw", self.plant.max_import_power_kw),
        ];
        for (field, value) in ratings {
            if value < 0.0 || !value.is_finite() {
                return Err(GridwiseError::validation(field, "Must be non-negative"));
            }
        }
        // Target price divides by the export rating
        if self.plant.max_export_power_kw <= 0.0 {
            return Err(GridwiseError::validation(
                "plant.max_export_power_kw",
                "Must be positive",
            ));
        }

        let bucket = self.profile.bucket_minutes;
        if bucket == 0 || 1440 % bucket != 0 {
            return Err(GridwiseError::validation(
                "profile.bucket_minutes",
                "Must divide 1440",
            ));
        }

        if self.profile.history_days == 0 {
            return Err(GridwiseError::validation(
                "profile.history_days",
                "Must be greater than 0",
            ));
        }

        self.profile.cutoff()?;
        self.dispatch.effective_price.solar_horizon()?;

        if !(0.0..=100.0).contains(&self.base_load.percentile) {
            return Err(GridwiseError::validation(
                "base_load.percentile",
                "Must be within 0..=100",
            ));
        }

        if self.base_load.window_days == 0 {
            return Err(GridwiseError::validation(
                "base_load.window_days",
                "Must be greater than 0",
            ));
        }

        if self.dispatch.target_price_reduction_percent <= 0.0 {
            return Err(GridwiseError::validation(
                "dispatch.target_price_reduction_percent",
                "Must be positive",
            ));
        }

        if self.poll_interval_ms == 0 {
            return Err(GridwiseError::validation(
                "poll_interval_ms",
                "Must be greater than 0",
            ));
        }

        self.tz()?;

        Ok(())
    }
}
