//! Battery/solar plant abstraction
//!
//! The [`Plant`] trait is everything the forecasting and dispatch code needs
//! from the installation: numeric telemetry, sensor history, the five power
//! limits and the remote EMS control mode. [`HomeAssistantPlant`] implements
//! it against entities exposed by the inverter integration.

use crate::config::{PlantConfig, PlantEntities};
use crate::error::{GridwiseError, Result};
use crate::home_assistant::HomeAssistantClient;
use crate::logging::{StructuredLogger, get_logger};
use crate::profile::Sample;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Remote EMS control modes accepted by the inverter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControlMode {
    Standby,
    MaximumSelfConsumption,
    CommandChargingPvFirst,
    CommandChargingGridFirst,
    CommandDischargingPvFirst,
    CommandDischargingEssFirst,
}

impl ControlMode {
    pub const ALL: [ControlMode; 6] = [
        ControlMode::Standby,
        ControlMode::MaximumSelfConsumption,
        ControlMode::CommandChargingPvFirst,
        ControlMode::CommandChargingGridFirst,
        ControlMode::CommandDischargingPvFirst,
        ControlMode::CommandDischargingEssFirst,
    ];

    /// Option label as the select entity spells it
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlMode::Standby => "Standby",
            ControlMode::MaximumSelfConsumption => "Maximum Self Consumption",
            ControlMode::CommandChargingPvFirst => "Command Charging (PV First)",
            ControlMode::CommandChargingGridFirst => "Command Charging (Grid First)",
            ControlMode::CommandDischargingPvFirst => "Command Discharging (PV First)",
            ControlMode::CommandDischargingEssFirst => "Command Discharging (ESS First)",
        }
    }
}

impl fmt::Display for ControlMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ControlMode {
    type Err = GridwiseError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        ControlMode::ALL
            .into_iter()
            .find(|m| m.as_str() == trimmed)
            .ok_or_else(|| GridwiseError::invalid_mode(trimmed))
    }
}

/// The five plant power limits, in kW
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PowerLimits {
    pub discharge_kw: f64,
    pub charge_kw: f64,
    pub pv_kw: f64,
    pub export_kw: f64,
    pub import_kw: f64,
}

/// Maximum ratings of the installation, in kW
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlantRatings {
    pub max_discharge_kw: f64,
    pub max_charge_kw: f64,
    pub max_pv_kw: f64,
    pub max_export_kw: f64,
    pub max_import_kw: f64,
}

impl From<&PlantConfig> for PlantRatings {
    fn from(config: &PlantConfig) -> Self {
        Self {
            max_discharge_kw: config.max_discharge_power_kw,
            max_charge_kw: config.max_charge_power_kw,
            max_pv_kw: config.max_pv_power_kw,
            max_export_kw: config.max_export_power_kw,
            max_import_kw: config.max_import_power_kw,
        }
    }
}

/// Telemetry and control surface of a plant
#[async_trait::async_trait]
pub trait Plant: Send + Sync {
    /// Current numeric state of an entity
    async fn get_numeric(&self, entity_id: &str) -> Result<f64>;

    /// Current raw state of an entity
    async fn get_text(&self, entity_id: &str) -> Result<String>;

    /// Recorded samples in `[start, end)`, oldest first
    async fn get_history(
        &self,
        entity_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Sample>>;

    /// Write all five power limits
    async fn set_limits(&self, limits: PowerLimits) -> Result<()>;

    /// Select the remote EMS control mode
    async fn set_control_mode(&self, mode: ControlMode) -> Result<()>;

    /// Control mode the plant currently reports
    async fn get_current_mode(&self) -> Result<String>;

    /// Select a control mode by its label; unknown labels fail with
    /// `InvalidMode` before anything is written
    async fn set_control_mode_named(&self, name: &str) -> Result<()> {
        let mode = ControlMode::from_str(name)?;
        self.set_control_mode(mode).await
    }
}

/// One reading of the plant's energy state
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct PlantSnapshot {
    pub rated_capacity_kwh: f64,
    pub backup_soc_percent: f64,
    /// Energy the battery can still discharge
    pub discharge_capacity_kwh: f64,
    /// Energy the battery can still absorb
    pub charge_headroom_kwh: f64,
    /// Positive while discharging
    pub battery_power_kw: f64,
    pub pv_power_kw: f64,
    /// Remaining solar forecast for today, when the forecast sensor is available
    pub solar_remaining_kwh: Option<f64>,
}

impl PlantSnapshot {
    /// Read every field from the plant
    pub async fn read(plant: &dyn Plant, entities: &PlantEntities) -> Result<Self> {
        Ok(Self {
            rated_capacity_kwh: plant.get_numeric(&entities.rated_capacity).await?,
            backup_soc_percent: plant.get_numeric(&entities.backup_soc).await?,
            discharge_capacity_kwh: plant.get_numeric(&entities.discharge_capacity).await?,
            charge_headroom_kwh: plant.get_numeric(&entities.charge_capacity).await?,
            battery_power_kw: plant.get_numeric(&entities.battery_power).await?,
            pv_power_kw: plant.get_numeric(&entities.pv_power).await?,
            solar_remaining_kwh: plant
                .get_numeric(&entities.solar_forecast_remaining)
                .await
                .ok(),
        })
    }

    /// Energy reserved by the backup state of charge
    pub fn backup_kwh(&self) -> f64 {
        self.backup_soc_percent / 100.0 * self.rated_capacity_kwh
    }

    /// Stored energy available above the backup reserve
    pub fn stored_available_kwh(&self) -> f64 {
        self.discharge_capacity_kwh - self.backup_kwh()
    }

    /// Hours until full at the current charge rate, 0 when not charging
    pub fn hours_until_full(&self) -> f64 {
        if self.battery_power_kw < 0.0 {
            round2(self.charge_headroom_kwh / self.battery_power_kw.abs())
        } else {
            0.0
        }
    }

    /// Hours until the backup reserve at the current discharge rate, 0 when
    /// not discharging
    pub fn hours_until_empty(&self) -> f64 {
        if self.battery_power_kw > 0.0 {
            round2(self.stored_available_kwh() / self.battery_power_kw)
        } else {
            0.0
        }
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// [`Plant`] backed by Home Assistant entities
pub struct HomeAssistantPlant {
    client: HomeAssistantClient,
    entities: PlantEntities,
    logger: StructuredLogger,
}

impl HomeAssistantPlant {
    pub fn new(client: HomeAssistantClient, entities: PlantEntities) -> Self {
        Self {
            client,
            entities,
            logger: get_logger("plant"),
        }
    }
}

#[async_trait::async_trait]
impl Plant for HomeAssistantPlant {
    async fn get_numeric(&self, entity_id: &str) -> Result<f64> {
        self.client.get_numeric_state(entity_id).await
    }

    async fn get_text(&self, entity_id: &str) -> Result<String> {
        Ok(self.client.get_state(entity_id).await?.state)
    }

    async fn get_history(
        &self,
        entity_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Sample>> {
        self.client.get_history(entity_id, start, end).await
    }

    async fn set_limits(&self, limits: PowerLimits) -> Result<()> {
        let writes = [
            (&self.entities.discharge_limit, limits.discharge_kw),
            (&self.entities.charge_limit, limits.charge_kw),
            (&self.entities.pv_limit, limits.pv_kw),
            (&self.entities.export_limit, limits.export_kw),
            (&self.entities.import_limit, limits.import_kw),
        ];
        for (entity_id, value) in writes {
            self.client.set_number(entity_id, value).await?;
        }
        self.logger.debug(&format!(
            "Limits set: discharge={} charge={} pv={} export={} import={}",
            limits.discharge_kw, limits.charge_kw, limits.pv_kw, limits.export_kw, limits.import_kw
        ));
        Ok(())
    }

    async fn set_control_mode(&self, mode: ControlMode) -> Result<()> {
        self.client
            .set_select(&self.entities.control_mode, mode.as_str())
            .await
    }

    async fn get_current_mode(&self) -> Result<String> {
        self.get_text(&self.entities.control_mode).await
    }
}
