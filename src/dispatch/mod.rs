//! Dispatch decisions
//!
//! Each decision tick turns prices and the forecast energy balance into one of
//! five working modes. A working mode maps to a fixed control mode and set of
//! power limits, which the [`DispatchEngine`] writes to the plant.

pub mod effective_price;
pub mod engine;
pub mod rules;

pub use effective_price::{EffectivePriceInputs, effective_price};
pub use engine::{DispatchEngine, ModeChange};
pub use rules::{evaluate, target_price};

use crate::config::DispatchConfig;
use crate::plant::{ControlMode, PlantRatings, PowerLimits};
use crate::pricing::PriceForecastSet;
use serde::Serialize;
use std::fmt;

/// Operating strategy selected by a decision tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum WorkingMode {
    Standby,
    SelfConsumption,
    ExportExcessSolar,
    ExportAllSolar,
    Dispatching,
}

impl WorkingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkingMode::Standby => "Standby",
            WorkingMode::SelfConsumption => "Self Consumption",
            WorkingMode::ExportExcessSolar => "Exporting Excess Solar",
            WorkingMode::ExportAllSolar => "Exporting All Solar",
            WorkingMode::Dispatching => "Dispatching",
        }
    }

    /// Control mode and limits that realise this working mode
    pub fn plan(&self, ratings: &PlantRatings) -> (ControlMode, PowerLimits) {
        let r = ratings;
        match self {
            WorkingMode::Standby => (ControlMode::Standby, PowerLimits::default()),
            WorkingMode::SelfConsumption => (
                ControlMode::MaximumSelfConsumption,
                PowerLimits {
                    discharge_kw: r.max_discharge_kw,
                    charge_kw: r.max_charge_kw,
                    pv_kw: r.max_pv_kw,
                    export_kw: 0.0,
                    import_kw: 0.0,
                },
            ),
            WorkingMode::ExportExcessSolar => (
                ControlMode::MaximumSelfConsumption,
                PowerLimits {
                    discharge_kw: r.max_discharge_kw,
                    charge_kw: r.max_charge_kw,
                    pv_kw: r.max_pv_kw,
                    export_kw: r.max_export_kw,
                    import_kw: 0.0,
                },
            ),
            WorkingMode::ExportAllSolar => (
                ControlMode::CommandDischargingPvFirst,
                PowerLimits {
                    discharge_kw: 0.0,
                    charge_kw: r.max_charge_kw,
                    pv_kw: r.max_pv_kw,
                    export_kw: r.max_export_kw,
                    import_kw: 0.0,
                },
            ),
            WorkingMode::Dispatching => (
                ControlMode::CommandDischargingPvFirst,
                PowerLimits {
                    discharge_kw: r.max_discharge_kw,
                    charge_kw: 0.0,
                    pv_kw: r.max_pv_kw,
                    export_kw: r.max_export_kw,
                    import_kw: 0.0,
                },
            ),
        }
    }
}

impl fmt::Display for WorkingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Price and energy thresholds of the decision rules (prices in c/kWh)
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchThresholds {
    pub good_sell_price: f64,
    pub sanity_ceiling: f64,
    pub minimal_energy_floor_kwh: f64,
    pub target_price_reduction_percent: f64,
    pub minimum_dispatch_price: f64,
    pub solar_export_enabled: bool,
    pub solar_export_margin_kwh: f64,
    pub solar_export_min_price: f64,
}

impl From<&DispatchConfig> for DispatchThresholds {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            good_sell_price: config.good_sell_price,
            sanity_ceiling: config.sanity_ceiling,
            minimal_energy_floor_kwh: config.minimal_energy_floor_kwh,
            target_price_reduction_percent: config.target_price_reduction_percent,
            minimum_dispatch_price: config.minimum_dispatch_price,
            solar_export_enabled: config.solar_export.enabled,
            solar_export_margin_kwh: config.solar_export.margin_kwh,
            solar_export_min_price: config.solar_export.min_price,
        }
    }
}

impl Default for DispatchThresholds {
    fn default() -> Self {
        Self::from(&DispatchConfig::default())
    }
}

/// Fresh inputs of one decision tick
#[derive(Debug, Clone, Copy)]
pub struct DispatchInputs<'a> {
    pub feed_in_price: f64,
    pub feed_in_forecast: &'a PriceForecastSet,
    pub available_energy_kwh: f64,
    pub required_energy_kwh: f64,
    pub solar_remaining_kwh: Option<f64>,
    pub solar_daytime: Option<bool>,
}

/// Outcome of the latest decision tick
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchState {
    pub working_mode: WorkingMode,
    /// Control mode the plant last reported, unknown until first read
    pub last_applied_control_mode: Option<String>,
    pub target_dispatch_price: f64,
    pub required_energy_kwh: f64,
    pub available_energy_kwh: f64,
}

impl DispatchState {
    pub fn new(last_applied_control_mode: Option<String>) -> Self {
        Self {
            working_mode: WorkingMode::SelfConsumption,
            last_applied_control_mode,
            target_dispatch_price: 0.0,
            required_energy_kwh: 0.0,
            available_energy_kwh: 0.0,
        }
    }
}
