use super::rules::{evaluate, target_price};
use super::{DispatchInputs, DispatchState, DispatchThresholds, WorkingMode};
use crate::error::Result;
use crate::logging::{StructuredLogger, get_logger};
use crate::plant::{Plant, PlantRatings};
use std::sync::Arc;

/// Emitted once when the plant's reported control mode changes
#[derive(Debug, Clone, PartialEq)]
pub struct ModeChange {
    pub previous_control_mode: String,
    pub control_mode: String,
    pub working_mode: WorkingMode,
    pub feed_in_price: f64,
}

impl ModeChange {
    /// Notification title and message
    pub fn describe(&self) -> (String, String) {
        let title = match self.working_mode {
            WorkingMode::Dispatching => format!("Dispatching at {} c/kWh", self.feed_in_price),
            WorkingMode::ExportAllSolar => {
                format!("Selling All Solar at {} c/kWh", self.feed_in_price)
            }
            WorkingMode::ExportExcessSolar => {
                format!("Exporting Excess Solar at {} c/kWh", self.feed_in_price)
            }
            WorkingMode::SelfConsumption => {
                format!("Self Consuming at {} c/kWh", self.feed_in_price)
            }
            WorkingMode::Standby => "Standby".to_string(),
        };
        let message = format!(
            "Control mode: {} (was {})",
            self.control_mode, self.previous_control_mode
        );
        (title, message)
    }
}

/// Applies working modes to a plant and tracks the last applied control mode
pub struct DispatchEngine {
    plant: Arc<dyn Plant>,
    ratings: PlantRatings,
    thresholds: DispatchThresholds,
    state: DispatchState,
    last_feed_in_price: f64,
    logger: StructuredLogger,
}

impl DispatchEngine {
    /// Create an engine, seeding the last applied control mode from the plant.
    /// An unreachable plant leaves it unknown until the first application.
    pub async fn new(
        plant: Arc<dyn Plant>,
        ratings: PlantRatings,
        thresholds: DispatchThresholds,
    ) -> Self {
        let logger = get_logger("dispatch");
        let current = match plant.get_current_mode().await {
            Ok(mode) => Some(mode),
            Err(e) => {
                logger.warn(&format!("Current control mode unavailable: {}", e));
                None
            }
        };
        Self {
            plant,
            ratings,
            thresholds,
            state: DispatchState::new(current),
            last_feed_in_price: 0.0,
            logger,
        }
    }

    pub fn state(&self) -> &DispatchState {
        &self.state
    }

    pub fn thresholds(&self) -> &DispatchThresholds {
        &self.thresholds
    }

    pub fn ratings(&self) -> &PlantRatings {
        &self.ratings
    }

    /// Override the minimum dispatch price, e.g. from a runtime setting
    pub fn set_minimum_dispatch_price(&mut self, price: f64) {
        if price.is_finite()
            && (price - self.thresholds.minimum_dispatch_price).abs() > f64::EPSILON
        {
            self.logger.info(&format!(
                "Minimum dispatch price {} -> {} c/kWh",
                self.thresholds.minimum_dispatch_price, price
            ));
            self.thresholds.minimum_dispatch_price = price;
        }
    }

    /// Recompute the target price and energy balance without applying anything
    pub fn update_values(&mut self, inputs: &DispatchInputs<'_>) -> f64 {
        let target = target_price(
            inputs.feed_in_forecast.descending(),
            inputs.available_energy_kwh,
            inputs.required_energy_kwh,
            self.ratings.max_export_kw,
            &self.thresholds,
        );
        self.state.target_dispatch_price = target;
        self.state.available_energy_kwh = inputs.available_energy_kwh;
        self.state.required_energy_kwh = inputs.required_energy_kwh;
        self.last_feed_in_price = inputs.feed_in_price;
        target
    }

    /// Run one decision tick: select a working mode and apply it
    pub async fn tick(&mut self, inputs: &DispatchInputs<'_>) -> Result<Option<ModeChange>> {
        let target = self.update_values(inputs);
        let mode = evaluate(inputs, target, &self.thresholds);
        self.logger.debug(&format!(
            "feed_in={} target={} available={:.2} required={:.2} -> {}",
            inputs.feed_in_price,
            target,
            inputs.available_energy_kwh,
            inputs.required_energy_kwh,
            mode
        ));
        self.apply(mode).await
    }

    /// Write the mode's limits, then its control mode. Returns a change event
    /// when the plant then reports a control mode different from the last one.
    pub async fn apply(&mut self, mode: WorkingMode) -> Result<Option<ModeChange>> {
        let (control_mode, limits) = mode.plan(&self.ratings);
        self.plant.set_limits(limits).await?;
        self.plant.set_control_mode(control_mode).await?;
        if self.state.working_mode != mode {
            self.logger
                .info(&format!("Working mode {} -> {}", self.state.working_mode, mode));
        }
        self.state.working_mode = mode;

        let reported = self.plant.get_current_mode().await?;
        let previous = match self.state.last_applied_control_mode.replace(reported.clone()) {
            Some(previous) if previous != reported => previous,
            Some(_) => return Ok(None),
            None => {
                self.logger
                    .info(&format!("Control mode seeded: {}", reported));
                return Ok(None);
            }
        };

        let change = ModeChange {
            previous_control_mode: previous,
            control_mode: reported,
            working_mode: mode,
            feed_in_price: self.last_feed_in_price,
        };
        self.logger.info(&format!(
            "Control mode changed: {} -> {}",
            change.previous_control_mode, change.control_mode
        ));
        Ok(Some(change))
    }
}
