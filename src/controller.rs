//! Main control loop
//!
//! The controller wakes every `poll_interval_ms`. Each wake it may fetch
//! prices and run a decision tick (when the price deadline has passed),
//! refreshes published sensors, and follows the automatic-control switch.
//! Everything runs sequentially in one task.

use crate::base_load::{BaseLoadEstimator, is_solar_daytime};
use crate::config::Config;
use crate::dispatch::{
    DispatchEngine, DispatchInputs, DispatchThresholds, EffectivePriceInputs, ModeChange,
    WorkingMode, effective_price,
};
use crate::error::{GridwiseError, Result};
use crate::forecast::{ConsumptionForecaster, ForecastWindow};
use crate::logging::{StructuredLogger, get_logger};
use crate::notify::{MetricsSink, NotificationSink};
use crate::plant::{Plant, PlantRatings, PlantSnapshot};
use crate::pricing::{PriceFeed, PriceSnapshot, fetch_snapshot};
use chrono::{DateTime, NaiveTime, Timelike, Utc};
use chrono_tz::Tz;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Duration, MissedTickBehavior, interval};

/// State of the automatic-control switch that enables decisions
pub const AUTOMATIC_CONTROL_ON: &str = "On";

/// Instant of the next price fetch: `offset_secs` after the next
/// `interval_secs` boundary of the local wall clock
pub fn next_price_deadline(
    now: DateTime<Utc>,
    tz: Tz,
    interval_secs: u64,
    offset_secs: u64,
) -> DateTime<Utc> {
    let local = now.with_timezone(&tz);
    let into_hour = u64::from(local.minute() * 60 + local.second());
    let wait = interval_secs - into_hour % interval_secs + offset_secs;
    now + chrono::Duration::seconds(wait as i64)
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Fresh plant and forecast values shared by decisions and sensors
struct TickContext {
    plant: PlantSnapshot,
    required_kwh: f64,
    base_load_kw: f64,
}

impl TickContext {
    fn inputs<'a>(&self, prices: &'a PriceSnapshot) -> DispatchInputs<'a> {
        DispatchInputs {
            feed_in_price: prices.current.feed_in,
            feed_in_forecast: &prices.feed_in_forecast,
            available_energy_kwh: self.plant.stored_available_kwh(),
            required_energy_kwh: self.required_kwh,
            solar_remaining_kwh: self.plant.solar_remaining_kwh,
            solar_daytime: Some(is_solar_daytime(self.plant.pv_power_kw, self.base_load_kw)),
        }
    }
}

/// Battery dispatch controller
pub struct Controller {
    config: Config,
    tz: Tz,
    solar_horizon: NaiveTime,
    plant: Arc<dyn Plant>,
    feed: Arc<dyn PriceFeed>,
    notifier: Arc<dyn NotificationSink>,
    metrics: Arc<dyn MetricsSink>,
    engine: DispatchEngine,
    forecaster: ConsumptionForecaster,
    base_load: BaseLoadEstimator,
    prices: Option<PriceSnapshot>,
    next_price_tick: Option<DateTime<Utc>>,
    partial_update: bool,
    automatic_control: bool,
    started_at: Option<DateTime<Utc>>,
    total_polls: u64,
    decision_ticks: u64,
    overrun_count: u64,
    shutdown_tx: mpsc::UnboundedSender<()>,
    shutdown_rx: mpsc::UnboundedReceiver<()>,
    logger: StructuredLogger,
}

impl Controller {
    pub async fn new(
        config: Config,
        plant: Arc<dyn Plant>,
        feed: Arc<dyn PriceFeed>,
        notifier: Arc<dyn NotificationSink>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        let tz = config.tz()?;
        let solar_horizon = config.dispatch.effective_price.solar_horizon()?;
        let engine = DispatchEngine::new(
            plant.clone(),
            PlantRatings::from(&config.plant),
            DispatchThresholds::from(&config.dispatch),
        )
        .await;
        let forecaster = ConsumptionForecaster::new(
            plant.clone(),
            config.plant.entities.daily_load_consumption.clone(),
            &config.profile,
            tz,
        )?;
        let base_load = BaseLoadEstimator::new(
            plant.clone(),
            config.plant.entities.load_power.clone(),
            &config.base_load,
        );
        let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();

        Ok(Self {
            config,
            tz,
            solar_horizon,
            plant,
            feed,
            notifier,
            metrics,
            engine,
            forecaster,
            base_load,
            prices: None,
            next_price_tick: None,
            partial_update: false,
            automatic_control: true,
            started_at: None,
            total_polls: 0,
            decision_ticks: 0,
            overrun_count: 0,
            shutdown_tx,
            shutdown_rx,
            logger: get_logger("controller"),
        })
    }

    /// Sender that stops [`Controller::run`] when sent to
    pub fn shutdown_handle(&self) -> mpsc::UnboundedSender<()> {
        self.shutdown_tx.clone()
    }

    pub fn engine(&self) -> &DispatchEngine {
        &self.engine
    }

    pub fn prices(&self) -> Option<&PriceSnapshot> {
        self.prices.as_ref()
    }

    pub fn next_price_tick(&self) -> Option<DateTime<Utc>> {
        self.next_price_tick
    }

    pub fn automatic_control(&self) -> bool {
        self.automatic_control
    }

    /// Decision ticks run so far
    pub fn decision_ticks(&self) -> u64 {
        self.decision_ticks
    }

    /// Run until a shutdown signal arrives. Transient failures pause the loop
    /// for `error_backoff_secs`; other failures are logged and the loop
    /// carries on at the next wake.
    pub async fn run(&mut self) -> Result<()> {
        if let Err(e) = self.startup_at(Utc::now()).await {
            self.logger.error(&format!("Startup failed: {}", e));
        }

        let mut poll_interval = interval(Duration::from_millis(self.config.poll_interval_ms));
        poll_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = poll_interval.tick() => {
                    let poll_started = std::time::Instant::now();
                    let outcome = self.poll_at(Utc::now()).await;
                    let dur_ms = poll_started.elapsed().as_millis() as u64;
                    if dur_ms > self.config.poll_interval_ms {
                        self.overrun_count = self.overrun_count.saturating_add(1);
                    }
                    if let Err(e) = outcome {
                        self.logger.error(&format!("Poll cycle failed: {}", e));
                        if e.is_transient() && self.backoff().await {
                            self.logger.info("Shutdown signal received");
                            break;
                        }
                    }
                }
                _ = self.shutdown_rx.recv() => {
                    self.logger.info("Shutdown signal received");
                    break;
                }
            }
        }

        self.logger.info(&format!(
            "Controller stopped after {} polls, {} decision ticks ({} overruns)",
            self.total_polls, self.decision_ticks, self.overrun_count
        ));
        Ok(())
    }

    /// Wait out the error backoff; true when shutdown was requested meanwhile
    async fn backoff(&mut self) -> bool {
        let wait = Duration::from_secs(self.config.error_backoff_secs);
        self.logger
            .warn(&format!("Backing off for {}s", wait.as_secs()));
        tokio::select! {
            _ = tokio::time::sleep(wait) => false,
            _ = self.shutdown_rx.recv() => true,
        }
    }

    /// Put the plant into self consumption when automatic control is on
    pub async fn startup_at(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.started_at.get_or_insert(now);
        self.automatic_control = self.automatic_control_on().await?;
        if self.automatic_control {
            self.logger
                .info("Automatic control on at startup, self consuming");
            self.engine.apply(WorkingMode::SelfConsumption).await?;
        } else {
            self.logger.info("Automatic control off at startup");
        }
        Ok(())
    }

    /// One wake of the loop
    pub async fn poll_at(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.started_at.get_or_insert(now);
        self.total_polls = self.total_polls.saturating_add(1);

        self.apply_minimum_price_override().await;
        if self.next_price_tick.is_none_or(|due| now >= due) {
            self.price_tick_at(now).await?;
        }

        self.update_sensors_at(now).await?;
        self.follow_automatic_control_at(now).await?;
        Ok(())
    }

    async fn automatic_control_on(&self) -> Result<bool> {
        match &self.config.home_assistant.automatic_control_entity {
            Some(entity) => Ok(self.plant.get_text(entity).await? == AUTOMATIC_CONTROL_ON),
            None => Ok(true),
        }
    }

    /// Fetch prices and schedule the next fetch. Settled prices also trigger a
    /// decision tick when automatic control is on.
    async fn price_tick_at(&mut self, now: DateTime<Utc>) -> Result<()> {
        let amber = &self.config.amber;
        let previous = if self.partial_update {
            self.prices.as_ref()
        } else {
            None
        };
        let prices = fetch_snapshot(
            self.feed.as_ref(),
            amber.forecast_intervals,
            amber.resolution_minutes,
            previous,
        )
        .await?;
        let estimated = prices.current.estimated;
        self.logger.debug(&format!(
            "Prices: general={} feed_in={} estimated={} partial={}",
            prices.current.general, prices.current.feed_in, estimated, self.partial_update
        ));
        self.prices = Some(prices);

        if estimated {
            self.partial_update = true;
            self.next_price_tick =
                Some(now + chrono::Duration::seconds(amber.estimate_retry_secs as i64));
            return Ok(());
        }

        self.partial_update = false;
        let next = next_price_deadline(
            now,
            self.tz,
            amber.price_interval_secs,
            amber.real_price_offset_secs,
        );
        self.next_price_tick = Some(next);
        self.logger.debug(&format!("Next price update at {}", next));

        if self.automatic_control_on().await? {
            self.automatic_control = true;
            self.decision_tick_at(now).await?;
        }
        Ok(())
    }

    async fn gather_at(&mut self, now: DateTime<Utc>) -> Result<TickContext> {
        let plant = PlantSnapshot::read(self.plant.as_ref(), &self.config.plant.entities).await?;
        let required_kwh = self
            .forecaster
            .required_remaining_energy(now, self.config.profile.buffer_kwh)
            .await?;
        let base_load_kw = self.base_load.refresh_if_stale(now).await?;
        Ok(TickContext {
            plant,
            required_kwh,
            base_load_kw,
        })
    }

    /// Select and apply a working mode from the latest prices
    pub async fn decision_tick_at(&mut self, now: DateTime<Utc>) -> Result<Option<ModeChange>> {
        let context = self.gather_at(now).await?;
        let Some(prices) = self.prices.as_ref() else {
            return Err(GridwiseError::network("no price data yet"));
        };
        let change = self.engine.tick(&context.inputs(prices)).await?;
        self.decision_ticks = self.decision_ticks.saturating_add(1);

        let logger = self.logger.for_tick(self.decision_ticks);
        logger.info(&format!(
            "{} (feed-in {} c/kWh, target {}, available {:.2} kWh, required {:.2} kWh)",
            self.engine.state().working_mode,
            prices.current.feed_in,
            self.engine.state().target_dispatch_price,
            self.engine.state().available_energy_kwh,
            self.engine.state().required_energy_kwh
        ));

        if let Some(change) = &change {
            let (title, message) = change.describe();
            self.notify(&title, &message).await;
        }
        Ok(change)
    }

    async fn follow_automatic_control_at(&mut self, now: DateTime<Utc>) -> Result<()> {
        let on = self.automatic_control_on().await?;
        if on == self.automatic_control {
            return Ok(());
        }
        self.automatic_control = on;

        if on {
            self.logger.info("Automatic control turned on");
            self.notify("Automatic Control turned on", "Resuming dispatch decisions")
                .await;
            if self.prices.is_some() {
                self.decision_tick_at(now).await?;
            }
        } else {
            self.logger.info("Automatic control turned off");
            self.notify("Automatic Control turned off", "Self Consuming")
                .await;
        }
        Ok(())
    }

    async fn apply_minimum_price_override(&mut self) {
        let Some(entity) = self.config.home_assistant.min_dispatch_price_entity.as_deref() else {
            return;
        };
        match self.plant.get_numeric(entity).await {
            Ok(price) => self.engine.set_minimum_dispatch_price(price),
            Err(e) => self
                .logger
                .warn(&format!("Minimum dispatch price unavailable: {}", e)),
        }
    }

    /// Recompute derived values and publish every sensor
    pub async fn update_sensors_at(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.prices.is_none() {
            return Ok(());
        }
        let context = self.gather_at(now).await?;
        let load_until_horizon = self
            .forecaster
            .forecast(now, ForecastWindow::Until(self.solar_horizon))
            .await?;
        let grid_export_kw = self
            .plant
            .get_numeric(&self.config.plant.entities.grid_export_power)
            .await?;

        let Some(prices) = self.prices.as_ref() else {
            return Ok(());
        };
        let target = self.engine.update_values(&context.inputs(prices));
        let current = prices.current;
        let max_feed_in = prices.feed_in_forecast.max_price().unwrap_or(current.feed_in);

        let effective = effective_price(&EffectivePriceInputs {
            general_price: current.general,
            feed_in_price: current.feed_in,
            target_dispatch_price: target,
            solar_daytime: is_solar_daytime(context.plant.pv_power_kw, context.base_load_kw),
            solar_remaining_kwh: context.plant.solar_remaining_kwh.unwrap_or(0.0),
            solar_reserve_kwh: self.config.dispatch.effective_price.solar_reserve_kwh,
            stored_available_kwh: context.plant.stored_available_kwh(),
            charge_headroom_kwh: context.plant.charge_headroom_kwh,
            load_until_horizon_kwh: load_until_horizon,
            required_energy_kwh: context.required_kwh,
        });

        let working_mode = self.engine.state().working_mode;
        let uptime = self
            .started_at
            .map_or(0.0, |start| (now - start).num_milliseconds() as f64 / 1000.0);

        let numbers = [
            ("max_feed_in_price", max_feed_in.round(), "c/kWh"),
            ("feed_in_price", current.feed_in.round(), "c/kWh"),
            ("general_price", current.general.round(), "c/kWh"),
            ("kwh_drained", round2(context.plant.charge_headroom_kwh), "kWh"),
            ("kwh_available", round2(context.plant.stored_available_kwh()), "kWh"),
            ("target_dispatch_price", target.round(), "c/kWh"),
            ("kwh_required", round2(context.required_kwh), "kWh"),
            ("base_load", (context.base_load_kw * 1000.0).round(), "W"),
            ("effective_price", effective.round(), "c/kWh"),
            ("hours_until_full", context.plant.hours_until_full(), "h"),
            ("hours_until_empty", context.plant.hours_until_empty(), "h"),
            ("uptime", (uptime * 10.0).round() / 10.0, "s"),
        ];
        for (name, value, unit) in numbers {
            self.publish_number(name, value, Some(unit)).await;
        }
        if let Some(remaining) = self.feed.rate_limit_remaining() {
            self.publish_number("api_calls_remaining", f64::from(remaining), None)
                .await;
        }
        self.publish_text("working_mode", working_mode.as_str()).await;
        self.publish_text(
            "system_state",
            &format!(
                "{} {} kW @ {} c/kWh",
                working_mode,
                round2(grid_export_kw),
                current.feed_in
            ),
        )
        .await;
        Ok(())
    }

    async fn notify(&self, title: &str, message: &str) {
        if let Err(e) = self.notifier.notify(title, message).await {
            self.logger
                .warn(&format!("Notification '{}' failed: {}", title, e));
        }
    }

    async fn publish_number(&self, name: &str, value: f64, unit: Option<&str>) {
        if let Err(e) = self.metrics.publish_number(name, value, unit).await {
            self.logger.warn(&format!("Publishing {} failed: {}", name, e));
        }
    }

    async fn publish_text(&self, name: &str, value: &str) {
        if let Err(e) = self.metrics.publish_text(name, value).await {
            self.logger.warn(&format!("Publishing {} failed: {}", name, e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::testing::RecordingSink;
    use crate::plant::ControlMode;
    use crate::plant::testing::MockPlant;
    use crate::pricing::CurrentPrices;
    use crate::pricing::testing::MockFeed;
    use crate::profile::Sample;
    use chrono::TimeZone;

    const AUTO: &str = "input_select.automatic_control_mode";

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 8, 10, 0, 0).unwrap()
    }

    fn config() -> Config {
        Config {
            timezone: "UTC".to_string(),
            ..Config::default()
        }
    }

    /// Daily counter rising 1 kWh per hour over the week before `anchor`
    fn counter_history(anchor: DateTime<Utc>) -> Vec<Sample> {
        let midnight = anchor.date_naive().and_hms_opt(0, 0, 0).unwrap().and_utc();
        (1..=7)
            .flat_map(move |d| {
                let start = midnight - chrono::Duration::days(d);
                (0..1440).map(move |m| {
                    let ts = start + chrono::Duration::minutes(i64::from(m));
                    Sample::new(f64::from(m) / 60.0, ts)
                })
            })
            .collect()
    }

    fn load_history(anchor: DateTime<Utc>) -> Vec<Sample> {
        (1..=48)
            .map(|h| Sample::new(0.8, anchor - chrono::Duration::hours(h)))
            .collect()
    }

    fn plant(config: &Config, anchor: DateTime<Utc>) -> Arc<MockPlant> {
        let e = &config.plant.entities;
        let plant = MockPlant::new()
            .with_numeric(&e.rated_capacity, 20.0)
            .with_numeric(&e.backup_soc, 10.0)
            .with_numeric(&e.discharge_capacity, 12.0)
            .with_numeric(&e.charge_capacity, 8.0)
            .with_numeric(&e.battery_power, 0.0)
            .with_numeric(&e.pv_power, 0.0)
            .with_numeric(&e.grid_export_power, 0.5)
            .with_numeric(&e.solar_forecast_remaining, 0.0)
            .with_history(&e.daily_load_consumption, counter_history(anchor))
            .with_history(&e.load_power, load_history(anchor));
        plant.set_text(AUTO, "On");
        Arc::new(plant)
    }

    struct Harness {
        plant: Arc<MockPlant>,
        feed: Arc<MockFeed>,
        sink: Arc<RecordingSink>,
        controller: Controller,
    }

    async fn harness(config: Config, current: CurrentPrices) -> Harness {
        harness_at(config, current, now()).await
    }

    async fn harness_at(
        config: Config,
        current: CurrentPrices,
        anchor: DateTime<Utc>,
    ) -> Harness {
        let plant = plant(&config, anchor);
        let feed = Arc::new(MockFeed::new(current, Vec::new()));
        let sink = Arc::new(RecordingSink::default());
        let controller = Controller::new(
            config,
            plant.clone(),
            feed.clone(),
            sink.clone(),
            sink.clone(),
        )
        .await
        .unwrap();
        Harness {
            plant,
            feed,
            sink,
            controller,
        }
    }

    #[test]
    fn test_next_price_deadline() {
        let t = Utc.with_ymd_and_hms(2025, 3, 8, 10, 2, 30).unwrap();
        assert_eq!(
            next_price_deadline(t, chrono_tz::UTC, 300, 20),
            Utc.with_ymd_and_hms(2025, 3, 8, 10, 5, 20).unwrap()
        );
        // Already past this interval's settle point: wait for the next one
        let t = Utc.with_ymd_and_hms(2025, 3, 8, 10, 5, 20).unwrap();
        assert_eq!(
            next_price_deadline(t, chrono_tz::UTC, 300, 20),
            Utc.with_ymd_and_hms(2025, 3, 8, 10, 10, 20).unwrap()
        );
    }

    #[tokio::test]
    async fn test_poll_dispatches_and_publishes() {
        let mut h = harness(config(), CurrentPrices::new(30.0, 60.0, false)).await;

        h.controller.poll_at(now()).await.unwrap();

        assert_eq!(
            h.plant.applied_modes(),
            vec![ControlMode::CommandDischargingPvFirst]
        );
        assert_eq!(
            h.controller.engine().state().working_mode,
            WorkingMode::Dispatching
        );
        let notes = h.sink.notifications();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].0, "Dispatching at 60 c/kWh");

        assert_eq!(h.sink.number("feed_in_price"), Some(60.0));
        assert_eq!(h.sink.number("general_price"), Some(30.0));
        assert_eq!(h.sink.number("kwh_available"), Some(10.0));
        assert_eq!(h.sink.number("kwh_drained"), Some(8.0));
        assert_eq!(h.sink.number("base_load"), Some(800.0));
        assert_eq!(h.sink.number("api_calls_remaining"), Some(42.0));
        assert_eq!(h.sink.number("uptime"), Some(0.0));
        // Stored energy is below the overnight requirement
        assert_eq!(h.sink.number("effective_price"), Some(30.0));
        let required = h.sink.number("kwh_required").unwrap();
        assert!((required - 24.95).abs() < 1e-6, "{}", required);
        assert_eq!(h.sink.text("working_mode").as_deref(), Some("Dispatching"));
        assert_eq!(
            h.sink.text("system_state").as_deref(),
            Some("Dispatching 0.5 kW @ 60 c/kWh")
        );
        assert_eq!(
            h.controller.next_price_tick(),
            Some(Utc.with_ymd_and_hms(2025, 3, 8, 10, 5, 20).unwrap())
        );
    }

    #[tokio::test]
    async fn test_prices_fetched_only_when_due() {
        let mut h = harness(config(), CurrentPrices::new(30.0, 60.0, false)).await;

        h.controller.poll_at(now()).await.unwrap();
        h.controller
            .poll_at(now() + chrono::Duration::seconds(2))
            .await
            .unwrap();
        h.controller
            .poll_at(now() + chrono::Duration::seconds(4))
            .await
            .unwrap();

        assert_eq!(*h.feed.current_calls.lock().unwrap(), 1);
        assert_eq!(h.plant.applied_modes().len(), 1);
        assert_eq!(h.sink.number("uptime"), Some(4.0));
        assert_eq!(h.controller.decision_ticks(), 1);

        h.controller
            .poll_at(Utc.with_ymd_and_hms(2025, 3, 8, 10, 5, 20).unwrap())
            .await
            .unwrap();
        assert_eq!(*h.feed.current_calls.lock().unwrap(), 2);
        assert_eq!(*h.feed.forecast_calls.lock().unwrap(), 2);
        // Same control mode again: no second notification
        assert_eq!(h.controller.decision_ticks(), 2);
        assert_eq!(h.plant.applied_modes().len(), 2);
        assert_eq!(h.sink.notifications().len(), 1);
    }

    #[tokio::test]
    async fn test_estimated_prices_retry_with_partial_update() {
        let mut h = harness(config(), CurrentPrices::new(30.0, 60.0, true)).await;

        h.controller.poll_at(now()).await.unwrap();
        assert!(h.plant.applied_modes().is_empty());
        assert_eq!(
            h.controller.next_price_tick(),
            Some(now() + chrono::Duration::seconds(10))
        );

        *h.feed.current.lock().unwrap() = CurrentPrices::new(30.0, 60.0, false);
        h.controller
            .poll_at(now() + chrono::Duration::seconds(10))
            .await
            .unwrap();
        assert_eq!(*h.feed.current_calls.lock().unwrap(), 2);
        assert_eq!(*h.feed.forecast_calls.lock().unwrap(), 1);
        assert_eq!(h.plant.applied_modes().len(), 1);
    }

    #[tokio::test]
    async fn test_automatic_control_transitions() {
        let mut h = harness(config(), CurrentPrices::new(30.0, 60.0, false)).await;
        h.controller.poll_at(now()).await.unwrap();
        assert_eq!(h.sink.notifications().len(), 1);

        h.plant.set_text(AUTO, "Off");
        h.controller
            .poll_at(now() + chrono::Duration::seconds(2))
            .await
            .unwrap();
        assert!(!h.controller.automatic_control());
        let notes = h.sink.notifications();
        assert_eq!(notes.len(), 2);
        assert_eq!(notes[1].0, "Automatic Control turned off");

        // Staying off is quiet
        h.controller
            .poll_at(now() + chrono::Duration::seconds(4))
            .await
            .unwrap();
        assert_eq!(h.sink.notifications().len(), 2);
        assert_eq!(h.plant.applied_modes().len(), 1);

        // Turning on runs a decision tick straight away
        h.plant.set_text(AUTO, "On");
        h.controller
            .poll_at(now() + chrono::Duration::seconds(6))
            .await
            .unwrap();
        assert!(h.controller.automatic_control());
        assert_eq!(h.plant.applied_modes().len(), 2);
        assert_eq!(h.sink.notifications()[2].0, "Automatic Control turned on");
    }

    #[tokio::test]
    async fn test_no_decisions_while_off() {
        let mut h = harness(config(), CurrentPrices::new(30.0, 60.0, false)).await;
        h.plant.set_text(AUTO, "Off");

        h.controller.poll_at(now()).await.unwrap();
        assert!(h.plant.applied_modes().is_empty());
        // Sensors are still published
        assert_eq!(h.sink.number("feed_in_price"), Some(60.0));
    }

    #[tokio::test]
    async fn test_startup_self_consumes_when_on() {
        let mut h = harness(config(), CurrentPrices::default()).await;
        h.controller.startup_at(now()).await.unwrap();
        assert_eq!(
            h.plant.applied_modes(),
            vec![ControlMode::MaximumSelfConsumption]
        );

        let mut h = harness(config(), CurrentPrices::default()).await;
        h.plant.set_text(AUTO, "Off");
        h.controller.startup_at(now()).await.unwrap();
        assert!(h.plant.applied_modes().is_empty());
        assert!(!h.controller.automatic_control());
    }

    #[tokio::test]
    async fn test_runtime_minimum_dispatch_price() {
        let mut config = config();
        config.home_assistant.min_dispatch_price_entity =
            Some("input_number.min_dispatch_price".to_string());
        let mut h = harness(config, CurrentPrices::new(30.0, 20.0, false)).await;
        h.plant.set_numeric("input_number.min_dispatch_price", 35.0);

        h.controller.poll_at(now()).await.unwrap();
        assert_eq!(
            h.controller.engine().thresholds().minimum_dispatch_price,
            35.0
        );
        assert_eq!(h.sink.number("target_dispatch_price"), Some(35.0));
    }

    #[tokio::test]
    async fn test_plant_failure_surfaces_as_transient() {
        let config = config();
        let plant = Arc::new(MockPlant::new());
        plant.set_text(AUTO, "On");
        let feed = Arc::new(MockFeed::new(CurrentPrices::new(30.0, 60.0, false), Vec::new()));
        let sink = Arc::new(RecordingSink::default());
        let mut controller = Controller::new(config, plant.clone(), feed, sink.clone(), sink)
            .await
            .unwrap();

        let err = controller.poll_at(now()).await.unwrap_err();
        assert!(err.is_transient());
        assert!(plant.applied_modes().is_empty());
    }

    #[tokio::test]
    async fn test_first_tick_respects_runtime_minimum() {
        let mut config = config();
        config.home_assistant.min_dispatch_price_entity =
            Some("input_number.min_dispatch_price".to_string());
        let mut h = harness(config, CurrentPrices::new(30.0, 20.0, false)).await;
        h.plant.set_numeric("input_number.min_dispatch_price", 35.0);
        h.plant
            .set_numeric(&h.controller.config.plant.entities.discharge_capacity, 80.0);

        h.controller.poll_at(now()).await.unwrap();

        assert_eq!(h.controller.engine().state().target_dispatch_price, 35.0);
        assert_eq!(
            h.controller.engine().state().working_mode,
            WorkingMode::ExportExcessSolar
        );
        assert_eq!(
            h.plant.applied_modes(),
            vec![ControlMode::MaximumSelfConsumption]
        );
    }

    #[tokio::test]
    async fn test_battery_runtime_sensors() {
        let mut h = harness(config(), CurrentPrices::new(30.0, 60.0, false)).await;
        h.plant
            .set_numeric(&h.controller.config.plant.entities.battery_power, 2.0);

        h.controller.poll_at(now()).await.unwrap();
        assert_eq!(h.sink.number("hours_until_empty"), Some(5.0));
        assert_eq!(h.sink.number("hours_until_full"), Some(0.0));

        h.plant
            .set_numeric(&h.controller.config.plant.entities.battery_power, -4.0);
        h.controller
            .poll_at(now() + chrono::Duration::seconds(2))
            .await
            .unwrap();
        assert_eq!(h.sink.number("hours_until_full"), Some(2.0));
        assert_eq!(h.sink.number("hours_until_empty"), Some(0.0));
    }

    #[tokio::test]
    async fn test_controller_starts_with_plant_offline() {
        let config = config();
        let plant = plant(&config, now());
        *plant.fail_current_mode.lock().unwrap() = true;
        let feed = Arc::new(MockFeed::new(CurrentPrices::new(30.0, 60.0, false), Vec::new()));
        let sink = Arc::new(RecordingSink::default());
        let mut controller =
            Controller::new(config, plant.clone(), feed, sink.clone(), sink.clone())
                .await
                .unwrap();
        assert!(controller.engine().state().last_applied_control_mode.is_none());

        *plant.fail_current_mode.lock().unwrap() = false;
        controller.poll_at(now()).await.unwrap();
        assert_eq!(
            controller.engine().state().working_mode,
            WorkingMode::Dispatching
        );
        // No previous mode known, so nothing to announce yet
        assert!(sink.notifications().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_backs_off_after_transient_failure() {
        let prices = CurrentPrices::new(30.0, 60.0, false);
        let mut h = harness_at(config(), prices, Utc::now()).await;
        *h.feed.fail.lock().unwrap() = true;
        let feed = h.feed.clone();
        let shutdown = h.controller.shutdown_handle();

        let (result, ()) = tokio::join!(h.controller.run(), async move {
            // First fetch fails at startup, then the loop waits out 30 s
            tokio::time::sleep(Duration::from_secs(20)).await;
            assert_eq!(*feed.current_calls.lock().unwrap(), 1);
            tokio::time::sleep(Duration::from_secs(15)).await;
            assert_eq!(*feed.current_calls.lock().unwrap(), 2);

            *feed.fail.lock().unwrap() = false;
            tokio::time::sleep(Duration::from_secs(30)).await;
            shutdown.send(()).unwrap();
        });

        result.unwrap();
        assert_eq!(*h.feed.current_calls.lock().unwrap(), 3);
        assert_eq!(h.controller.decision_ticks(), 1);
        assert_eq!(
            h.plant.applied_modes().last(),
            Some(&ControlMode::CommandDischargingPvFirst)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_keeps_polling_after_insufficient_history() {
        let config = config();
        let e = &config.plant.entities;
        let plant = MockPlant::new()
            .with_numeric(&e.rated_capacity, 20.0)
            .with_numeric(&e.backup_soc, 10.0)
            .with_numeric(&e.discharge_capacity, 12.0)
            .with_numeric(&e.charge_capacity, 8.0)
            .with_numeric(&e.battery_power, 0.0)
            .with_numeric(&e.pv_power, 0.0);
        plant.set_text(AUTO, "On");
        let plant = Arc::new(plant);
        let feed = Arc::new(MockFeed::new(CurrentPrices::new(30.0, 60.0, false), Vec::new()));
        let sink = Arc::new(RecordingSink::default());
        let mut controller = Controller::new(config, plant.clone(), feed, sink.clone(), sink)
            .await
            .unwrap();
        let shutdown = controller.shutdown_handle();
        let watched = plant.clone();

        let (result, ()) = tokio::join!(controller.run(), async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            // Wakes at 0, 2 and 4 s each retried the profile: no backoff
            assert_eq!(watched.history_calls(), 21);
            shutdown.send(()).unwrap();
        });

        result.unwrap();
        assert!(controller.total_polls >= 3);
        assert_eq!(controller.decision_ticks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_backoff() {
        let prices = CurrentPrices::new(30.0, 60.0, false);
        let mut h = harness_at(config(), prices, Utc::now()).await;
        *h.feed.fail.lock().unwrap() = true;
        let shutdown = h.controller.shutdown_handle();
        let started = tokio::time::Instant::now();

        let (result, ()) = tokio::join!(h.controller.run(), async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            shutdown.send(()).unwrap();
        });

        result.unwrap();
        assert!(started.elapsed() < Duration::from_secs(30));
        assert_eq!(*h.feed.current_calls.lock().unwrap(), 1);
    }
}
