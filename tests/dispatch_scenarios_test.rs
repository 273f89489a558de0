use chrono::{DateTime, Duration, TimeZone, Utc};
use gridwise::dispatch::{DispatchEngine, DispatchInputs, DispatchThresholds, WorkingMode};
use gridwise::error::Result;
use gridwise::plant::{ControlMode, Plant, PlantRatings, PowerLimits};
use gridwise::pricing::{PriceForecastSet, PriceInterval};
use gridwise::profile::Sample;
use std::sync::{Arc, Mutex};

/// Plant that records every write in order
#[derive(Default)]
struct RecordingPlant {
    writes: Mutex<Vec<String>>,
    mode: Mutex<String>,
}

#[async_trait::async_trait]
impl Plant for RecordingPlant {
    async fn get_numeric(&self, _entity_id: &str) -> Result<f64> {
        Ok(0.0)
    }

    async fn get_text(&self, _entity_id: &str) -> Result<String> {
        Ok(String::new())
    }

    async fn get_history(
        &self,
        _entity_id: &str,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> Result<Vec<Sample>> {
        Ok(Vec::new())
    }

    async fn set_limits(&self, limits: PowerLimits) -> Result<()> {
        self.writes
            .lock()
            .unwrap()
            .push(format!("limits export={}", limits.export_kw));
        Ok(())
    }

    async fn set_control_mode(&self, mode: ControlMode) -> Result<()> {
        self.writes.lock().unwrap().push(format!("mode {}", mode));
        *self.mode.lock().unwrap() = mode.to_string();
        Ok(())
    }

    async fn get_current_mode(&self) -> Result<String> {
        Ok(self.mode.lock().unwrap().clone())
    }
}

fn ratings() -> PlantRatings {
    PlantRatings {
        max_discharge_kw: 21.0,
        max_charge_kw: 21.0,
        max_pv_kw: 21.0,
        max_export_kw: 21.0,
        max_import_kw: 21.0,
    }
}

fn forecast(prices: &[f64]) -> PriceForecastSet {
    let start = Utc.with_ymd_and_hms(2025, 3, 1, 6, 0, 0).unwrap();
    PriceForecastSet::new(
        prices
            .iter()
            .enumerate()
            .map(|(i, p)| PriceInterval {
                price: *p,
                start: start + Duration::minutes(30 * i as i64),
                end: start + Duration::minutes(30 * (i as i64 + 1)),
            })
            .collect(),
    )
}

fn inputs(
    set: &PriceForecastSet,
    price: f64,
    available: f64,
    required: f64,
) -> DispatchInputs<'_> {
    DispatchInputs {
        feed_in_price: price,
        feed_in_forecast: set,
        available_energy_kwh: available,
        required_energy_kwh: required,
        solar_remaining_kwh: None,
        solar_daytime: None,
    }
}

async fn engine(plant: Arc<RecordingPlant>, thresholds: DispatchThresholds) -> DispatchEngine {
    DispatchEngine::new(plant, ratings(), thresholds).await
}

#[tokio::test]
async fn good_price_dispatches_regardless_of_target() {
    let plant = Arc::new(RecordingPlant::default());
    let mut engine = engine(plant.clone(), DispatchThresholds::default()).await;
    let set = forecast(&[400.0, 380.0, 300.0]);

    engine.tick(&inputs(&set, 60.0, 10.0, 3.0)).await.unwrap();
    assert_eq!(engine.state().working_mode, WorkingMode::Dispatching);
    assert!(engine.state().target_dispatch_price > 60.0);
}

#[tokio::test]
async fn negative_price_self_consumes() {
    let plant = Arc::new(RecordingPlant::default());
    let mut engine = engine(plant.clone(), DispatchThresholds::default()).await;
    let set = forecast(&[5.0, 2.0]);

    let mut i = inputs(&set, -1.0, 30.0, 10.0);
    i.solar_remaining_kwh = Some(40.0);
    i.solar_daytime = Some(false);
    engine.tick(&i).await.unwrap();
    assert_eq!(engine.state().working_mode, WorkingMode::SelfConsumption);
    assert_eq!(
        *plant.writes.lock().unwrap(),
        vec![
            "limits export=0".to_string(),
            "mode Maximum Self Consumption".to_string()
        ]
    );
}

#[tokio::test]
async fn limits_are_written_before_the_mode() {
    let plant = Arc::new(RecordingPlant::default());
    let mut engine = engine(plant.clone(), DispatchThresholds::default()).await;
    let set = forecast(&[30.0]);

    for price in [60.0, 5.0, 60.0] {
        engine.tick(&inputs(&set, price, 20.0, 10.0)).await.unwrap();
    }
    let writes = plant.writes.lock().unwrap().clone();
    assert_eq!(writes.len(), 6);
    for pair in writes.chunks(2) {
        assert!(pair[0].starts_with("limits"));
        assert!(pair[1].starts_with("mode"));
    }
}

#[tokio::test]
async fn mode_change_event_is_one_shot() {
    let plant = Arc::new(RecordingPlant::default());
    *plant.mode.lock().unwrap() = "Maximum Self Consumption".to_string();
    let mut engine = engine(plant.clone(), DispatchThresholds::default()).await;
    let set = forecast(&[30.0]);

    let mut fired = 0;
    for _ in 0..10 {
        if engine
            .tick(&inputs(&set, 60.0, 20.0, 10.0))
            .await
            .unwrap()
            .is_some()
        {
            fired += 1;
        }
    }
    assert_eq!(fired, 1);

    let change = engine
        .tick(&inputs(&set, 1.0, 20.0, 10.0))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(change.previous_control_mode, "Command Discharging (PV First)");
    assert_eq!(change.control_mode, "Maximum Self Consumption");
    assert_eq!(change.working_mode, WorkingMode::ExportExcessSolar);
}

#[tokio::test]
async fn solar_export_only_when_enabled() {
    let set = forecast(&[40.0, 30.0]);
    let mut i = inputs(&set, 5.0, 10.0, 15.0);
    i.solar_remaining_kwh = Some(30.0);
    i.solar_daytime = Some(true);

    let plant = Arc::new(RecordingPlant::default());
    let mut on = engine(plant, DispatchThresholds::default()).await;
    on.tick(&i).await.unwrap();
    assert_eq!(on.state().working_mode, WorkingMode::ExportAllSolar);

    let thresholds = DispatchThresholds {
        solar_export_enabled: false,
        ..DispatchThresholds::default()
    };
    let plant = Arc::new(RecordingPlant::default());
    let mut off = engine(plant, thresholds).await;
    off.tick(&i).await.unwrap();
    assert_eq!(off.state().working_mode, WorkingMode::ExportExcessSolar);
}
