use super::{DispatchInputs, DispatchThresholds, WorkingMode};
use crate::pricing::PriceInterval;

/// Feed-in price worth dispatching at.
///
/// The energy surplus over the requirement is converted into a number of
/// half-hour export windows at full export power. The price ranked at that
/// position in the descending forecast, scaled down by the reduction
/// percentage and floored at the minimum dispatch price, is the target.
pub fn target_price(
    descending: &[PriceInterval],
    available_energy_kwh: f64,
    required_energy_kwh: f64,
    max_export_kw: f64,
    thresholds: &DispatchThresholds,
) -> f64 {
    let surplus_hours = if max_export_kw > 0.0 {
        ((available_energy_kwh - required_energy_kwh) / max_export_kw).max(0.0)
    } else {
        0.0
    };
    let windows = (surplus_hours * 2.0).round() as usize;

    let Some(last) = descending.len().checked_sub(1) else {
        return thresholds.minimum_dispatch_price.round();
    };
    let raw = descending[windows.min(last)].price;
    let scaled = thresholds.target_price_reduction_percent / 100.0 * raw;
    scaled.max(thresholds.minimum_dispatch_price).round()
}

/// Select a working mode; the first matching rule wins
pub fn evaluate(inputs: &DispatchInputs<'_>, target: f64, t: &DispatchThresholds) -> WorkingMode {
    let price = inputs.feed_in_price;
    let available = inputs.available_energy_kwh;
    let required = inputs.required_energy_kwh;

    // Good price: run the battery down to the floor
    if price >= t.good_sell_price && price < t.sanity_ceiling && available > t.minimal_energy_floor_kwh {
        return WorkingMode::Dispatching;
    }

    if price >= target && available > required {
        return WorkingMode::Dispatching;
    }

    if t.solar_export_enabled
        && let (Some(solar), Some(true)) = (inputs.solar_remaining_kwh, inputs.solar_daytime)
        && solar + available > required + t.solar_export_margin_kwh
        && price > t.solar_export_min_price
    {
        return WorkingMode::ExportAllSolar;
    }

    // Never export at a negative price
    if price >= 0.0 {
        WorkingMode::ExportExcessSolar
    } else {
        WorkingMode::SelfConsumption
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::PriceForecastSet;
    use chrono::{Duration, TimeZone, Utc};

    fn forecast(prices: &[f64]) -> PriceForecastSet {
        let start = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
        PriceForecastSet::new(
            prices
                .iter()
                .enumerate()
                .map(|(i, p)| {
                    let s = start + Duration::minutes(30 * i as i64);
                    PriceInterval {
                        price: *p,
                        start: s,
                        end: s + Duration::minutes(30),
                    }
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

    #[test]
    fn test_target_price_indexes_by_surplus_windows() {
        let set = forecast(&[10.0, 100.0, 40.0, 60.0, 20.0]);
        let t = DispatchThresholds::default();
        // descending: 100, 60, 40, 20, 10
        // surplus 10.5 kWh at 21 kW = 0.5 h = 1 window -> 60 * 0.8 = 48
        assert_eq!(target_price(set.descending(), 20.5, 10.0, 21.0, &t), 48.0);
        // no surplus -> top price
        assert_eq!(target_price(set.descending(), 5.0, 10.0, 21.0, &t), 80.0);
    }

    #[test]
    fn test_target_price_floor_and_clamp() {
        let set = forecast(&[11.0, 9.0]);
        let t = DispatchThresholds::default();
        // index clamps to the last entry (9 * 0.8 = 7.2) then floors at 10
        assert_eq!(target_price(set.descending(), 500.0, 0.0, 21.0, &t), 10.0);
        // empty forecast falls back to the minimum
        assert_eq!(target_price(&[], 20.0, 5.0, 21.0, &t), 10.0);
    }

    #[test]
    fn test_target_price_rounds() {
        let set = forecast(&[33.0]);
        let t = DispatchThresholds::default();
        // 33 * 0.8 = 26.4
        assert_eq!(target_price(set.descending(), 0.0, 0.0, 21.0, &t), 26.0);
    }

    #[test]
    fn test_good_price_short_circuits() {
        let set = forecast(&[500.0]);
        let t = DispatchThresholds::default();
        for target in [10.0, 70.0, 400.0] {
            assert_eq!(
                evaluate(&inputs(&set, 60.0, 10.0, 3.0), target, &t),
                WorkingMode::Dispatching
            );
        }
        // Even when energy is below the requirement
        assert_eq!(
            evaluate(&inputs(&set, 60.0, 10.0, 30.0), 400.0, &t),
            WorkingMode::Dispatching
        );
    }

    #[test]
    fn test_good_price_guards() {
        let set = forecast(&[]);
        let t = DispatchThresholds::default();
        // Above the sanity ceiling is bad data
        assert_eq!(
            evaluate(&inputs(&set, 1000.0, 10.0, 30.0), 2000.0, &t),
            WorkingMode::ExportExcessSolar
        );
        // Not enough energy above the floor
        assert_eq!(
            evaluate(&inputs(&set, 60.0, 5.0, 30.0), 400.0, &t),
            WorkingMode::ExportExcessSolar
        );
    }

    #[test]
    fn test_price_triggered_dispatch() {
        let set = forecast(&[]);
        let t = DispatchThresholds::default();
        assert_eq!(
            evaluate(&inputs(&set, 30.0, 20.0, 10.0), 25.0, &t),
            WorkingMode::Dispatching
        );
        assert_eq!(
            evaluate(&inputs(&set, 30.0, 10.0, 10.0), 25.0, &t),
            WorkingMode::ExportExcessSolar
        );
        assert_eq!(
            evaluate(&inputs(&set, 20.0, 20.0, 10.0), 25.0, &t),
            WorkingMode::ExportExcessSolar
        );
    }

    #[test]
    fn test_negative_price_self_consumes() {
        let set = forecast(&[]);
        let t = DispatchThresholds::default();
        for (available, required) in [(0.0, 0.0), (50.0, 1.0), (1.0, 50.0)] {
            assert_eq!(
                evaluate(&inputs(&set, -1.0, available, required), 10.0, &t),
                WorkingMode::SelfConsumption
            );
        }
    }

    #[test]
    fn test_solar_export_rule() {
        let set = forecast(&[]);
        let mut t = DispatchThresholds::default();
        let mut i = inputs(&set, 5.0, 10.0, 15.0);
        i.solar_remaining_kwh = Some(30.0);
        i.solar_daytime = Some(true);
        // 30 + 10 > 15 + 20
        assert_eq!(evaluate(&i, 20.0, &t), WorkingMode::ExportAllSolar);

        // Not daytime
        i.solar_daytime = Some(false);
        assert_eq!(evaluate(&i, 20.0, &t), WorkingMode::ExportExcessSolar);
        i.solar_daytime = Some(true);

        // Price not above the minimum
        i.feed_in_price = 2.0;
        assert_eq!(evaluate(&i, 20.0, &t), WorkingMode::ExportExcessSolar);
        i.feed_in_price = 5.0;

        // Margin not met
        i.solar_remaining_kwh = Some(25.0);
        assert_eq!(evaluate(&i, 20.0, &t), WorkingMode::ExportExcessSolar);
        i.solar_remaining_kwh = Some(30.0);

        // Disabled
        t.solar_export_enabled = false;
        assert_eq!(evaluate(&i, 20.0, &t), WorkingMode::ExportExcessSolar);
    }

    #[test]
    fn test_dispatch_outranks_solar_export() {
        let set = forecast(&[]);
        let t = DispatchThresholds::default();
        let mut i = inputs(&set, 30.0, 40.0, 10.0);
        i.solar_remaining_kwh = Some(50.0);
        i.solar_daytime = Some(true);
        assert_eq!(evaluate(&i, 25.0, &t), WorkingMode::Dispatching);
    }
}
