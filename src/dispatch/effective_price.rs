//! Marginal price of consuming one more kWh right now

/// Snapshot of the quantities the effective price depends on (c/kWh, kWh)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EffectivePriceInputs {
    pub general_price: f64,
    pub feed_in_price: f64,
    pub target_dispatch_price: f64,
    /// Current PV power exceeds the base load estimate
    pub solar_daytime: bool,
    pub solar_remaining_kwh: f64,
    /// Solar energy not counted as available before the horizon
    pub solar_reserve_kwh: f64,
    pub stored_available_kwh: f64,
    pub charge_headroom_kwh: f64,
    /// Forecast household load from now until the solar horizon
    pub load_until_horizon_kwh: f64,
    pub required_energy_kwh: f64,
}

/// What consuming extra energy now costs.
///
/// Negative grid prices are always passed through. Otherwise, energy that would
/// be exported anyway is worth the feed-in price, energy that displaces a
/// future dispatch is worth the better of target and feed-in price, and energy
/// that would have to be bought back later costs the general price.
pub fn effective_price(inputs: &EffectivePriceInputs) -> f64 {
    let i = inputs;
    if i.general_price < 0.0 {
        return i.general_price;
    }

    let dispatch_value = i.target_dispatch_price.max(i.feed_in_price);

    if i.solar_daytime {
        let absorbable = i.charge_headroom_kwh + i.load_until_horizon_kwh;
        if i.solar_remaining_kwh > absorbable {
            return i.feed_in_price.max(0.0);
        }
        let available =
            (i.solar_remaining_kwh - i.solar_reserve_kwh).max(0.0) + i.stored_available_kwh;
        if available > i.required_energy_kwh {
            return dispatch_value;
        }
        return i.general_price;
    }

    if i.stored_available_kwh > i.required_energy_kwh {
        dispatch_value
    } else {
        i.general_price
    }
}
