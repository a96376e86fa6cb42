// =============================================================================
// Trailing stop math — volatility-scaled callback with a monotone ratchet
// =============================================================================
//
// Trailing activates at `activation_rr` multiples of the initial stop
// distance. The trail distance is the base callback (percent of price)
// scaled by a volatility multiplier:
//
//   vol_mult = clamp(atr% / atr_reference_pct, vol_mult_min, vol_mult_max)
//   d        = price * (callback_rate_pct / 100) * vol_mult
//
// The stop only ever ratchets toward profit: a new stop is emitted only when
// it improves on the current one.
// =============================================================================

use crate::brain::Side;
use crate::util::clip;

#[derive(Debug, Clone)]
pub struct TrailingConfig {
    pub activation_rr: f64,
    pub callback_rate_pct: f64,
    pub vol_mult_min: f64,
    pub vol_mult_max: f64,
    pub atr_reference_pct: f64,
}

impl Default for TrailingConfig {
    fn default() -> Self {
        Self {
            activation_rr: 1.30,
            callback_rate_pct: 0.45,
            vol_mult_min: 0.5,
            vol_mult_max: 2.0,
            atr_reference_pct: 0.01,
        }
    }
}

/// Volatility multiplier for the trailing distance.
pub fn vol_multiplier(atr_pct: f64, config: &TrailingConfig) -> f64 {
    if config.atr_reference_pct <= 0.0 {
        return 1.0;
    }
    clip(
        atr_pct / config.atr_reference_pct,
        config.vol_mult_min,
        config.vol_mult_max,
    )
}

/// Trailing distance in price units at the given price and volatility.
pub fn trailing_distance(price: f64, atr_pct: f64, config: &TrailingConfig) -> f64 {
    price * (config.callback_rate_pct / 100.0) * vol_multiplier(atr_pct, config)
}

/// Whether trailing should activate at this reward multiple.
pub fn should_activate(rr: f64, config: &TrailingConfig) -> bool {
    rr >= config.activation_rr
}

/// Compute the next trailing stop from the favorable extreme, or `None` when
/// the current stop is already at least as good.
pub fn next_trailing_stop(
    side: Side,
    extreme_price: f64,
    atr_pct: f64,
    current_stop: Option<f64>,
    config: &TrailingConfig,
) -> Option<f64> {
    if extreme_price <= 0.0 {
        return None;
    }
    let d = trailing_distance(extreme_price, atr_pct, config);

    let candidate = match side {
        Side::Long => extreme_price - d,
        Side::Short => extreme_price + d,
    };

    match current_stop {
        None => Some(candidate),
        Some(current) => {
            let improves = match side {
                Side::Long => candidate > current,
                Side::Short => candidate < current,
            };
            improves.then_some(candidate)
        }
    }
}
