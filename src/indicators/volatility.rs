//! Volatility percentile and the dynamic band multiplier

use crate::models::StrategyParams;

/// Mid-rank percentile of `current` within `window`, in [0, 1]
///
/// `window` is expected to contain `current` itself. Ties count half, so a
/// perfectly flat window ranks at 0.5. A window of one value is 0.5 too.
pub fn percentile_rank<'a, I>(window: I, current: f64) -> f64
where
    I: IntoIterator<Item = &'a f64>,
{
    let mut below = 0usize;
    let mut equal = 0usize;
    let mut total = 0usize;

    for value in window {
        total += 1;
        if *value < current {
            below += 1;
        } else if *value == current {
            equal += 1;
        }
    }

    if total <= 1 {
        return 0.5;
    }

    // `current` is one of the equal entries; exclude it from the ranking
    let others_equal = equal.saturating_sub(1);
    let rank = below as f64 + 0.5 * others_equal as f64;
    (rank / (total - 1) as f64).clamp(0.0, 1.0)
}

/// Band multiplier for the current bar
///
/// `base * (0.5 + pct)^vol_power * (1 + trend_impact * run / trend_lookback)`,
/// with the run length capped at `trend_lookback`, then clamped to
/// `[mult_min, mult_max]`. Non-decreasing in both `pct` and `trend_run`.
pub fn dynamic_multiplier(params: &StrategyParams, pct: f64, trend_run: u32) -> f64 {
    let pct = if pct.is_finite() { pct.clamp(0.0, 1.0) } else { 0.5 };
    let vol_factor = (0.5 + pct).powf(params.vol_power);

    let lookback = params.trend_lookback.max(1) as f64;
    let run = (trend_run as f64).min(lookback);
    let trend_factor = 1.0 + params.trend_impact * (run / lookback);

    (params.base_mult * vol_factor * trend_factor).clamp(params.mult_min, params.mult_max)
}
