/// Volatility-adaptive SuperTrend trailing bands
///
/// Per bar:
/// 1. Wilder ATR and an EMA baseline of close
/// 2. Percentile of the current ATR inside the trailing `vol_lookback` window
/// 3. Dynamic multiplier from that percentile and the regime run length
/// 4. Raw bands `baseline ± multiplier * ATR`
/// 5. Trailing rule: while the regime holds, the protective trail only moves
///    toward price (long trail never drops, short trail never rises)
/// 6. A regime flip needs `confirm_bars` consecutive closes beyond the
///    opposite trail; until then the pre-flip trail stays active
///
/// `update` is a pure function of (state, params, candles). Feeding the same
/// bars in one batch or across several calls gives the same state.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;

use super::atr::{true_range, WilderAtr};
use super::moving_average::Ema;
use super::volatility::{dynamic_multiplier, percentile_rank};
use crate::models::{Candle, Regime, Side, StrategyParams};

/// Not enough bars processed to trust the bands yet
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("insufficient history: {have} of {need} bars")]
pub struct InsufficientHistory {
    pub have: usize,
    pub need: usize,
}

/// Indicator output for the most recent processed bar
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndicatorReading {
    pub timestamp: DateTime<Utc>,
    pub close: f64,
    pub baseline: f64,
    pub atr: f64,
    pub vol_percentile: f64,
    pub multiplier: f64,
    pub upper_band: f64,
    pub lower_band: f64,
    /// Protective trail for longs (ratchets up while bullish)
    pub trail_long: f64,
    /// Protective trail for shorts (ratchets down while bearish)
    pub trail_short: f64,
    pub regime: Regime,
    pub is_flip: bool,
    pub trend_run: u32,
}

impl IndicatorReading {
    /// Trail of the confirmed regime; neutral falls back to the long trail
    pub fn active_band(&self) -> f64 {
        match self.regime {
            Regime::Bearish => self.trail_short,
            Regime::Bullish | Regime::Neutral => self.trail_long,
        }
    }

    /// Band a stop for `side` should follow
    ///
    /// A side follows its own trail unless the confirmed regime is against
    /// it, in which case the regime's trail is used.
    pub fn stop_band(&self, side: Side) -> f64 {
        match (side, self.regime) {
            (Side::Long, Regime::Bearish) => self.trail_short,
            (Side::Short, Regime::Bullish) => self.trail_long,
            (Side::Long, _) => self.trail_long,
            (Side::Short, _) => self.trail_short,
        }
    }

    pub fn flip_direction(&self) -> Option<Side> {
        if self.is_flip {
            self.regime.side()
        } else {
            None
        }
    }
}

/// Carried indicator state for one position
///
/// A cache derived from (candle history, params); rebuilt by replay when
/// missing.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IndicatorState {
    bars: usize,
    last_timestamp: Option<DateTime<Utc>>,
    prev_close: Option<f64>,
    atr: WilderAtr,
    ema: Ema,
    atr_window: VecDeque<f64>,
    trail_long: Option<f64>,
    trail_short: Option<f64>,
    regime: Regime,
    bull_count: u32,
    bear_count: u32,
    trend_run: u32,
    last: Option<IndicatorReading>,
}

impl IndicatorState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build state from scratch over a full history
    pub fn replay(params: &StrategyParams, candles: &[Candle]) -> Self {
        update(Self::new(), params, candles)
    }

    pub fn bars(&self) -> usize {
        self.bars
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.last_timestamp
    }

    pub fn regime(&self) -> Regime {
        self.regime
    }

    /// Consecutive closes beyond the opposite trail (pending flip)
    pub fn pending_confirmations(&self) -> u32 {
        match self.regime {
            Regime::Bullish => self.bear_count,
            Regime::Bearish => self.bull_count,
            Regime::Neutral => self.bull_count.max(self.bear_count),
        }
    }

    /// Latest reading, once enough bars have been seen
    pub fn reading(
        &self,
        params: &StrategyParams,
    ) -> Result<&IndicatorReading, InsufficientHistory> {
        let need = params.warmup_bars();
        match &self.last {
            Some(reading) if self.bars >= need => Ok(reading),
            _ => Err(InsufficientHistory {
                have: self.bars,
                need,
            }),
        }
    }

    fn accepts(&self, candle: &Candle) -> bool {
        if let Some(last) = self.last_timestamp {
            if candle.timestamp <= last {
                return false;
            }
        }
        candle.is_well_formed()
    }

    fn step(&mut self, params: &StrategyParams, candle: &Candle) {
        let tr = true_range(candle, self.prev_close);
        self.prev_close = Some(candle.close);
        self.last_timestamp = Some(candle.timestamp);
        self.bars += 1;

        let atr = self.atr.next(tr, params.atr_len);
        let baseline = self.ema.next(candle.close, params.ema_len);
        let (Some(atr), Some(baseline)) = (atr, baseline) else {
            return;
        };

        self.atr_window.push_back(atr);
        while self.atr_window.len() > params.vol_lookback.max(1) {
            self.atr_window.pop_front();
        }

        let vol_percentile = percentile_rank(&self.atr_window, atr);
        let multiplier = dynamic_multiplier(params, vol_percentile, self.trend_run);
        let upper_band = baseline + multiplier * atr;
        let lower_band = baseline - multiplier * atr;
        let close = candle.close;
        let prev_regime = self.regime;

        let (trail_long, trail_short) = match (self.trail_long, self.trail_short) {
            (Some(prev_long), Some(prev_short)) => {
                // Closes are compared against the previous bar's trails
                self.bull_count = if close > prev_short { self.bull_count + 1 } else { 0 };
                self.bear_count = if close < prev_long { self.bear_count + 1 } else { 0 };

                let trails = match prev_regime {
                    Regime::Bullish => (lower_band.max(prev_long), upper_band),
                    Regime::Bearish => (lower_band, upper_band.min(prev_short)),
                    Regime::Neutral => (lower_band, upper_band),
                };

                let confirm = params.confirm_bars.max(1);
                self.regime = match prev_regime {
                    Regime::Neutral if self.bull_count >= confirm => Regime::Bullish,
                    Regime::Neutral if self.bear_count >= confirm => Regime::Bearish,
                    Regime::Bullish if self.bear_count >= confirm => Regime::Bearish,
                    Regime::Bearish if self.bull_count >= confirm => Regime::Bullish,
                    unchanged => unchanged,
                };

                trails
            }
            _ => (lower_band, upper_band),
        };

        self.trail_long = Some(trail_long);
        self.trail_short = Some(trail_short);

        let is_flip = self.regime != prev_regime && self.regime != Regime::Neutral;
        if is_flip {
            self.trend_run = 0;
        } else if self.regime != Regime::Neutral {
            let cap = u32::try_from(params.trend_lookback).unwrap_or(u32::MAX);
            self.trend_run = (self.trend_run + 1).min(cap);
        }

        self.last = Some(IndicatorReading {
            timestamp: candle.timestamp,
            close,
            baseline,
            atr,
            vol_percentile,
            multiplier,
            upper_band,
            lower_band,
            trail_long,
            trail_short,
            regime: self.regime,
            is_flip,
            trend_run: self.trend_run,
        });
    }
}

/// Advance `state` over `candles`
///
/// Candles at or before the last processed timestamp are ignored, as are
/// malformed ones. Gaps are not filled.
pub fn update(
    mut state: IndicatorState,
    params: &StrategyParams,
    candles: &[Candle],
) -> IndicatorState {
    for candle in candles {
        if !state.accepts(candle) {
            tracing::debug!(
                timestamp = %candle.timestamp,
                "Ignoring duplicate, out-of-order or malformed candle"
            );
            continue;
        }
        state.step(params, candle);
    }
    state
}
