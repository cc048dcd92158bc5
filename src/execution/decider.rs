use serde::{Deserialize, Serialize};
use std::fmt;

use crate::indicators::{IndicatorReading, InsufficientHistory};
use crate::models::{ManagedPosition, Outcome};

/// How automated ticks treat a stop that was edited by hand
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum ManualOverridePolicy {
    /// Ratchet from the manual value on the very next tick
    #[default]
    Retighten,
    /// Leave the manual stop alone for `bars` closed bars
    Hold { bars: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Delay,
    InsufficientHistory,
    ManualHold,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Delay => "delay",
            SkipReason::InsufficientHistory => "insufficient-history",
            SkipReason::ManualHold => "manual-hold",
        }
    }

    pub fn outcome(&self) -> Outcome {
        match self {
            SkipReason::Delay => Outcome::SkippedDelay,
            SkipReason::InsufficientHistory => Outcome::SkippedInsufficientHistory,
            SkipReason::ManualHold => Outcome::SkippedManualHold,
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    NoChange,
    Skip(SkipReason),
    NewStop(f64),
}

/// Ratchet decision for one position on one bar. No I/O.
#[derive(Debug, Clone, Copy, Default)]
pub struct StopDecider {
    policy: ManualOverridePolicy,
}

impl StopDecider {
    pub fn new(policy: ManualOverridePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> ManualOverridePolicy {
        self.policy
    }

    /// Stop price the indicator implies for this position, before the ratchet
    pub fn candidate(&self, position: &ManagedPosition, reading: &IndicatorReading) -> Option<f64> {
        let band = reading.stop_band(position.side);
        let candidate = position.side.apply_offset(band, position.params.sl_offset);
        (candidate.is_finite() && candidate > 0.0).then_some(candidate)
    }

    pub fn decide(
        &self,
        position: &ManagedPosition,
        reading: Result<&IndicatorReading, InsufficientHistory>,
        bars_since_entry: i64,
    ) -> Decision {
        // Check 1: entry delay
        if bars_since_entry < i64::from(position.params.delay_bars) {
            return Decision::Skip(SkipReason::Delay);
        }

        // Check 2: enough bars to trust the bands
        let reading = match reading {
            Ok(reading) => reading,
            Err(_) => return Decision::Skip(SkipReason::InsufficientHistory),
        };

        // Check 3: recent manual edit under the hold policy
        if let ManualOverridePolicy::Hold { bars } = self.policy {
            if let Some(since) = position.bars_since_manual_adjustment(reading.timestamp) {
                if since < i64::from(bars) {
                    return Decision::Skip(SkipReason::ManualHold);
                }
            }
        }

        // Check 4: ratchet against the stop the store holds right now
        match self.candidate(position, reading) {
            Some(candidate) if position.side.improves(candidate, position.current_stop) => {
                Decision::NewStop(candidate)
            }
            _ => Decision::NoChange,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewPosition, Regime, Side, StrategyParams, Timeframe, VenueAccount};
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use uuid::Uuid;

    fn entry() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    }

    fn position(side: Side, delay_bars: u32, current_stop: Option<f64>) -> ManagedPosition {
        let mut position = NewPosition {
            account: VenueAccount {
                venue: "binance".to_string(),
                account_id: "test".to_string(),
            },
            symbol: "BTC/USDT:USDT".to_string(),
            side,
            timeframe: Timeframe::M15,
            params: StrategyParams {
                delay_bars,
                ..Default::default()
            },
            entry_time: entry(),
        }
        .into_position(Uuid::new_v4(), entry());
        position.current_stop = current_stop;
        position
    }

    fn reading(bar: i64, regime: Regime, trail_long: f64, trail_short: f64) -> IndicatorReading {
        IndicatorReading {
            timestamp: entry() + Duration::minutes(15 * bar),
            close: (trail_long + trail_short) / 2.0,
            baseline: (trail_long + trail_short) / 2.0,
            atr: 1.0,
            vol_percentile: 0.5,
            multiplier: 2.0,
            upper_band: trail_short,
            lower_band: trail_long,
            trail_long,
            trail_short,
            regime,
            is_flip: false,
            trend_run: 3,
        }
    }

    #[test]
    fn test_long_example_delay_then_ratchet() {
        let decider = StopDecider::default();
        let mut pos = position(Side::Long, 2, None);

        for bar in 0..2 {
            let r = reading(bar, Regime::Bullish, 99.5, 110.0);
            assert_eq!(decider.decide(&pos, Ok(&r), bar), Decision::Skip(SkipReason::Delay));
        }

        let r = reading(2, Regime::Bullish, 99.5, 110.0);
        assert_eq!(decider.decide(&pos, Ok(&r), 2), Decision::NewStop(99.5));
        pos.current_stop = Some(99.5);

        let r = reading(3, Regime::Bullish, 99.0, 110.0);
        assert_eq!(decider.decide(&pos, Ok(&r), 3), Decision::NoChange);
    }

    #[test]
    fn test_short_example_only_tightens_down() {
        let decider = StopDecider::default();
        let pos = position(Side::Short, 0, Some(105.0));

        let r = reading(5, Regime::Bearish, 90.0, 106.0);
        assert_eq!(decider.decide(&pos, Ok(&r), 5), Decision::NoChange);

        let r = reading(5, Regime::Bearish, 90.0, 104.0);
        assert_eq!(decider.decide(&pos, Ok(&r), 5), Decision::NewStop(104.0));
    }

    #[test]
    fn test_delay_wins_over_any_indicator_value() {
        let decider = StopDecider::default();
        let pos = position(Side::Long, 5, None);
        let r = reading(1, Regime::Bullish, 1_000.0, 2_000.0);

        assert_eq!(
            decider.decide(&pos, Ok(&r), 4),
            Decision::Skip(SkipReason::Delay)
        );
        let missing = Err(InsufficientHistory { have: 3, need: 20 });
        assert_eq!(
            decider.decide(&pos, missing, 4),
            Decision::Skip(SkipReason::Delay)
        );
    }

    #[test]
    fn test_insufficient_history_is_a_skip() {
        let decider = StopDecider::default();
        let pos = position(Side::Long, 0, None);
        let missing = Err(InsufficientHistory { have: 10, need: 20 });

        assert_eq!(
            decider.decide(&pos, missing, 10),
            Decision::Skip(SkipReason::InsufficientHistory)
        );
    }

    #[test]
    fn test_repeat_decision_after_commit_is_no_change() {
        let decider = StopDecider::default();
        let mut pos = position(Side::Long, 0, None);
        let r = reading(4, Regime::Bullish, 101.0, 120.0);

        let Decision::NewStop(stop) = decider.decide(&pos, Ok(&r), 4) else {
            panic!("expected a new stop");
        };
        pos.current_stop = Some(stop);

        assert_eq!(decider.decide(&pos, Ok(&r), 4), Decision::NoChange);
        assert_eq!(decider.decide(&pos, Ok(&r), 4), Decision::NoChange);
    }

    #[test]
    fn test_offset_is_applied_by_side() {
        let decider = StopDecider::default();

        let mut long = position(Side::Long, 0, None);
        long.params.sl_offset = 0.5;
        let r = reading(1, Regime::Bullish, 100.0, 110.0);
        assert_eq!(decider.decide(&long, Ok(&r), 1), Decision::NewStop(99.5));

        let mut short = position(Side::Short, 0, None);
        short.params.sl_offset = 0.5;
        let r = reading(1, Regime::Bearish, 90.0, 110.0);
        assert_eq!(decider.decide(&short, Ok(&r), 1), Decision::NewStop(110.5));
    }

    #[test]
    fn test_opposing_regime_pulls_stop_to_regime_band() {
        let decider = StopDecider::default();
        let pos = position(Side::Long, 0, Some(95.0));
        // Bearish flip: the long follows the upper trail, which tightens
        let r = reading(8, Regime::Bearish, 90.0, 102.0);

        assert_eq!(decider.decide(&pos, Ok(&r), 8), Decision::NewStop(102.0));
    }

    #[test]
    fn test_non_finite_candidate_is_no_change() {
        let decider = StopDecider::default();
        let pos = position(Side::Long, 0, None);
        let r = reading(1, Regime::Bullish, f64::NAN, 110.0);

        assert_eq!(decider.decide(&pos, Ok(&r), 1), Decision::NoChange);
    }

    #[test]
    fn test_hold_policy_respects_recent_manual_edit() {
        let decider = StopDecider::new(ManualOverridePolicy::Hold { bars: 3 });
        let mut pos = position(Side::Long, 0, Some(90.0));
        pos.manual_adjusted_at = Some(entry() + Duration::minutes(15 * 10));

        let r = reading(12, Regime::Bullish, 99.0, 120.0);
        assert_eq!(
            decider.decide(&pos, Ok(&r), 12),
            Decision::Skip(SkipReason::ManualHold)
        );

        let r = reading(13, Regime::Bullish, 99.0, 120.0);
        assert_eq!(decider.decide(&pos, Ok(&r), 13), Decision::NewStop(99.0));
    }

    #[test]
    fn test_retighten_policy_ratchets_from_manual_value() {
        let decider = StopDecider::new(ManualOverridePolicy::Retighten);
        let mut pos = position(Side::Long, 0, Some(100.0));
        pos.manual_adjusted_at = Some(entry() + Duration::minutes(15 * 10));

        // Manual tightening above the band is kept
        let r = reading(11, Regime::Bullish, 99.0, 120.0);
        assert_eq!(decider.decide(&pos, Ok(&r), 11), Decision::NoChange);

        // Manual loosening is re-tightened straight away
        pos.current_stop = Some(80.0);
        assert_eq!(decider.decide(&pos, Ok(&r), 11), Decision::NewStop(99.0));
    }
}
