/// Average True Range (ATR) indicator
///
/// Measures market volatility by calculating the average of true ranges over a period.
/// True Range is the greatest of:
/// - Current High - Current Low
/// - Abs(Current High - Previous Close)
/// - Abs(Current Low - Previous Close)
///
/// The first bar has no previous close, so its true range is just High - Low.
///
/// Uses Wilder's smoothing, seeded by a simple average of the first `period`
/// true ranges.
use serde::{Deserialize, Serialize};

use crate::models::Candle;

/// True range of a candle given the previous close
pub fn true_range(candle: &Candle, prev_close: Option<f64>) -> f64 {
    let range = candle.high - candle.low;
    match prev_close {
        Some(prev_close) => range
            .max((candle.high - prev_close).abs())
            .max((candle.low - prev_close).abs()),
        None => range,
    }
}

/// Incremental Wilder-smoothed ATR
///
/// Carries only what the next bar needs, so it can be threaded through
/// successive updates and produce the same value as a full recompute.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WilderAtr {
    seed_sum: f64,
    seed_count: usize,
    value: Option<f64>,
}

impl WilderAtr {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one true range value, returning the ATR once seeded
    pub fn next(&mut self, tr: f64, period: usize) -> Option<f64> {
        let period = period.max(1);

        match self.value {
            Some(atr) => {
                // ATR_t = ATR_{t-1} + (TR_t - ATR_{t-1}) / period
                let atr = atr + (tr - atr) / period as f64;
                self.value = Some(atr);
            }
            None => {
                self.seed_sum += tr;
                self.seed_count += 1;
                if self.seed_count >= period {
                    self.value = Some(self.seed_sum / period as f64);
                }
            }
        }

        self.value
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn create_test_candles(prices: &[(f64, f64, f64, f64)]) -> Vec<Candle> {
        prices
            .iter()
            .enumerate()
            .map(|(i, &(open, high, low, close))| Candle {
                timestamp: Utc.timestamp_opt(i as i64 * 3600, 0).unwrap(),
                open,
                high,
                low,
                close,
                volume: 1000.0,
            })
            .collect()
    }

    fn run_atr(candles: &[Candle], period: usize) -> Option<f64> {
        let mut atr = WilderAtr::new();
        let mut prev_close = None;
        let mut last = None;
        for candle in candles {
            last = atr.next(true_range(candle, prev_close), period);
            prev_close = Some(candle.close);
        }
        last
    }

    #[test]
    fn test_true_range_uses_gap_from_previous_close() {
        let candles =
            create_test_candles(&[(100.0, 101.0, 99.0, 100.0), (110.0, 112.0, 109.0, 111.0)]);

        assert_eq!(true_range(&candles[0], None), 2.0);
        // Gap up: high - prev close dominates
        assert_eq!(true_range(&candles[1], Some(100.0)), 12.0);
    }

    #[test]
    fn test_calculate_atr_low_volatility() {
        let prices = vec![(100.0, 101.0, 99.0, 100.0); 15];
        let candles = create_test_candles(&prices);

        let atr = run_atr(&candles, 14);
        assert!(atr.is_some());
        // ATR should be 2.0 (high-low range)
        assert!((atr.unwrap() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_calculate_atr_high_volatility() {
        let high_vol_prices = vec![
            (100.0, 105.0, 95.0, 102.0),
            (102.0, 110.0, 98.0, 105.0),
            (105.0, 108.0, 92.0, 95.0),
            (95.0, 103.0, 88.0, 100.0),
            (100.0, 115.0, 97.0, 110.0),
            (110.0, 112.0, 95.0, 98.0),
            (98.0, 108.0, 90.0, 105.0),
            (105.0, 120.0, 100.0, 115.0),
            (115.0, 118.0, 105.0, 110.0),
            (110.0, 125.0, 108.0, 120.0),
            (120.0, 130.0, 115.0, 125.0),
            (125.0, 128.0, 110.0, 115.0),
            (115.0, 122.0, 105.0, 118.0),
            (118.0, 130.0, 115.0, 125.0),
            (125.0, 135.0, 120.0, 130.0),
        ];

        let candles = create_test_candles(&high_vol_prices);
        let atr = run_atr(&candles, 14);

        assert!(atr.unwrap() > 10.0);
    }

    #[test]
    fn test_insufficient_data() {
        let candles =
            create_test_candles(&[(100.0, 101.0, 99.0, 100.0), (100.0, 101.0, 99.0, 100.0)]);
        assert!(run_atr(&candles, 14).is_none());
    }

    #[test]
    fn test_seed_then_wilder_smoothing() {
        let mut atr = WilderAtr::new();
        assert_eq!(atr.next(2.0, 2), None);
        assert_eq!(atr.next(4.0, 2), Some(3.0));
        // 3 + (5 - 3) / 2
        assert_eq!(atr.next(5.0, 2), Some(4.0));
        assert_eq!(atr.value(), Some(4.0));
    }
}
