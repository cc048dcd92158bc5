use serde::{Deserialize, Serialize};

/// Exponential Moving Average (EMA), SMA-seeded
///
/// The first `period` values are averaged to seed the EMA, then
/// `ema = (price - ema) * k + ema` with `k = 2 / (period + 1)`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Ema {
    seed_sum: f64,
    seed_count: usize,
    value: Option<f64>,
}

impl Ema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&mut self, price: f64, period: usize) -> Option<f64> {
        let period = period.max(1);

        match self.value {
            Some(ema) => {
                let multiplier = 2.0 / (period as f64 + 1.0);
                self.value = Some((price - ema) * multiplier + ema);
            }
            None => {
                self.seed_sum += price;
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
