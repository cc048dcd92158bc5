// Technical indicators module
// Implements ATR, EMA, volatility percentile and the adaptive SuperTrend

pub mod atr;
pub mod moving_average;
pub mod supertrend;
pub mod volatility;

pub use atr::{true_range, WilderAtr};
pub use moving_average::Ema;
pub use supertrend::{update, IndicatorReading, IndicatorState, InsufficientHistory};
pub use volatility::{dynamic_multiplier, percentile_rank};
