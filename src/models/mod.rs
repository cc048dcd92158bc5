use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::ParamError;

/// OHLCV candlestick data
///
/// `timestamp` is the bar open time (UTC). A bar is closed once
/// `timestamp + timeframe` has passed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Prices are finite and positive and the high/low envelope holds
    pub fn is_well_formed(&self) -> bool {
        let prices = [self.open, self.high, self.low, self.close];
        prices.iter().all(|p| p.is_finite() && *p > 0.0)
            && self.volume.is_finite()
            && self.volume >= 0.0
            && self.high >= self.low
            && self.high >= self.open.max(self.close)
            && self.low <= self.open.min(self.close)
    }
}

/// Position side on the venue
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "long",
            Side::Short => "short",
        }
    }

    /// True if `candidate` protects more than `current`
    ///
    /// Longs trail up, shorts trail down. No current stop means any
    /// candidate is an improvement.
    pub fn improves(&self, candidate: f64, current: Option<f64>) -> bool {
        match current {
            None => true,
            Some(current) => match self {
                Side::Long => candidate > current,
                Side::Short => candidate < current,
            },
        }
    }

    /// Push a band value further away from price by `offset`
    pub fn apply_offset(&self, band: f64, offset: f64) -> f64 {
        match self {
            Side::Long => band - offset,
            Side::Short => band + offset,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "long" => Ok(Side::Long),
            "short" => Ok(Side::Short),
            other => Err(format!("unknown side: {}", other)),
        }
    }
}

/// Candle timeframe a position is evaluated on
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Timeframe {
    #[serde(rename = "10m", alias = "10min")]
    M10,
    #[serde(rename = "15m", alias = "15min")]
    M15,
    #[serde(rename = "30m", alias = "30min")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
}

impl Timeframe {
    pub const ALL: [Timeframe; 5] = [
        Timeframe::M10,
        Timeframe::M15,
        Timeframe::M30,
        Timeframe::H1,
        Timeframe::H4,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M10 => "10m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
        }
    }

    pub fn minutes(&self) -> i64 {
        match self {
            Timeframe::M10 => 10,
            Timeframe::M15 => 15,
            Timeframe::M30 => 30,
            Timeframe::H1 => 60,
            Timeframe::H4 => 240,
        }
    }

    pub fn seconds(&self) -> i64 {
        self.minutes() * 60
    }

    pub fn duration(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.minutes())
    }

    /// Epoch-aligned index of the bar containing `ts`
    pub fn bar_index(&self, ts: DateTime<Utc>) -> i64 {
        ts.timestamp().div_euclid(self.seconds())
    }

    /// Open time of the bar containing `ts`
    pub fn bar_open(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let secs = self.bar_index(ts) * self.seconds();
        Utc.timestamp_opt(secs, 0).single().unwrap_or(ts)
    }

    /// True once the bar opened at `open` has fully elapsed at `now`
    pub fn is_closed(&self, open: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        open + self.duration() <= now
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "10m" | "10min" => Ok(Timeframe::M10),
            "15m" | "15min" => Ok(Timeframe::M15),
            "30m" | "30min" => Ok(Timeframe::M30),
            "1h" | "60m" => Ok(Timeframe::H1),
            "4h" | "240m" => Ok(Timeframe::H4),
            other => Err(format!("unsupported timeframe: {}", other)),
        }
    }
}

/// Lifecycle of a managed position
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Active,
    Paused,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Active => "active",
            PositionStatus::Paused => "paused",
            PositionStatus::Closed => "closed",
        }
    }
}

impl FromStr for PositionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(PositionStatus::Active),
            "paused" => Ok(PositionStatus::Paused),
            // "stopped" is what older rows used for closed tasks
            "closed" | "stopped" => Ok(PositionStatus::Closed),
            other => Err(format!("unknown position status: {}", other)),
        }
    }
}

/// Confirmed trend regime of the indicator
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Regime {
    Bullish,
    Bearish,
    #[default]
    Neutral,
}

impl Regime {
    pub fn as_i16(&self) -> i16 {
        match self {
            Regime::Bullish => 1,
            Regime::Bearish => -1,
            Regime::Neutral => 0,
        }
    }

    pub fn from_i16(value: i16) -> Self {
        match value {
            v if v > 0 => Regime::Bullish,
            v if v < 0 => Regime::Bearish,
            _ => Regime::Neutral,
        }
    }

    /// Which side this regime favours, if any
    pub fn side(&self) -> Option<Side> {
        match self {
            Regime::Bullish => Some(Side::Long),
            Regime::Bearish => Some(Side::Short),
            Regime::Neutral => None,
        }
    }
}

/// Strategy parameters for one managed position
///
/// Replaced as a whole when edited; never patched field by field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StrategyParams {
    pub ema_len: usize,
    pub atr_len: usize,
    pub base_mult: f64,
    pub vol_lookback: usize,
    pub vol_power: f64,
    pub trend_lookback: usize,
    pub trend_impact: f64,
    pub mult_min: f64,
    pub mult_max: f64,
    pub confirm_bars: u32,
    pub sl_offset: f64,
    pub delay_bars: u32,
}

impl Default for StrategyParams {
    fn default() -> Self {
        Self {
            ema_len: 8,
            atr_len: 14,
            base_mult: 2.0,
            vol_lookback: 20,
            vol_power: 1.0,
            trend_lookback: 25,
            trend_impact: 0.4,
            mult_min: 1.0,
            mult_max: 4.0,
            confirm_bars: 1,
            sl_offset: 0.0,
            delay_bars: 0,
        }
    }
}

impl StrategyParams {
    /// Bars of history needed before the indicator produces a reading
    pub fn warmup_bars(&self) -> usize {
        self.atr_len.max(self.ema_len).max(self.vol_lookback)
    }

    pub fn validate(&self) -> Result<(), ParamError> {
        fn at_least(field: &'static str, value: f64, min: f64) -> Result<(), ParamError> {
            if !value.is_finite() || value < min {
                return Err(ParamError::OutOfRange {
                    field,
                    value,
                    expected: format!(">= {}", min),
                });
            }
            Ok(())
        }

        at_least("ema_len", self.ema_len as f64, 2.0)?;
        at_least("atr_len", self.atr_len as f64, 1.0)?;
        at_least("base_mult", self.base_mult, 0.1)?;
        at_least("vol_lookback", self.vol_lookback as f64, 2.0)?;
        at_least("vol_power", self.vol_power, 0.1)?;
        at_least("trend_lookback", self.trend_lookback as f64, 2.0)?;
        at_least("mult_min", self.mult_min, 0.1)?;
        at_least("mult_max", self.mult_max, 0.5)?;
        at_least("confirm_bars", self.confirm_bars as f64, 1.0)?;
        at_least("sl_offset", self.sl_offset, 0.0)?;

        if !(0.0..=1.0).contains(&self.trend_impact) {
            return Err(ParamError::OutOfRange {
                field: "trend_impact",
                value: self.trend_impact,
                expected: "between 0 and 1".to_string(),
            });
        }
        if self.mult_min > self.mult_max {
            return Err(ParamError::InvertedBounds {
                min: self.mult_min,
                max: self.mult_max,
            });
        }
        Ok(())
    }
}

/// Venue account a position lives on
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct VenueAccount {
    pub venue: String,
    pub account_id: String,
}

impl fmt::Display for VenueAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.venue, self.account_id)
    }
}

/// A position whose stop is managed automatically
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManagedPosition {
    pub id: Uuid,
    pub account: VenueAccount,
    pub symbol: String,
    pub side: Side,
    pub timeframe: Timeframe,
    pub params: StrategyParams,
    pub status: PositionStatus,
    pub entry_time: DateTime<Utc>,
    pub entry_bar_index: i64,
    pub current_stop: Option<f64>,
    pub last_evaluated_bar: Option<DateTime<Utc>>,
    pub last_regime: Regime,
    pub last_calculated_stop: Option<f64>,
    pub manual_adjusted_at: Option<DateTime<Utc>>,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl ManagedPosition {
    pub fn is_active(&self) -> bool {
        self.status == PositionStatus::Active
    }

    /// Closed bars between the entry bar and `bar`
    pub fn bars_since_entry(&self, bar: DateTime<Utc>) -> i64 {
        self.timeframe.bar_index(bar) - self.entry_bar_index
    }

    /// Closed bars between the last manual stop edit and `bar`
    pub fn bars_since_manual_adjustment(&self, bar: DateTime<Utc>) -> Option<i64> {
        self.manual_adjusted_at
            .map(|at| self.timeframe.bar_index(bar) - self.timeframe.bar_index(at))
    }
}

/// Request to start managing a position
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPosition {
    pub account: VenueAccount,
    pub symbol: String,
    pub side: Side,
    pub timeframe: Timeframe,
    pub params: StrategyParams,
    pub entry_time: DateTime<Utc>,
}

impl NewPosition {
    /// Build the initial record: active, no stop yet, version 0
    pub fn into_position(self, id: Uuid, now: DateTime<Utc>) -> ManagedPosition {
        let entry_bar_index = self.timeframe.bar_index(self.entry_time);
        ManagedPosition {
            id,
            account: self.account,
            symbol: self.symbol,
            side: self.side,
            timeframe: self.timeframe,
            params: self.params,
            status: PositionStatus::Active,
            entry_time: self.entry_time,
            entry_bar_index,
            current_stop: None,
            last_evaluated_bar: None,
            last_regime: Regime::Neutral,
            last_calculated_stop: None,
            manual_adjusted_at: None,
            version: 0,
            updated_at: now,
        }
    }
}

/// Result of one evaluation, as recorded in the operation log
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Outcome {
    #[serde(rename = "applied")]
    Applied,
    #[serde(rename = "skipped-no-change")]
    SkippedNoChange,
    #[serde(rename = "skipped-delay")]
    SkippedDelay,
    #[serde(rename = "skipped-insufficient-history")]
    SkippedInsufficientHistory,
    #[serde(rename = "skipped-manual-hold")]
    SkippedManualHold,
    #[serde(rename = "skipped-overlap")]
    SkippedOverlap,
    #[serde(rename = "skipped-inactive")]
    SkippedInactive,
    #[serde(rename = "failed")]
    Failed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Applied => "applied",
            Outcome::SkippedNoChange => "skipped-no-change",
            Outcome::SkippedDelay => "skipped-delay",
            Outcome::SkippedInsufficientHistory => "skipped-insufficient-history",
            Outcome::SkippedManualHold => "skipped-manual-hold",
            Outcome::SkippedOverlap => "skipped-overlap",
            Outcome::SkippedInactive => "skipped-inactive",
            Outcome::Failed => "failed",
        }
    }

    pub fn is_skip(&self) -> bool {
        !matches!(self, Outcome::Applied | Outcome::Failed)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            Outcome::Applied,
            Outcome::SkippedNoChange,
            Outcome::SkippedDelay,
            Outcome::SkippedInsufficientHistory,
            Outcome::SkippedManualHold,
            Outcome::SkippedOverlap,
            Outcome::SkippedInactive,
            Outcome::Failed,
        ]
        .into_iter()
        .find(|o| o.as_str() == s)
        .ok_or_else(|| format!("unknown outcome: {}", s))
    }
}

/// Append-only audit record of an attempted or applied stop change
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationLogEntry {
    pub id: Uuid,
    pub position_id: Uuid,
    pub symbol: String,
    pub previous_stop: Option<f64>,
    pub proposed_stop: Option<f64>,
    pub outcome: Outcome,
    pub reason: Option<String>,
    pub bar_timestamp: Option<DateTime<Utc>>,
    pub recorded_at: DateTime<Utc>,
}

impl OperationLogEntry {
    pub fn new(position: &ManagedPosition, outcome: Outcome) -> Self {
        Self {
            id: Uuid::new_v4(),
            position_id: position.id,
            symbol: position.symbol.clone(),
            previous_stop: position.current_stop,
            proposed_stop: None,
            outcome,
            reason: None,
            bar_timestamp: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_proposed(mut self, proposed: Option<f64>) -> Self {
        self.proposed_stop = proposed;
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn at_bar(mut self, bar: Option<DateTime<Utc>>) -> Self {
        self.bar_timestamp = bar;
        self
    }
}
