use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use governor::{Quota, RateLimiter};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use super::CandleSource;
use crate::error::SourceError;
use crate::models::{Candle, Timeframe};

pub const BINANCE_FUTURES_API_BASE: &str = "https://fapi.binance.com";
const KLINES_PATH: &str = "/fapi/v1/klines";
const MAX_KLINES_PER_REQUEST: usize = 1500;
const INVALID_SYMBOL_CODE: i64 = -1121;

// Type alias for the rate limiter to simplify signatures
type BinanceRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Error body returned by the venue on 4xx
#[derive(Debug, Deserialize)]
pub(super) struct ApiError {
    pub(super) code: i64,
    pub(super) msg: String,
}

/// Binance USDⓈ-M futures klines client
///
/// Cloneable; clones share the HTTP pool and rate limiter.
#[derive(Clone)]
pub struct BinanceClient {
    client: Client,
    base_url: String,
    rate_limiter: Arc<BinanceRateLimiter>,
}

/// `BTC/USDT:USDT` → `BTCUSDT`; already-normalised symbols pass through
pub fn normalize_symbol(symbol: &str) -> String {
    let pair = symbol.split(':').next().unwrap_or(symbol);
    pair.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_uppercase()
}

/// Native kline interval used to serve a timeframe
fn native_interval(timeframe: Timeframe) -> &'static str {
    match timeframe {
        // No native 10m interval; built from 5m bars
        Timeframe::M10 => "5m",
        other => other.as_str(),
    }
}

impl BinanceClient {
    pub fn new(base_url: &str, requests_per_minute: u32) -> Result<Self, SourceError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| SourceError::Unavailable(format!("failed to build HTTP client: {}", e)))?;

        let rpm = NonZeroU32::new(requests_per_minute).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_minute(rpm)));

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            rate_limiter,
        })
    }

    pub(super) fn http(&self) -> &Client {
        &self.client
    }

    pub(super) fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Wait for a request slot shared by every clone
    pub(super) async fn throttle(&self) {
        self.rate_limiter.until_ready().await;
    }

    async fn fetch_klines(
        &self,
        symbol: &str,
        interval: &str,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Candle>, SourceError> {
        let url = format!("{}{}", self.base_url, KLINES_PATH);
        let mut query = vec![
            ("symbol", symbol.to_string()),
            ("interval", interval.to_string()),
            ("limit", limit.clamp(1, MAX_KLINES_PER_REQUEST).to_string()),
        ];
        if let Some(since) = since {
            query.push(("startTime", since.timestamp_millis().to_string()));
        }

        // Wait for rate limiter
        self.rate_limiter.until_ready().await;

        let response = self
            .client
            .get(&url)
            .query(&query)
            .send()
            .await
            .map_err(|e| SourceError::Unavailable(format!("klines request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_error(status, symbol, &body));
        }

        let rows: Vec<Vec<Value>> = response
            .json()
            .await
            .map_err(|e| SourceError::Unavailable(format!("malformed klines body: {}", e)))?;

        let mut candles: Vec<Candle> = rows.iter().filter_map(|row| parse_kline(row)).collect();
        candles.sort_by_key(|c| c.timestamp);
        candles.dedup_by_key(|c| c.timestamp);

        if candles.len() < rows.len() {
            tracing::debug!(
                "Dropped {} unparseable or duplicate klines for {}",
                rows.len() - candles.len(),
                symbol
            );
        }

        Ok(candles)
    }
}

fn map_error(status: StatusCode, symbol: &str, body: &str) -> SourceError {
    if status == StatusCode::BAD_REQUEST {
        if let Ok(err) = serde_json::from_str::<ApiError>(body) {
            if err.code == INVALID_SYMBOL_CODE {
                return SourceError::InvalidSymbol(symbol.to_string());
            }
            return SourceError::Unavailable(format!("venue error {}: {}", err.code, err.msg));
        }
    }
    SourceError::Unavailable(format!("venue returned {}: {}", status, body))
}

/// `[openTime, open, high, low, close, volume, closeTime, ...]`
fn parse_kline(row: &[Value]) -> Option<Candle> {
    fn number(value: &Value) -> Option<f64> {
        match value {
            Value::String(s) => s.parse().ok(),
            Value::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    if row.len() < 6 {
        return None;
    }
    let open_ms = row[0].as_i64()?;
    Some(Candle {
        timestamp: Utc.timestamp_millis_opt(open_ms).single()?,
        open: number(&row[1])?,
        high: number(&row[2])?,
        low: number(&row[3])?,
        close: number(&row[4])?,
        volume: number(&row[5])?,
    })
}

/// Merge finer candles into `timeframe` bars
///
/// A leading group that does not start on its bar open is dropped; the
/// trailing group may be incomplete and is left for closed-bar filtering.
pub fn aggregate(candles: &[Candle], timeframe: Timeframe) -> Vec<Candle> {
    let mut groups: BTreeMap<DateTime<Utc>, Vec<&Candle>> = BTreeMap::new();
    for candle in candles {
        groups
            .entry(timeframe.bar_open(candle.timestamp))
            .or_default()
            .push(candle);
    }

    let mut out = Vec::with_capacity(groups.len());
    for (i, (open_time, parts)) in groups.into_iter().enumerate() {
        let (Some(first), Some(last)) = (parts.first(), parts.last()) else {
            continue;
        };
        if i == 0 && first.timestamp != open_time {
            continue;
        }
        out.push(Candle {
            timestamp: open_time,
            open: first.open,
            high: parts.iter().map(|c| c.high).fold(f64::MIN, f64::max),
            low: parts.iter().map(|c| c.low).fold(f64::MAX, f64::min),
            close: last.close,
            volume: parts.iter().map(|c| c.volume).sum(),
        });
    }
    out
}

#[async_trait]
impl CandleSource for BinanceClient {
    async fn fetch(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Candle>, SourceError> {
        let venue_symbol = normalize_symbol(symbol);
        let interval = native_interval(timeframe);

        if interval == timeframe.as_str() {
            return self.fetch_klines(&venue_symbol, interval, since, limit).await;
        }

        let ratio = (timeframe.minutes() / 5).max(1) as usize;
        // One extra fine bar so a misaligned head can be dropped
        let fine = self
            .fetch_klines(&venue_symbol, interval, since, limit * ratio + 1)
            .await?;
        let mut bars = aggregate(&fine, timeframe);
        if since.is_none() && bars.len() > limit {
            bars.drain(..bars.len() - limit);
        }
        Ok(bars)
    }
}
