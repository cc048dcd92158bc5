#![allow(dead_code)]

use async_trait::async_trait;
use autostop::api::{CandleSource, OrderGateway, PaperGateway, StopAck};
use autostop::error::{GatewayError, SourceError, StoreError};
use autostop::execution::{Evaluator, RetryPolicy};
use autostop::store::{MemoryOperationLog, MemoryPositionStore, OperationLog, PositionStore};
use autostop::{
    Candle, ManagedPosition, NewPosition, OperationLogEntry, PositionStatus, Side,
    StrategyParams, Timeframe, VenueAccount,
};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use uuid::Uuid;

pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
}

/// Open time of bar `i` on `timeframe`
pub fn bar(timeframe: Timeframe, i: i64) -> DateTime<Utc> {
    start() + timeframe.duration() * i as i32
}

/// Evaluation time at which bars `0..closed` have closed
pub fn after_bars(timeframe: Timeframe, closed: i64) -> DateTime<Utc> {
    bar(timeframe, closed)
}

/// Steady trend, one bar per `timeframe` from `start()`
pub fn trending_candles(timeframe: Timeframe, n: usize, from: f64, step: f64) -> Vec<Candle> {
    let mut candles = Vec::with_capacity(n);
    let mut prev_close = from;
    for i in 0..n {
        let open = prev_close;
        let close = open + step;
        candles.push(Candle {
            timestamp: bar(timeframe, i as i64),
            open,
            high: open.max(close) + 0.1,
            low: open.min(close) - 0.1,
            close,
            volume: 1000.0,
        });
        prev_close = close;
    }
    candles
}

pub fn account() -> VenueAccount {
    VenueAccount {
        venue: "paper".to_string(),
        account_id: "itest".to_string(),
    }
}

pub fn new_position(symbol: &str, side: Side, timeframe: Timeframe) -> NewPosition {
    NewPosition {
        account: account(),
        symbol: symbol.to_string(),
        side,
        timeframe,
        params: StrategyParams::default(),
        entry_time: start(),
    }
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_backoff: std::time::Duration::from_millis(1),
        max_backoff: std::time::Duration::from_millis(4),
        timeout: std::time::Duration::from_secs(1),
    }
}

// ============================================================================
// Candle sources
// ============================================================================

/// Serves a fixed history per symbol like a venue would: newest `limit`
/// bars, or the first `limit` bars from `since`
#[derive(Default)]
pub struct ScriptedSource {
    series: Mutex<Vec<(String, Vec<Candle>)>>,
    failing: Mutex<HashSet<String>>,
    fetches: AtomicUsize,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_series(self, symbol: &str, candles: Vec<Candle>) -> Self {
        self.series.lock().unwrap().push((symbol.to_string(), candles));
        self
    }

    /// Append newer bars, as if time had moved on
    pub fn extend(&self, symbol: &str, candles: Vec<Candle>) {
        let mut series = self.series.lock().unwrap();
        match series.iter_mut().find(|(s, _)| s == symbol) {
            Some((_, existing)) => existing.extend(candles),
            None => series.push((symbol.to_string(), candles)),
        }
    }

    pub fn fail_symbol(&self, symbol: &str) {
        self.failing.lock().unwrap().insert(symbol.to_string());
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CandleSource for ScriptedSource {
    async fn fetch(
        &self,
        symbol: &str,
        _timeframe: Timeframe,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Candle>, SourceError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().unwrap().contains(symbol) {
            return Err(SourceError::Unavailable(format!("{} feed down", symbol)));
        }

        let series = self.series.lock().unwrap();
        let candles = series
            .iter()
            .find(|(s, _)| s == symbol)
            .map(|(_, c)| c.clone())
            .unwrap_or_default();

        Ok(match since {
            Some(since) => candles
                .into_iter()
                .filter(|c| c.timestamp >= since)
                .take(limit)
                .collect(),
            None => {
                let skip = candles.len().saturating_sub(limit);
                candles.into_iter().skip(skip).collect()
            }
        })
    }
}

/// Closes the position in the store while candles are being fetched
pub struct ClosingSource {
    pub inner: ScriptedSource,
    pub store: Arc<MemoryPositionStore>,
    pub target: Mutex<Option<Uuid>>,
}

#[async_trait]
impl CandleSource for ClosingSource {
    async fn fetch(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Candle>, SourceError> {
        let target = *self.target.lock().unwrap();
        if let Some(id) = target {
            self.store
                .set_status(id, PositionStatus::Closed)
                .await
                .map_err(|e| SourceError::Unavailable(e.to_string()))?;
        }
        self.inner.fetch(symbol, timeframe, since, limit).await
    }
}

// ============================================================================
// Order gateways
// ============================================================================

/// Fails with `error` for the first `failures` calls, then delegates
pub struct FlakyGateway {
    pub inner: PaperGateway,
    pub error: GatewayError,
    pub failures: usize,
    pub calls: AtomicUsize,
}

impl FlakyGateway {
    pub fn new(error: GatewayError, failures: usize) -> Self {
        Self {
            inner: PaperGateway::permissive(),
            error,
            failures,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OrderGateway for FlakyGateway {
    async fn set_stop(
        &self,
        account: &VenueAccount,
        symbol: &str,
        side: Side,
        price: f64,
    ) -> Result<StopAck, GatewayError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(self.error.clone());
        }
        self.inner.set_stop(account, symbol, side, price).await
    }
}

/// Parks every call until released
pub struct BlockingGateway {
    pub inner: PaperGateway,
    pub entered: Notify,
    pub release: Notify,
    pub calls: AtomicUsize,
}

impl BlockingGateway {
    pub fn new() -> Self {
        Self {
            inner: PaperGateway::permissive(),
            entered: Notify::new(),
            release: Notify::new(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OrderGateway for BlockingGateway {
    async fn set_stop(
        &self,
        account: &VenueAccount,
        symbol: &str,
        side: Side,
        price: f64,
    ) -> Result<StopAck, GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        self.release.notified().await;
        self.inner.set_stop(account, symbol, side, price).await
    }
}

/// Tracks how many calls are in progress at once
pub struct CountingGateway {
    pub inner: PaperGateway,
    pub active: AtomicUsize,
    pub peak: AtomicUsize,
}

impl CountingGateway {
    pub fn new() -> Self {
        Self {
            inner: PaperGateway::permissive(),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OrderGateway for CountingGateway {
    async fn set_stop(
        &self,
        account: &VenueAccount,
        symbol: &str,
        side: Side,
        price: f64,
    ) -> Result<StopAck, GatewayError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let result = self.inner.set_stop(account, symbol, side, price).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Applies a manual stop edit to the store during the first call
pub struct EditingGateway {
    pub inner: PaperGateway,
    pub store: Arc<MemoryPositionStore>,
    pub target: Uuid,
    pub manual_stop: f64,
    pub edited: AtomicBool,
}

#[async_trait]
impl OrderGateway for EditingGateway {
    async fn set_stop(
        &self,
        account: &VenueAccount,
        symbol: &str,
        side: Side,
        price: f64,
    ) -> Result<StopAck, GatewayError> {
        let ack = self.inner.set_stop(account, symbol, side, price).await?;
        if !self.edited.swap(true, Ordering::SeqCst) {
            self.store
                .adjust_stop(self.target, Some(self.manual_stop))
                .await
                .map_err(|e| GatewayError::Transient(e.to_string()))?;
        }
        Ok(ack)
    }
}

/// Replaces the position's parameters after the first call was placed
pub struct ParamsEditingGateway {
    pub inner: PaperGateway,
    pub store: Arc<MemoryPositionStore>,
    pub target: Uuid,
    pub params: StrategyParams,
    pub edited: AtomicBool,
}

#[async_trait]
impl OrderGateway for ParamsEditingGateway {
    async fn set_stop(
        &self,
        account: &VenueAccount,
        symbol: &str,
        side: Side,
        price: f64,
    ) -> Result<StopAck, GatewayError> {
        let ack = self.inner.set_stop(account, symbol, side, price).await?;
        if !self.edited.swap(true, Ordering::SeqCst) {
            self.store
                .replace_params(self.target, self.params.clone())
                .await
                .map_err(|e| GatewayError::Transient(e.to_string()))?;
        }
        Ok(ack)
    }
}

// ============================================================================
// Operation logs
// ============================================================================

pub struct FailingLog;

#[async_trait]
impl OperationLog for FailingLog {
    async fn append(&self, _entry: &OperationLogEntry) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("log database down".to_string()))
    }

    async fn recent(
        &self,
        _position_id: Uuid,
        _limit: usize,
    ) -> Result<Vec<OperationLogEntry>, StoreError> {
        Err(StoreError::Unavailable("log database down".to_string()))
    }
}

/// Never completes an append
pub struct HangingLog;

#[async_trait]
impl OperationLog for HangingLog {
    async fn append(&self, _entry: &OperationLogEntry) -> Result<(), StoreError> {
        std::future::pending().await
    }

    async fn recent(
        &self,
        _position_id: Uuid,
        _limit: usize,
    ) -> Result<Vec<OperationLogEntry>, StoreError> {
        Ok(Vec::new())
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub store: Arc<MemoryPositionStore>,
    pub log: Arc<MemoryOperationLog>,
    pub evaluator: Evaluator,
}

pub fn harness(source: Arc<dyn CandleSource>, gateway: Arc<dyn OrderGateway>) -> Harness {
    let store = Arc::new(MemoryPositionStore::new());
    harness_with_store(store, source, gateway)
}

pub fn harness_with_store(
    store: Arc<MemoryPositionStore>,
    source: Arc<dyn CandleSource>,
    gateway: Arc<dyn OrderGateway>,
) -> Harness {
    let log = Arc::new(MemoryOperationLog::new());
    let evaluator =
        Evaluator::new(store.clone(), log.clone(), source, gateway).with_retry(fast_retry());
    Harness {
        store,
        log,
        evaluator,
    }
}

impl Harness {
    pub async fn create(&self, new: NewPosition) -> ManagedPosition {
        self.store.create(new).await.unwrap()
    }

    pub async fn read(&self, id: Uuid) -> ManagedPosition {
        self.store.read(id).await.unwrap()
    }
}
