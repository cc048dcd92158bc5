use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::decider::{Decision, StopDecider};
use super::indicator_cache::IndicatorCache;
use super::retry::RetryPolicy;
use crate::api::{CandleSource, OrderGateway};
use crate::error::{GatewayError, SourceError, StoreError};
use crate::indicators::{update, IndicatorState};
use crate::models::{ManagedPosition, OperationLogEntry, Outcome, PositionStatus};
use crate::store::{CommitResult, OperationLog, PositionStore, StopCommit};

const DEFAULT_HISTORY_BARS: usize = 200;
const DEFAULT_LOG_TIMEOUT: Duration = Duration::from_secs(2);
/// Longest gap one fetch bridges; M10 pays double in 5m klines
const MAX_CATCHUP_BARS: i64 = 500;

/// Result of one read-decide-commit pass
enum Attempt {
    Done(Outcome),
    /// Store moved underneath us; `placed` is a stop already sent to the venue
    Conflict { placed: Option<f64> },
}

/// One position evaluation cycle
///
/// fetch candles → update indicator → decide → set stop on the venue →
/// conditional commit → operation log. The store is only written after the
/// venue acknowledged, and only if nobody else wrote in between.
#[derive(Clone)]
pub struct Evaluator {
    store: Arc<dyn PositionStore>,
    log: Arc<dyn OperationLog>,
    source: Arc<dyn CandleSource>,
    gateway: Arc<dyn OrderGateway>,
    decider: StopDecider,
    retry: RetryPolicy,
    cache: IndicatorCache,
    history_bars: usize,
    log_timeout: Duration,
}

impl Evaluator {
    pub fn new(
        store: Arc<dyn PositionStore>,
        log: Arc<dyn OperationLog>,
        source: Arc<dyn CandleSource>,
        gateway: Arc<dyn OrderGateway>,
    ) -> Self {
        Self {
            store,
            log,
            source,
            gateway,
            decider: StopDecider::default(),
            retry: RetryPolicy::default(),
            cache: IndicatorCache::new(),
            history_bars: DEFAULT_HISTORY_BARS,
            log_timeout: DEFAULT_LOG_TIMEOUT,
        }
    }

    pub fn with_decider(mut self, decider: StopDecider) -> Self {
        self.decider = decider;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_history_bars(mut self, history_bars: usize) -> Self {
        self.history_bars = history_bars;
        self
    }

    pub fn with_log_timeout(mut self, log_timeout: Duration) -> Self {
        self.log_timeout = log_timeout;
        self
    }

    pub fn store(&self) -> &Arc<dyn PositionStore> {
        &self.store
    }

    pub fn cache(&self) -> &IndicatorCache {
        &self.cache
    }

    /// Evaluate one position against the bars closed at `now`
    ///
    /// Per-position failures (venue, gateway, conflicts) come back as
    /// `Outcome::Failed`; only store errors are returned as `Err`.
    pub async fn evaluate(&self, id: Uuid, now: DateTime<Utc>) -> Result<Outcome, StoreError> {
        let position = self.store.read(id).await?;
        if !position.is_active() {
            if position.status == PositionStatus::Closed {
                if let Err(e) = self.cache.evict(id) {
                    tracing::warn!("Failed to evict indicator cache: {}", e);
                }
            }
            self.record(OperationLogEntry::new(&position, Outcome::SkippedInactive))
                .await;
            return Ok(Outcome::SkippedInactive);
        }

        if let Some(outcome) = self.confirm_venue_position(&position).await? {
            return Ok(outcome);
        }

        match self.attempt(&position, now, None).await? {
            Attempt::Done(outcome) => Ok(outcome),
            Attempt::Conflict { placed } => {
                tracing::debug!(
                    position = %id,
                    "Version conflict on commit, re-evaluating against fresh state"
                );
                let fresh = self.store.read(id).await?;
                if !fresh.is_active() {
                    let mut entry = OperationLogEntry::new(&fresh, Outcome::SkippedInactive)
                        .with_proposed(placed);
                    if let Some(price) = placed {
                        entry = entry.with_reason(format!(
                            "stop {} reached the venue before the position became {}",
                            price,
                            fresh.status.as_str()
                        ));
                    }
                    self.record(entry).await;
                    return Ok(Outcome::SkippedInactive);
                }

                match self.attempt(&fresh, now, placed).await? {
                    Attempt::Done(outcome) => Ok(outcome),
                    Attempt::Conflict { placed } => {
                        tracing::warn!(
                            position = %id,
                            "Second version conflict, deferring to next tick"
                        );
                        self.record(
                            OperationLogEntry::new(&fresh, Outcome::Failed)
                                .with_proposed(placed)
                                .with_reason("version conflict"),
                        )
                        .await;
                        Ok(Outcome::Failed)
                    }
                }
            }
        }
    }

    async fn attempt(
        &self,
        position: &ManagedPosition,
        now: DateTime<Utc>,
        placed: Option<f64>,
    ) -> Result<Attempt, StoreError> {
        let state = match self.indicator_state(position, now).await {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(
                    position = %position.id,
                    symbol = %position.symbol,
                    "Candle fetch failed: {}",
                    e
                );
                self.record(
                    OperationLogEntry::new(position, Outcome::Failed).with_reason(e.to_string()),
                )
                .await;
                return Ok(Attempt::Done(Outcome::Failed));
            }
        };

        let Some(bar) = state.last_timestamp() else {
            self.record(
                OperationLogEntry::new(position, Outcome::SkippedInsufficientHistory)
                    .with_reason("no closed candles"),
            )
            .await;
            return Ok(Attempt::Done(Outcome::SkippedInsufficientHistory));
        };

        let reading = state.reading(&position.params);
        let candidate = reading
            .as_ref()
            .ok()
            .and_then(|r| self.decider.candidate(position, r));
        let decision = self
            .decider
            .decide(position, reading, position.bars_since_entry(bar));

        let commit = |stop| StopCommit {
            stop,
            last_evaluated_bar: bar,
            regime: state.regime(),
            calculated_stop: candidate,
        };

        match decision {
            Decision::NewStop(price) => {
                if placed != Some(price) {
                    // Closed or edited since our read: don't touch the venue
                    let current = self.store.read(position.id).await?;
                    if !current.is_active() {
                        self.record(
                            OperationLogEntry::new(&current, Outcome::SkippedInactive)
                                .with_proposed(Some(price))
                                .at_bar(Some(bar)),
                        )
                        .await;
                        return Ok(Attempt::Done(Outcome::SkippedInactive));
                    }
                    if current.version != position.version {
                        return Ok(Attempt::Conflict { placed });
                    }

                    if let Err(e) = self.set_stop(position, price).await {
                        return self.gateway_failed(position, price, bar, e).await;
                    }
                }

                match self
                    .store
                    .commit_if_version(position.id, position.version, &commit(Some(price)))
                    .await?
                {
                    CommitResult::Committed { version } => {
                        tracing::info!(
                            position = %position.id,
                            symbol = %position.symbol,
                            side = %position.side,
                            previous = ?position.current_stop,
                            stop = price,
                            version,
                            "Stop moved"
                        );
                        self.record(
                            OperationLogEntry::new(position, Outcome::Applied)
                                .with_proposed(Some(price))
                                .at_bar(Some(bar)),
                        )
                        .await;
                        Ok(Attempt::Done(Outcome::Applied))
                    }
                    CommitResult::VersionConflict { .. } => Ok(Attempt::Conflict {
                        placed: Some(price),
                    }),
                }
            }
            Decision::NoChange | Decision::Skip(_) => {
                let (mut outcome, mut reason) = match decision {
                    Decision::Skip(reason) => (reason.outcome(), Some(reason.as_str().to_string())),
                    _ => (Outcome::SkippedNoChange, None),
                };

                // A stop from the conflicted pass no longer matches the store
                let mut stop = None;
                if let Some(price) = placed {
                    match position.current_stop {
                        Some(restored) if restored != price => {
                            if let Err(e) = self.set_stop(position, restored).await {
                                return self.gateway_failed(position, restored, bar, e).await;
                            }
                            reason =
                                Some(format!("restored stop {} after conflicting edit", restored));
                        }
                        Some(_) => {}
                        // Nothing to restore: the venue keeps the placed stop
                        None => {
                            tracing::info!(
                                position = %position.id,
                                symbol = %position.symbol,
                                stop = price,
                                "Keeping stop placed before a conflicting edit"
                            );
                            stop = Some(price);
                            reason = Some(format!(
                                "kept stop {} placed before conflicting edit ({})",
                                price,
                                reason.as_deref().unwrap_or("no change")
                            ));
                            outcome = Outcome::Applied;
                        }
                    }
                }

                match self
                    .store
                    .commit_if_version(position.id, position.version, &commit(stop))
                    .await?
                {
                    CommitResult::Committed { .. } => {
                        tracing::debug!(
                            position = %position.id,
                            symbol = %position.symbol,
                            outcome = %outcome,
                            candidate = ?candidate,
                            stop = ?stop,
                            "No stop change"
                        );
                        let mut entry = OperationLogEntry::new(position, outcome)
                            .with_proposed(stop.or(candidate))
                            .at_bar(Some(bar));
                        if let Some(reason) = reason {
                            entry = entry.with_reason(reason);
                        }
                        self.record(entry).await;
                        Ok(Attempt::Done(outcome))
                    }
                    CommitResult::VersionConflict { .. } => Ok(Attempt::Conflict { placed }),
                }
            }
        }
    }

    async fn set_stop(&self, position: &ManagedPosition, price: f64) -> Result<(), GatewayError> {
        let label = format!("set_stop {} {}", position.symbol, position.side);
        self.retry
            .run(&label, || {
                self.gateway
                    .set_stop(&position.account, &position.symbol, position.side, price)
            })
            .await
            .map(|_| ())
    }

    async fn gateway_failed(
        &self,
        position: &ManagedPosition,
        price: f64,
        bar: DateTime<Utc>,
        error: GatewayError,
    ) -> Result<Attempt, StoreError> {
        tracing::warn!(
            position = %position.id,
            symbol = %position.symbol,
            stop = price,
            "Gateway failed: {}",
            error
        );

        if error == GatewayError::PositionNotFound {
            self.close_gone(position).await?;
        }

        self.record(
            OperationLogEntry::new(position, Outcome::Failed)
                .with_proposed(Some(price))
                .with_reason(error.to_string())
                .at_bar(Some(bar)),
        )
        .await;
        Ok(Attempt::Done(Outcome::Failed))
    }

    /// Closes the managed position when the venue no longer holds it
    ///
    /// A check that fails after retries does not block the evaluation.
    async fn confirm_venue_position(
        &self,
        position: &ManagedPosition,
    ) -> Result<Option<Outcome>, StoreError> {
        let label = format!("has_position {} {}", position.symbol, position.side);
        let open = self
            .retry
            .run(&label, || {
                self.gateway
                    .has_position(&position.account, &position.symbol, position.side)
            })
            .await;

        match open {
            Ok(true) => Ok(None),
            Ok(false) => {
                self.close_gone(position).await?;
                self.record(
                    OperationLogEntry::new(position, Outcome::Failed)
                        .with_reason(GatewayError::PositionNotFound.to_string()),
                )
                .await;
                Ok(Some(Outcome::Failed))
            }
            Err(e) => {
                tracing::warn!(
                    position = %position.id,
                    symbol = %position.symbol,
                    "Venue position check failed, evaluating anyway: {}",
                    e
                );
                Ok(None)
            }
        }
    }

    async fn close_gone(&self, position: &ManagedPosition) -> Result<(), StoreError> {
        tracing::info!(
            position = %position.id,
            symbol = %position.symbol,
            "Venue position gone, closing"
        );
        self.store
            .set_status(position.id, PositionStatus::Closed)
            .await?;
        if let Err(e) = self.cache.evict(position.id) {
            tracing::warn!("Failed to evict indicator cache: {}", e);
        }
        Ok(())
    }

    /// Indicator state over all bars closed at `now`
    ///
    /// Continues from the cached state. Without one, replays `history_bars`
    /// ending at the last evaluated bar so the result matches what an
    /// uninterrupted process would hold; a gap too long to bridge falls back
    /// to the most recent `history_bars`.
    async fn indicator_state(
        &self,
        position: &ManagedPosition,
        now: DateTime<Utc>,
    ) -> Result<IndicatorState, SourceError> {
        let timeframe = position.timeframe;
        let history_bars = self
            .history_bars
            .max(position.params.warmup_bars() + 1);
        let bars_since = |ts: DateTime<Utc>| (now - ts).num_seconds() / timeframe.seconds();

        let cached = match self.cache.get(position.id, &position.params) {
            Ok(cached) => cached.filter(|s| {
                s.last_timestamp()
                    .is_some_and(|ts| bars_since(ts) <= MAX_CATCHUP_BARS)
            }),
            Err(e) => {
                tracing::warn!("Indicator cache unavailable: {}", e);
                None
            }
        };

        let anchor = position
            .last_evaluated_bar
            .map(|bar| bar - timeframe.duration() * history_bars as i32)
            .filter(|start| bars_since(*start) <= MAX_CATCHUP_BARS);

        let (base, since, limit) = match (cached, anchor) {
            (Some(state), _) => {
                let since = state.last_timestamp();
                let elapsed = since.map(bars_since).unwrap_or(0);
                (state, since, elapsed.max(0) as usize + 2)
            }
            (None, Some(start)) => {
                let elapsed = bars_since(start);
                (IndicatorState::new(), Some(start), elapsed.max(0) as usize + 2)
            }
            // One extra for the bar still forming
            (None, None) => (IndicatorState::new(), None, history_bars + 1),
        };

        let mut candles = self
            .source
            .fetch(&position.symbol, timeframe, since, limit)
            .await?;
        candles.retain(|c| timeframe.is_closed(c.timestamp, now));

        let state = update(base, &position.params, &candles);
        if let Err(e) = self.cache.put(position.id, &position.params, state.clone()) {
            tracing::warn!("Failed to cache indicator state: {}", e);
        }
        Ok(state)
    }

    /// Append to the operation log; never fails the evaluation
    pub async fn record(&self, entry: OperationLogEntry) {
        match tokio::time::timeout(self.log_timeout, self.log.append(&entry)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(
                position = %entry.position_id,
                outcome = %entry.outcome,
                "Failed to append operation log: {}",
                e
            ),
            Err(_) => tracing::warn!(
                position = %entry.position_id,
                outcome = %entry.outcome,
                "Operation log append timed out"
            ),
        }
    }
}
