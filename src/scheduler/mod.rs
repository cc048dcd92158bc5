// Timeframe cohort scheduler
//
// One loop per timeframe fires at that timeframe's bar-close boundary and
// fans out to per-position evaluations: bounded by a semaphore, at most one
// in flight per position, each isolated from its siblings.

pub mod cadence;
pub mod registry;
pub mod single_flight;

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::error::StoreError;
use crate::execution::Evaluator;
use crate::models::{OperationLogEntry, Outcome, PositionStatus, Timeframe};

pub use registry::{CohortRegistry, RegistryDelta};
pub use single_flight::{FlightGuard, SingleFlight};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_concurrency: usize,
    pub settle_delay: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            settle_delay: Duration::from_secs(10),
        }
    }
}

/// Tally of one cohort tick
#[derive(Debug, Clone)]
pub struct CohortReport {
    pub timeframe: Timeframe,
    pub started_at: DateTime<Utc>,
    pub counts: HashMap<Outcome, usize>,
    /// Evaluations that ended in a store error or a crashed task
    pub errors: usize,
}

impl CohortReport {
    fn new(timeframe: Timeframe, started_at: DateTime<Utc>) -> Self {
        Self {
            timeframe,
            started_at,
            counts: HashMap::new(),
            errors: 0,
        }
    }

    fn add(&mut self, outcome: Outcome) {
        *self.counts.entry(outcome).or_insert(0) += 1;
    }

    pub fn count(&self, outcome: Outcome) -> usize {
        self.counts.get(&outcome).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum::<usize>() + self.errors
    }
}

impl fmt::Display for CohortReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} cohort: {} evaluated, {} applied, {} failed, {} overlapped, {} errors",
            self.timeframe,
            self.total(),
            self.count(Outcome::Applied),
            self.count(Outcome::Failed),
            self.count(Outcome::SkippedOverlap),
            self.errors
        )
    }
}

#[derive(Clone)]
pub struct Scheduler {
    evaluator: Evaluator,
    permits: Arc<Semaphore>,
    flights: SingleFlight,
    registry: CohortRegistry,
    settle_delay: Duration,
}

impl Scheduler {
    pub fn new(evaluator: Evaluator, config: SchedulerConfig) -> Self {
        Self {
            evaluator,
            permits: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            flights: SingleFlight::new(),
            registry: CohortRegistry::new(),
            settle_delay: config.settle_delay,
        }
    }

    pub fn registry(&self) -> &CohortRegistry {
        &self.registry
    }

    pub fn flights(&self) -> &SingleFlight {
        &self.flights
    }

    /// Evaluate every active position of `timeframe` against bars closed at `now`
    ///
    /// Only a failure to list the cohort is returned as an error.
    pub async fn run_cohort(
        &self,
        timeframe: Timeframe,
        now: DateTime<Utc>,
    ) -> Result<CohortReport, StoreError> {
        let positions = self.evaluator.store().list_active(timeframe).await?;
        let delta = self.registry.refresh(timeframe, &positions).await;
        if !delta.is_empty() {
            tracing::info!(
                timeframe = %timeframe,
                added = delta.added.len(),
                removed = delta.removed.len(),
                "Cohort membership changed"
            );
            self.evict_closed(&delta.removed).await;
        }

        let mut report = CohortReport::new(timeframe, now);
        let mut tasks = JoinSet::new();

        for position in positions {
            let Some(guard) = self.flights.try_acquire(position.id) else {
                tracing::info!(
                    position = %position.id,
                    symbol = %position.symbol,
                    "Previous evaluation still running, skipping tick"
                );
                self.evaluator
                    .record(OperationLogEntry::new(&position, Outcome::SkippedOverlap))
                    .await;
                report.add(Outcome::SkippedOverlap);
                continue;
            };

            let evaluator = self.evaluator.clone();
            let permits = self.permits.clone();
            tasks.spawn(async move {
                let _guard = guard;
                let result = match permits.acquire_owned().await {
                    Ok(_permit) => evaluator.evaluate(position.id, now).await,
                    Err(_) => Err(StoreError::Unavailable("scheduler stopped".to_string())),
                };
                (position.id, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(outcome))) => report.add(outcome),
                Ok((id, Err(e))) => {
                    tracing::warn!(position = %id, "Evaluation aborted: {}", e);
                    report.errors += 1;
                }
                Err(e) => {
                    tracing::error!(timeframe = %timeframe, "Evaluation task panicked: {}", e);
                    report.errors += 1;
                }
            }
        }

        Ok(report)
    }

    /// Drop cached indicator state of positions that left the cohort closed
    ///
    /// Paused positions keep theirs for when they resume.
    async fn evict_closed(&self, removed: &[Uuid]) {
        for &id in removed {
            let closed = match self.evaluator.store().read(id).await {
                Ok(position) => position.status == PositionStatus::Closed,
                Err(StoreError::NotFound(_)) => true,
                Err(e) => {
                    tracing::warn!(position = %id, "Failed to read departed position: {}", e);
                    false
                }
            };
            if closed {
                if let Err(e) = self.evaluator.cache().evict(id) {
                    tracing::warn!("Failed to evict indicator cache: {}", e);
                }
            }
        }
    }

    /// Evaluate one position immediately, outside its cohort tick
    pub async fn check_now(&self, id: Uuid) -> Result<Outcome, StoreError> {
        self.check_at(id, Utc::now()).await
    }

    pub async fn check_at(&self, id: Uuid, now: DateTime<Utc>) -> Result<Outcome, StoreError> {
        let Some(_guard) = self.flights.try_acquire(id) else {
            let position = self.evaluator.store().read(id).await?;
            self.evaluator
                .record(OperationLogEntry::new(&position, Outcome::SkippedOverlap))
                .await;
            return Ok(Outcome::SkippedOverlap);
        };

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| StoreError::Unavailable("scheduler stopped".to_string()))?;
        self.evaluator.evaluate(id, now).await
    }

    /// Spawn one loop per timeframe
    pub fn start(&self, timeframes: &[Timeframe]) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut cohorts = JoinSet::new();

        for &timeframe in timeframes {
            let scheduler = self.clone();
            let shutdown = shutdown_rx.clone();
            cohorts.spawn(async move { scheduler.cohort_loop(timeframe, shutdown).await });
        }

        SchedulerHandle {
            shutdown: shutdown_tx,
            cohorts,
        }
    }

    async fn cohort_loop(self, timeframe: Timeframe, mut shutdown: watch::Receiver<bool>) {
        let now = Utc::now();
        let first = cadence::next_tick(now, timeframe, self.settle_delay);
        let start = Instant::now() + cadence::until(now, first);
        tracing::info!(
            timeframe = %timeframe,
            "⏱️  Cohort loop starting, first tick at {}",
            first.format("%H:%M:%S")
        );

        let mut ticker = interval_at(start, cadence::period(timeframe));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // Ticks run detached so a slow one can overlap the next boundary
        let mut ticks: JoinSet<Result<CohortReport, StoreError>> = JoinSet::new();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let scheduler = self.clone();
                    ticks.spawn(async move { scheduler.run_cohort(timeframe, Utc::now()).await });
                }
                Some(done) = ticks.join_next(), if !ticks.is_empty() => {
                    log_tick(timeframe, done);
                }
                _ = shutdown.changed() => break,
            }
        }

        tracing::info!(
            timeframe = %timeframe,
            in_flight = ticks.len(),
            "Cohort loop stopping, draining in-flight ticks"
        );
        while let Some(done) = ticks.join_next().await {
            log_tick(timeframe, done);
        }
    }
}

fn log_tick(
    timeframe: Timeframe,
    done: Result<Result<CohortReport, StoreError>, tokio::task::JoinError>,
) {
    match done {
        Ok(Ok(report)) => tracing::info!("{}", report),
        // Systemic failure: wait for the next natural boundary
        Ok(Err(e)) => tracing::error!(timeframe = %timeframe, "Cohort tick failed: {}", e),
        Err(e) => tracing::error!(timeframe = %timeframe, "Cohort tick panicked: {}", e),
    }
}

/// Running cohort loops
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    cohorts: JoinSet<()>,
}

impl SchedulerHandle {
    /// Stop firing new ticks and wait for in-flight evaluations to finish
    pub async fn shutdown(mut self) {
        // Receivers may already be gone if every loop exited
        let _ = self.shutdown.send(true);
        while let Some(result) = self.cohorts.join_next().await {
            if let Err(e) = result {
                tracing::error!("Cohort loop panicked: {}", e);
            }
        }
    }
}
