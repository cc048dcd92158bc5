// Position state and operation log contracts
//
// The scheduler and the external management API are the only writers.
// Every mutation bumps `version`; scheduler commits are conditional on it.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{
    ManagedPosition, NewPosition, OperationLogEntry, PositionStatus, Regime, StrategyParams,
    Timeframe,
};

pub use memory::{MemoryOperationLog, MemoryPositionStore};

/// Fields a scheduler tick writes back
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StopCommit {
    /// New stop; `None` leaves the current stop untouched
    pub stop: Option<f64>,
    pub last_evaluated_bar: DateTime<Utc>,
    pub regime: Regime,
    pub calculated_stop: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitResult {
    Committed { version: u64 },
    VersionConflict { current: u64 },
}

#[async_trait]
pub trait PositionStore: Send + Sync {
    /// Register a position: active, no stop, version 0
    async fn create(&self, new: NewPosition) -> Result<ManagedPosition, StoreError>;

    async fn read(&self, id: Uuid) -> Result<ManagedPosition, StoreError>;

    async fn list_active(&self, timeframe: Timeframe) -> Result<Vec<ManagedPosition>, StoreError>;

    /// Apply `commit` only if the stored version is still `expected_version`
    async fn commit_if_version(
        &self,
        id: Uuid,
        expected_version: u64,
        commit: &StopCommit,
    ) -> Result<CommitResult, StoreError>;

    /// Pause, resume or close
    async fn set_status(
        &self,
        id: Uuid,
        status: PositionStatus,
    ) -> Result<ManagedPosition, StoreError>;

    /// Manual stop edit; becomes the ratchet baseline for the next tick
    async fn adjust_stop(&self, id: Uuid, stop: Option<f64>) -> Result<ManagedPosition, StoreError>;

    /// Full replacement of the strategy parameters
    async fn replace_params(
        &self,
        id: Uuid,
        params: StrategyParams,
    ) -> Result<ManagedPosition, StoreError>;
}

/// Append-only audit sink
#[async_trait]
pub trait OperationLog: Send + Sync {
    async fn append(&self, entry: &OperationLogEntry) -> Result<(), StoreError>;

    /// Most recent entries for a position, newest first
    async fn recent(
        &self,
        position_id: Uuid,
        limit: usize,
    ) -> Result<Vec<OperationLogEntry>, StoreError>;
}

pub(crate) fn validate_stop(stop: Option<f64>) -> Result<(), StoreError> {
    match stop {
        Some(price) if !price.is_finite() || price <= 0.0 => Err(StoreError::InvalidParams(
            crate::error::ParamError::OutOfRange {
                field: "stop",
                value: price,
                expected: "> 0".to_string(),
            },
        )),
        _ => Ok(()),
    }
}
