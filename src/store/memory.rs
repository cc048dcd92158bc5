use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{validate_stop, CommitResult, OperationLog, PositionStore, StopCommit};
use crate::error::StoreError;
use crate::models::{
    ManagedPosition, NewPosition, OperationLogEntry, PositionStatus, StrategyParams, Timeframe,
};

/// Position store held in process memory
///
/// Used by tests and dry runs. Cloneable; clones share the same map.
#[derive(Clone, Default)]
pub struct MemoryPositionStore {
    positions: Arc<RwLock<HashMap<Uuid, ManagedPosition>>>,
}

impl MemoryPositionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fully formed record, replacing any existing one
    pub async fn insert(&self, position: ManagedPosition) {
        self.positions.write().await.insert(position.id, position);
    }

    async fn mutate<F>(&self, id: Uuid, f: F) -> Result<ManagedPosition, StoreError>
    where
        F: FnOnce(&mut ManagedPosition) + Send,
    {
        let mut positions = self.positions.write().await;
        let position = positions.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        f(position);
        position.version += 1;
        position.updated_at = Utc::now();
        Ok(position.clone())
    }
}

#[async_trait]
impl PositionStore for MemoryPositionStore {
    async fn create(&self, new: NewPosition) -> Result<ManagedPosition, StoreError> {
        new.params.validate()?;
        let position = new.into_position(Uuid::new_v4(), Utc::now());
        self.positions
            .write()
            .await
            .insert(position.id, position.clone());
        Ok(position)
    }

    async fn read(&self, id: Uuid) -> Result<ManagedPosition, StoreError> {
        self.positions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn list_active(&self, timeframe: Timeframe) -> Result<Vec<ManagedPosition>, StoreError> {
        let positions = self.positions.read().await;
        let mut active: Vec<ManagedPosition> = positions
            .values()
            .filter(|p| p.is_active() && p.timeframe == timeframe)
            .cloned()
            .collect();
        active.sort_by_key(|p| p.entry_time);
        Ok(active)
    }

    async fn commit_if_version(
        &self,
        id: Uuid,
        expected_version: u64,
        commit: &StopCommit,
    ) -> Result<CommitResult, StoreError> {
        validate_stop(commit.stop)?;
        let mut positions = self.positions.write().await;
        let position = positions.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        if position.version != expected_version {
            return Ok(CommitResult::VersionConflict {
                current: position.version,
            });
        }

        if let Some(stop) = commit.stop {
            position.current_stop = Some(stop);
        }
        position.last_evaluated_bar = Some(commit.last_evaluated_bar);
        position.last_regime = commit.regime;
        position.last_calculated_stop = commit.calculated_stop;
        position.version += 1;
        position.updated_at = Utc::now();

        Ok(CommitResult::Committed {
            version: position.version,
        })
    }

    async fn set_status(
        &self,
        id: Uuid,
        status: PositionStatus,
    ) -> Result<ManagedPosition, StoreError> {
        self.mutate(id, |p| p.status = status).await
    }

    async fn adjust_stop(
        &self,
        id: Uuid,
        stop: Option<f64>,
    ) -> Result<ManagedPosition, StoreError> {
        validate_stop(stop)?;
        let now = Utc::now();
        self.mutate(id, |p| {
            p.current_stop = stop;
            p.manual_adjusted_at = Some(now);
        })
        .await
    }

    async fn replace_params(
        &self,
        id: Uuid,
        params: StrategyParams,
    ) -> Result<ManagedPosition, StoreError> {
        params.validate()?;
        self.mutate(id, |p| p.params = params).await
    }
}

/// Operation log held in process memory
#[derive(Clone, Default)]
pub struct MemoryOperationLog {
    entries: Arc<RwLock<Vec<OperationLogEntry>>>,
}

impl MemoryOperationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// All entries in append order
    pub async fn entries(&self) -> Vec<OperationLogEntry> {
        self.entries.read().await.clone()
    }

    pub async fn for_position(&self, position_id: Uuid) -> Vec<OperationLogEntry> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|e| e.position_id == position_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl OperationLog for MemoryOperationLog {
    async fn append(&self, entry: &OperationLogEntry) -> Result<(), StoreError> {
        self.entries.write().await.push(entry.clone());
        Ok(())
    }

    async fn recent(
        &self,
        position_id: Uuid,
        limit: usize,
    ) -> Result<Vec<OperationLogEntry>, StoreError> {
        Ok(self
            .entries
            .read()
            .await
            .iter()
            .rev()
            .filter(|e| e.position_id == position_id)
            .take(limit)
            .cloned()
            .collect())
    }
}
