use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{ManagedPosition, Timeframe};

/// Membership change from one refresh
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryDelta {
    pub added: Vec<Uuid>,
    pub removed: Vec<Uuid>,
}

impl RegistryDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Process-wide view of `{timeframe → active positions}`
///
/// Only ever replaced wholesale per cohort from the position store.
#[derive(Clone, Default)]
pub struct CohortRegistry {
    cohorts: Arc<RwLock<HashMap<Timeframe, HashSet<Uuid>>>>,
}

impl CohortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a cohort's members with the positions just listed
    pub async fn refresh(&self, timeframe: Timeframe, active: &[ManagedPosition]) -> RegistryDelta {
        let next: HashSet<Uuid> = active.iter().map(|p| p.id).collect();
        let mut cohorts = self.cohorts.write().await;
        let previous = cohorts.insert(timeframe, next.clone()).unwrap_or_default();

        let mut delta = RegistryDelta {
            added: next.difference(&previous).copied().collect(),
            removed: previous.difference(&next).copied().collect(),
        };
        delta.added.sort();
        delta.removed.sort();
        delta
    }

    pub async fn members(&self, timeframe: Timeframe) -> Vec<Uuid> {
        let cohorts = self.cohorts.read().await;
        let mut ids: Vec<Uuid> = cohorts
            .get(&timeframe)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Active position count per timeframe
    pub async fn sizes(&self) -> HashMap<Timeframe, usize> {
        self.cohorts
            .read()
            .await
            .iter()
            .map(|(tf, ids)| (*tf, ids.len()))
            .collect()
    }
}
