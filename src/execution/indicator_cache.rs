use crate::indicators::IndicatorState;
use crate::models::StrategyParams;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct CachedIndicator {
    params: StrategyParams,
    state: IndicatorState,
}

/// Thread-safe in-memory cache of indicator state per position
///
/// Entries are only returned for the parameters they were computed with,
/// so a parameter edit forces a full replay.
#[derive(Clone, Default)]
pub struct IndicatorCache {
    data: Arc<RwLock<HashMap<Uuid, CachedIndicator>>>,
}

impl IndicatorCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached state for a position, if it was built with `params`
    pub fn get(&self, id: Uuid, params: &StrategyParams) -> Result<Option<IndicatorState>, String> {
        let data = self.data.read().map_err(|e| e.to_string())?;

        Ok(data
            .get(&id)
            .filter(|cached| &cached.params == params)
            .map(|cached| cached.state.clone()))
    }

    pub fn put(
        &self,
        id: Uuid,
        params: &StrategyParams,
        state: IndicatorState,
    ) -> Result<(), String> {
        let mut data = self.data.write().map_err(|e| e.to_string())?;
        data.insert(
            id,
            CachedIndicator {
                params: params.clone(),
                state,
            },
        );
        Ok(())
    }

    pub fn evict(&self, id: Uuid) -> Result<(), String> {
        let mut data = self.data.write().map_err(|e| e.to_string())?;
        data.remove(&id);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.data.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
