use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

/// Per-position mutual exclusion for evaluations
///
/// `try_acquire` never waits: a position already in flight is reported as
/// busy and the caller skips it.
#[derive(Clone, Default)]
pub struct SingleFlight {
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
}

/// Held for the lifetime of one evaluation; releases on drop
#[derive(Debug)]
pub struct FlightGuard {
    id: Uuid,
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
}

fn lock(set: &Mutex<HashSet<Uuid>>) -> MutexGuard<'_, HashSet<Uuid>> {
    // The set stays consistent even if a holder panicked
    set.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self, id: Uuid) -> Option<FlightGuard> {
        if !lock(&self.in_flight).insert(id) {
            return None;
        }
        Some(FlightGuard {
            id,
            in_flight: self.in_flight.clone(),
        })
    }

    pub fn is_in_flight(&self, id: Uuid) -> bool {
        lock(&self.in_flight).contains(&id)
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.in_flight).len()
    }
}

impl FlightGuard {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        lock(&self.in_flight).remove(&self.id);
    }
}
