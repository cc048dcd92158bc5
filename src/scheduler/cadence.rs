//! Bar-close boundaries per timeframe
//!
//! Boundaries are aligned to the UTC epoch: every 10/15/30 minutes, the top
//! of the hour, and every 4 hours from 00:00. Ticks fire `settle` after a
//! boundary so the venue has published the closed bar.

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::models::Timeframe;

/// First bar-close boundary strictly after `now`
pub fn next_boundary(now: DateTime<Utc>, timeframe: Timeframe) -> DateTime<Utc> {
    timeframe.bar_open(now) + timeframe.duration()
}

/// Next tick time: the current boundary plus `settle` if that is still
/// ahead, otherwise the following one
pub fn next_tick(now: DateTime<Utc>, timeframe: Timeframe, settle: Duration) -> DateTime<Utc> {
    let settle = chrono::Duration::from_std(settle).unwrap_or_else(|_| chrono::Duration::zero());
    let current = timeframe.bar_open(now) + settle;
    if now < current {
        current
    } else {
        next_boundary(now, timeframe) + settle
    }
}

/// Wall-clock wait from `now` until `at`, zero if already past
pub fn until(now: DateTime<Utc>, at: DateTime<Utc>) -> Duration {
    (at - now).to_std().unwrap_or(Duration::ZERO)
}

/// Tick period of a cohort
pub fn period(timeframe: Timeframe) -> Duration {
    Duration::from_secs(timeframe.seconds() as u64)
}
