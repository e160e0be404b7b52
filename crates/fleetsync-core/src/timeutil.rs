//! Conversions between wall-clock instants and std durations.

use chrono::{DateTime, TimeDelta, Utc};
use std::time::Duration;

/// Time elapsed from `since` to `now`, zero when `since` is in the future.
pub(crate) fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}

/// The instant `age` before `now`, saturating at the minimum representable time.
pub(crate) fn cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(age)
        .ok()
        .and_then(|delta| now.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
