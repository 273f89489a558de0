//! Time-to-live wrapper for values that are expensive to recompute.

use chrono::{DateTime, Duration, Utc};

/// A value together with the instant it was computed
#[derive(Debug, Clone, PartialEq)]
pub struct Cached<T> {
    pub value: T,
    pub computed_at: DateTime<Utc>,
}

impl<T> Cached<T> {
    pub fn new(value: T, computed_at: DateTime<Utc>) -> Self {
        Self { value, computed_at }
    }

    /// Stale once strictly more than `ttl` has passed since computation.
    ///
    /// A clock that went backwards also counts as stale.
    pub fn is_stale(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        let age = now.signed_duration_since(self.computed_at);
        age > ttl || age < Duration::zero()
    }
}

/// Whether an optional cached value needs recomputing
pub fn needs_refresh<T>(slot: &Option<Cached<T>>, now: DateTime<Utc>, ttl: Duration) -> bool {
    slot.as_ref().is_none_or(|c| c.is_stale(now, ttl))
}
