//! Sliding-window limit on consent updates per identity.
use std::{collections::VecDeque, sync::Arc, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::gate::error::ConsentError;

/// Identity used for updates made without a subject.
pub const ANONYMOUS: &str = "anonymous";

/// At most `max_updates` accepted updates per identity within any `window`.
///
/// Rejected attempts are not counted.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    max_updates: u32,
    window: Duration,
    windows: Arc<DashMap<String, VecDeque<DateTime<Utc>>>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(10, Duration::from_secs(60 * 60))
    }
}

impl RateLimiter {
    pub fn new(max_updates: u32, window: Duration) -> Self {
        Self { max_updates, window, windows: Arc::new(DashMap::new()) }
    }

    /// Counts one update for `identity` at `now`, or rejects it.
    pub fn try_acquire(&self, identity: &str, now: DateTime<Utc>) -> Result<(), ConsentError> {
        let cutoff = self.cutoff(now);
        let mut timestamps = self.windows.entry(identity.to_string()).or_default();
        while timestamps.front().is_some_and(|at| *at <= cutoff) {
            timestamps.pop_front();
        }
        if timestamps.len() >= self.max_updates as usize {
            warn!(identity, limit = self.max_updates, "[rate-limit] update rejected");
            return Err(ConsentError::RateLimitExceeded {
                identity: identity.to_string(),
                limit: self.max_updates,
                window_secs: self.window.as_secs(),
            });
        }
        timestamps.push_back(now);
        Ok(())
    }

    /// Seeds the window of `identity` from updates accepted by an earlier
    /// session. Ignored once `identity` already has a window.
    pub fn restore(&self, identity: &str, accepted: impl IntoIterator<Item = DateTime<Utc>>, now: DateTime<Utc>) {
        let cutoff = self.cutoff(now);
        self.windows.entry(identity.to_string()).or_insert_with(|| {
            let mut timestamps: Vec<_> = accepted.into_iter().filter(|at| *at > cutoff).collect();
            timestamps.sort();
            debug!(identity, restored = timestamps.len(), "[rate-limit] window restored");
            timestamps.into()
        });
    }

    /// Updates `identity` may still make at `now`.
    pub fn remaining(&self, identity: &str, now: DateTime<Utc>) -> u32 {
        let cutoff = self.cutoff(now);
        let used = self
            .windows
            .get(identity)
            .map_or(0, |timestamps| timestamps.iter().filter(|at| **at > cutoff).count());
        self.max_updates.saturating_sub(used as u32)
    }

    fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        TimeDelta::from_std(self.window)
            .ok()
            .and_then(|window| now.checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}
