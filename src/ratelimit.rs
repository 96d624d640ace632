use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;

use crate::types::{ProviderId, RateLimitStatus};

/// Default exhaustion window when a 429 arrives without a retry-after hint.
const DEFAULT_RESET_SECS: i64 = 60;

/// Last-known rate-limit snapshot per provider, refreshed opportunistically
/// from response metadata after any call.
///
/// Snapshots are advisory: vendor headers may be stale, so the router only
/// deprioritizes exhausted providers, it never hard-excludes them.
#[derive(Default)]
pub struct RateTracker {
    statuses: DashMap<ProviderId, RateLimitStatus>,
}

impl RateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the snapshot with fresh response metadata.
    pub fn record(&self, id: ProviderId, status: RateLimitStatus) {
        self.statuses.insert(id, status);
    }

    /// Zero out the remaining quota after a 429, keeping the vendor's
    /// retry-after hint when it gave one.
    pub fn mark_exhausted(&self, id: ProviderId, retry_after: Option<Duration>) {
        let reset_secs = retry_after
            .map(|d| d.as_secs() as i64)
            .unwrap_or(DEFAULT_RESET_SECS);
        let mut entry = self
            .statuses
            .entry(id)
            .or_insert_with(|| RateLimitStatus::full(0));
        entry.remaining = 0;
        entry.reset_at = Utc::now() + chrono::Duration::seconds(reset_secs);
    }

    pub fn status(&self, id: ProviderId) -> Option<RateLimitStatus> {
        self.statuses.get(&id).map(|s| s.clone())
    }

    /// Remaining quota is zero and the reset time is still in the future.
    pub fn is_exhausted(&self, id: ProviderId) -> bool {
        self.statuses
            .get(&id)
            .map(|s| s.is_exhausted())
            .unwrap_or(false)
    }
}
