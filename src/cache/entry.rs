//! Cached responses and their freshness metadata.

use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

use tokio::time::Instant;

use crate::response::StructuredResponse;

/// One cached response plus the metadata that governs its freshness.
///
/// Mutated only by a successful assembly completing, a scheduler refresh
/// failing (the failure flag), or invalidation removing the entry outright.
/// Partial or malformed assemblies never reach an entry.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    response: Arc<StructuredResponse>,
    refreshed_at: Instant,
    refreshed_wall: SystemTime,
    ttl: Duration,
    last_refresh_failed: bool,
}

impl CacheEntry {
    pub(super) fn new(
        response: Arc<StructuredResponse>,
        refreshed_at: Instant,
        refreshed_wall: SystemTime,
        ttl: Duration,
    ) -> Self {
        Self {
            response,
            refreshed_at,
            refreshed_wall,
            ttl,
            last_refresh_failed: false,
        }
    }

    /// The assembled response this entry holds.
    #[must_use]
    pub fn response(&self) -> &Arc<StructuredResponse> { &self.response }

    /// Age of the cached value at `now`.
    #[must_use]
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.refreshed_at)
    }

    /// Whether the entry outlived its TTL.
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool { self.age(now) > self.ttl }

    /// Whether the entry satisfies a consumer's staleness bound.
    ///
    /// Fresh means `age <= min(ttl, max_staleness)`.
    #[must_use]
    pub fn is_fresh(&self, now: Instant, max_staleness: Duration) -> bool {
        self.age(now) <= self.ttl.min(max_staleness)
    }

    /// TTL the entry was installed with.
    #[must_use]
    pub fn ttl(&self) -> Duration { self.ttl }

    /// Wall-clock time of the last successful refresh, for persistence and
    /// display.
    #[must_use]
    pub fn refreshed_wall(&self) -> SystemTime { self.refreshed_wall }

    /// Whether the most recent refresh attempt for this key failed. The
    /// cached response itself is still the last good one.
    #[must_use]
    pub fn last_refresh_failed(&self) -> bool { self.last_refresh_failed }

    pub(super) fn mark_refresh_failed(&mut self) { self.last_refresh_failed = true; }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn entry_with_ttl(ttl: Duration) -> CacheEntry {
        let response = Arc::new(StructuredResponse::new(
            BTreeMap::new(),
            b"STATUS=OK\r\n".to_vec(),
            SystemTime::UNIX_EPOCH,
        ));
        CacheEntry::new(response, Instant::now(), SystemTime::UNIX_EPOCH, ttl)
    }

    #[tokio::test(start_paused = true)]
    async fn freshness_is_bounded_by_ttl_and_staleness() {
        let entry = entry_with_ttl(Duration::from_secs(300));
        let installed = Instant::now();

        assert!(entry.is_fresh(installed, Duration::from_secs(60)));
        assert!(entry.is_fresh(installed + Duration::from_secs(60), Duration::from_secs(60)));
        assert!(!entry.is_fresh(installed + Duration::from_secs(61), Duration::from_secs(60)));
        // A generous staleness bound is still clamped to the TTL.
        assert!(!entry.is_fresh(installed + Duration::from_secs(301), Duration::from_secs(600)));
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_follows_the_ttl() {
        let entry = entry_with_ttl(Duration::from_secs(5));
        let installed = Instant::now();
        assert!(!entry.is_expired(installed + Duration::from_secs(5)));
        assert!(entry.is_expired(installed + Duration::from_secs(6)));
    }
}
