//! Cached responses with coalesced refresh.
//!
//! [`ResponseCache`] stores assembled responses keyed by command, serves
//! them to any number of consumers with a per-call staleness bound, and
//! funnels every refresh through one coalescing entry point: concurrent
//! callers for the same key join the in-flight refresh instead of starting
//! their own, which is also what keeps the device from seeing overlapping
//! requests for one command.
//!
//! The cache is a cheaply cloneable handle; clones share one store, the way
//! the engine's scheduler and consumers both hold it.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::{DashMap, mapref::entry::Entry};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    assembler::{AssemblyError, AssemblyResult, ResponseAssembler},
    command::{CommandCatalog, CommandKey},
    config::CacheConfig,
    metrics,
    transport::Transport,
};

mod entry;
mod inflight;
pub mod snapshot;

pub use entry::CacheEntry;
pub use snapshot::{CacheSnapshot, FileSnapshotStore, SnapshotEntry, SnapshotError, SnapshotStore};

use inflight::InFlightRefresh;

/// Counters and sizes reported by [`ResponseCache::stats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Entries currently stored, fresh or expired.
    pub total_entries: usize,
    /// Entries within their TTL.
    pub fresh_entries: usize,
    /// Entries past their TTL but not yet swept or replaced.
    pub expired_entries: usize,
    /// `get` calls answered from a fresh entry.
    pub hits: u64,
    /// `get` calls that had to refresh.
    pub misses: u64,
    /// Refreshes currently in flight.
    pub in_flight: usize,
}

struct CacheInner<T, C> {
    assembler: ResponseAssembler<T, C>,
    config: CacheConfig,
    entries: DashMap<CommandKey, CacheEntry>,
    in_flight: DashMap<CommandKey, InFlightRefresh>,
    live: DashMap<CommandKey, Duration>,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Key-value store of assembled responses with TTL, coalesced refresh, and
/// snapshot persistence.
pub struct ResponseCache<T, C>(Arc<CacheInner<T, C>>);

impl<T, C> Clone for ResponseCache<T, C> {
    fn clone(&self) -> Self { Self(Arc::clone(&self.0)) }
}

impl<T, C> ResponseCache<T, C>
where
    T: Transport + 'static,
    C: CommandCatalog + 'static,
{
    /// Create a cache over the given assembler.
    #[must_use]
    pub fn new(assembler: ResponseAssembler<T, C>, config: CacheConfig) -> Self {
        Self(Arc::new(CacheInner {
            assembler,
            config,
            entries: DashMap::new(),
            in_flight: DashMap::new(),
            live: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }))
    }

    /// Fetch the response for `key`, tolerating a value up to
    /// `max_staleness` old.
    ///
    /// A fresh hit (age within both the TTL and `max_staleness`) returns
    /// immediately without touching the transport. Otherwise the call
    /// delegates to [`refresh`](Self::refresh); if that fails while a stale
    /// entry still exists, the stale value is served instead of the error.
    /// Errors only surface on a first-ever fetch or after invalidation.
    ///
    /// # Errors
    ///
    /// Propagates the [`AssemblyError`] of a failed refresh when no cached
    /// value exists to fall back on.
    pub async fn get(&self, key: &CommandKey, max_staleness: Duration) -> AssemblyResult {
        if let Some(entry) = self.0.entries.get(key) {
            if entry.is_fresh(Instant::now(), max_staleness) {
                self.0.hits.fetch_add(1, Ordering::Relaxed);
                metrics::inc_cache_hits();
                return Ok(Arc::clone(entry.response()));
            }
        }
        self.0.misses.fetch_add(1, Ordering::Relaxed);
        metrics::inc_cache_misses();

        match self.refresh(key).await {
            Ok(response) => Ok(response),
            Err(err) => match self.0.entries.get(key) {
                Some(entry) => {
                    debug!(%key, %err, "refresh failed, serving stale entry");
                    Ok(Arc::clone(entry.response()))
                }
                None => Err(err),
            },
        }
    }

    /// Refresh the entry for `key`, coalescing with any in-flight refresh.
    ///
    /// When a refresh for the key is already running the caller joins it and
    /// receives the identical outcome; otherwise this call starts the
    /// refresh. On success the new entry is installed atomically; on failure
    /// an existing entry is left untouched (stale-but-present beats losing
    /// data on a transient failure).
    ///
    /// Dropping the returned future detaches this caller. The underlying
    /// assembly is cancelled only when no other caller remains joined.
    ///
    /// # Errors
    ///
    /// Returns the [`AssemblyError`] the underlying assembly resolved to.
    pub async fn refresh(&self, key: &CommandKey) -> AssemblyResult {
        // Joining under the map entry lock means the driver cannot remove
        // the in-flight marker and broadcast before our subscription exists.
        let (mut rx, _guard) = match self.0.in_flight.entry(key.clone()) {
            // A flight whose joiners all detached has fired its token but
            // its driver has not removed the marker yet. Joining it would
            // only ever yield Cancelled; replace it instead.
            Entry::Occupied(mut occupied) if occupied.get().is_cancelled() => {
                let flight = InFlightRefresh::new();
                let joined = flight.join();
                let token = flight.cancel_token();
                let flight_id = flight.id();
                occupied.insert(flight);
                self.spawn_driver(key.clone(), token, flight_id);
                joined
            }
            Entry::Occupied(occupied) => occupied.get().join(),
            Entry::Vacant(vacant) => {
                let flight = InFlightRefresh::new();
                let joined = flight.join();
                let token = flight.cancel_token();
                let flight_id = flight.id();
                vacant.insert(flight);
                self.spawn_driver(key.clone(), token, flight_id);
                joined
            }
        };

        match rx.recv().await {
            Ok(outcome) => outcome,
            // The driver vanished without broadcasting; the refresh can only
            // have been torn down.
            Err(_) => Err(AssemblyError::Cancelled { key: key.clone() }),
        }
    }

    /// Remove the entry for `key`. Returns whether one existed.
    ///
    /// The next `get` for the key forces a refresh.
    pub fn invalidate(&self, key: &CommandKey) -> bool {
        self.0.entries.remove(key).is_some()
    }

    /// Remove every entry; a full cache reset.
    pub fn invalidate_all(&self) { self.0.entries.clear(); }

    /// Remove every entry whose key matches `predicate`. Returns how many
    /// entries were removed.
    ///
    /// Bulk form of [`invalidate`](Self::invalidate) for resetting a whole
    /// command family, for example every `status` key after the card is
    /// reconfigured.
    pub fn invalidate_matching<F>(&self, predicate: F) -> usize
    where
        F: Fn(&CommandKey) -> bool,
    {
        let before = self.0.entries.len();
        self.0.entries.retain(|key, _| !predicate(key));
        before.saturating_sub(self.0.entries.len())
    }

    /// Mark `key` for background refresh every `interval`.
    pub fn mark_live(&self, key: CommandKey, interval: Duration) {
        self.0.live.insert(key, interval);
    }

    /// Stop background refresh for `key`. Returns whether it was live.
    pub fn mark_offline(&self, key: &CommandKey) -> bool {
        self.0.live.remove(key).is_some()
    }

    /// The live keys and their refresh intervals.
    #[must_use]
    pub fn live_keys(&self) -> Vec<(CommandKey, Duration)> {
        self.0
            .live
            .iter()
            .map(|item| (item.key().clone(), *item.value()))
            .collect()
    }

    /// Whether a live key's entry is old enough for its next background
    /// refresh. Keys with no entry yet are always due.
    #[must_use]
    pub fn is_due(&self, key: &CommandKey, interval: Duration) -> bool {
        self.0
            .entries
            .get(key)
            .is_none_or(|entry| entry.age(Instant::now()) >= interval)
    }

    /// Evict expired entries that are not marked live.
    ///
    /// Live entries are kept past expiry on purpose: consumers of a live key
    /// read the last good response until a refresh replaces it or the key is
    /// explicitly invalidated.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.0.entries.len();
        self.0
            .entries
            .retain(|key, entry| !entry.is_expired(now) || self.0.live.contains_key(key));
        before.saturating_sub(self.0.entries.len())
    }

    /// A copy of the entry for `key`, if present.
    #[must_use]
    pub fn entry(&self, key: &CommandKey) -> Option<CacheEntry> {
        self.0.entries.get(key).map(|entry| entry.clone())
    }

    /// A copy of every entry with its key, in no particular order.
    ///
    /// Dashboards list these to show per-command age, TTL, and refresh
    /// health without touching the device.
    #[must_use]
    pub fn entries(&self) -> Vec<(CommandKey, CacheEntry)> {
        self.0
            .entries
            .iter()
            .map(|item| (item.key().clone(), item.value().clone()))
            .collect()
    }

    /// Current cache statistics.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let now = Instant::now();
        let total_entries = self.0.entries.len();
        let expired_entries = self
            .0
            .entries
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .count();
        CacheStats {
            total_entries,
            fresh_entries: total_entries.saturating_sub(expired_entries),
            expired_entries,
            hits: self.0.hits.load(Ordering::Relaxed),
            misses: self.0.misses.load(Ordering::Relaxed),
            in_flight: self.0.in_flight.len(),
        }
    }

    /// Snapshot the non-expired entries for persistence.
    #[must_use]
    pub fn snapshot(&self) -> CacheSnapshot {
        let now = Instant::now();
        let entries = self
            .0
            .entries
            .iter()
            .filter(|item| !item.value().is_expired(now))
            .map(|item| {
                SnapshotEntry::new(
                    item.key().clone(),
                    item.value().response().as_ref().clone(),
                    item.value().refreshed_wall(),
                    item.value().ttl(),
                )
            })
            .collect();
        CacheSnapshot::new(entries)
    }

    /// Install entries from a snapshot, skipping those whose TTL elapsed
    /// while persisted. Returns how many entries were restored.
    pub fn restore(&self, snapshot: CacheSnapshot) -> usize {
        let mut restored = 0;
        for entry in snapshot.into_entries() {
            let (key, response, refreshed_wall, ttl) = entry.into_parts();
            let age = refreshed_wall.elapsed().unwrap_or_default();
            if age > ttl {
                continue;
            }
            let refreshed_at = Instant::now()
                .checked_sub(age)
                .unwrap_or_else(Instant::now);
            self.0.entries.insert(
                key,
                CacheEntry::new(Arc::new(response), refreshed_at, refreshed_wall, ttl),
            );
            restored += 1;
        }
        restored
    }

    /// Snapshot the cache and hand it to a [`SnapshotStore`].
    ///
    /// # Errors
    ///
    /// Propagates the store's [`SnapshotError`].
    pub async fn persist_to<S>(&self, store: &S) -> Result<(), SnapshotError>
    where
        S: SnapshotStore + ?Sized,
    {
        store.save(&self.snapshot()).await
    }

    /// Load a snapshot from a [`SnapshotStore`] and restore it.
    ///
    /// Returns how many entries were restored; zero when the store holds no
    /// snapshot.
    ///
    /// # Errors
    ///
    /// Propagates the store's [`SnapshotError`].
    pub async fn restore_from<S>(&self, store: &S) -> Result<usize, SnapshotError>
    where
        S: SnapshotStore + ?Sized,
    {
        Ok(match store.load().await? {
            Some(snapshot) => self.restore(snapshot),
            None => 0,
        })
    }

    fn spawn_driver(&self, key: CommandKey, cancel: CancellationToken, flight_id: u64) {
        let cache = self.clone();
        tokio::spawn(async move { cache.drive_refresh(key, cancel, flight_id).await });
    }

    async fn drive_refresh(self, key: CommandKey, cancel: CancellationToken, flight_id: u64) {
        let deadline = Instant::now() + self.0.config.refresh_deadline;
        let outcome = self
            .0
            .assembler
            .assemble_with_cancel(&key, deadline, cancel)
            .await;

        match &outcome {
            Ok(response) => {
                let ttl = self
                    .0
                    .entries
                    .get(&key)
                    .map_or(self.0.config.default_ttl, |entry| entry.ttl());
                self.0.entries.insert(
                    key.clone(),
                    CacheEntry::new(
                        Arc::clone(response),
                        Instant::now(),
                        response.completed_at(),
                        ttl,
                    ),
                );
                debug!(%key, "cache entry installed");
            }
            Err(err) => {
                warn!(%key, %err, "refresh failed, existing entry left untouched");
                if let Some(mut entry) = self.0.entries.get_mut(&key) {
                    entry.mark_refresh_failed();
                }
            }
        }

        // Remove the marker before broadcasting: once the entry is gone no
        // newcomer can subscribe, so every subscriber sees this send. The id
        // check keeps a cancelled driver from evicting the flight that
        // replaced it under the same key.
        if let Some((_, flight)) = self
            .0
            .in_flight
            .remove_if(&key, |_, flight| flight.id() == flight_id)
        {
            flight.resolve(outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use super::*;
    use crate::{
        command::{CommandFamily, CompletionRule, StaticCatalog},
        config::AssemblerConfig,
        transport::ScriptedTransport,
    };

    fn cache_over(
        transport: Arc<ScriptedTransport>,
    ) -> ResponseCache<Arc<ScriptedTransport>, StaticCatalog> {
        let catalog = StaticCatalog::new().with_family(
            "status",
            CommandFamily::new(
                "status",
                CompletionRule::Terminator(b"\r\n".to_vec()),
                NonZeroUsize::new(256).expect("non-zero"),
            ),
        );
        let assembler = ResponseAssembler::new(transport, catalog, AssemblerConfig::default());
        ResponseCache::new(assembler, CacheConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_replaces_an_already_cancelled_flight() {
        let transport = Arc::new(
            ScriptedTransport::new().with_reply([(Duration::ZERO, b"STATUS=OK\r\n".to_vec())]),
        );
        let cache = cache_over(Arc::clone(&transport));
        let key = CommandKey::bare("status");

        // The last joiner just detached: the token has fired but the driver
        // has not removed the marker yet.
        let abandoned = InFlightRefresh::new();
        abandoned.cancel_token().cancel();
        cache.0.in_flight.insert(key.clone(), abandoned);

        let response = cache.refresh(&key).await.expect("a fresh refresh runs");
        assert_eq!(response.raw(), b"STATUS=OK\r\n");
        assert_eq!(transport.send_count(), 1);
        assert!(cache.0.in_flight.get(&key).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn a_stale_driver_cleanup_leaves_the_replacement_marker_alone() {
        let transport = Arc::new(ScriptedTransport::new().with_reply([(
            Duration::from_millis(200),
            b"STATUS=OK\r\n".to_vec(),
        )]));
        let cache = cache_over(Arc::clone(&transport));
        let key = CommandKey::bare("status");

        let abandoned = InFlightRefresh::new();
        abandoned.cancel_token().cancel();
        let stale_id = abandoned.id();
        cache.0.in_flight.insert(key.clone(), abandoned);

        let pending = {
            let cache = cache.clone();
            let key = key.clone();
            tokio::spawn(async move { cache.refresh(&key).await })
        };
        tokio::task::yield_now().await;

        // The abandoned flight's driver cleans up late; the replacement
        // marker must survive it.
        assert!(
            cache
                .0
                .in_flight
                .remove_if(&key, |_, flight| flight.id() == stale_id)
                .is_none()
        );
        assert!(cache.0.in_flight.contains_key(&key));

        let response = pending
            .await
            .expect("task joins")
            .expect("refresh completes");
        assert_eq!(response.raw(), b"STATUS=OK\r\n");
    }
}
