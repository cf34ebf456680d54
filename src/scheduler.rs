//! Background refresh of live cache keys.
//!
//! [`RefreshScheduler`] runs one task that periodically sweeps expired
//! entries and refreshes every key marked live, independently of consumer
//! reads. Refreshes are paced by a rate limiter so a burst of due keys never
//! floods the serial link, and the whole task stops on a cancellation token.
//!
//! Scheduler failures are recorded against the cache entry (the
//! last-refresh-failed flag) and logged, never propagated: consumers of a
//! live key keep reading the last good response until a refresh succeeds or
//! the entry is explicitly invalidated.

use std::time::Duration;

use leaky_bucket::RateLimiter;
use tokio::{task::JoinHandle, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    cache::ResponseCache, command::CommandCatalog, config::SchedulerConfig,
    transport::Transport,
};

/// Handle to the background refresh task.
///
/// Dropping the handle does not stop the task; call
/// [`shutdown`](Self::shutdown) for an orderly stop.
pub struct RefreshScheduler {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl RefreshScheduler {
    /// Start the refresh task over a cache handle.
    #[must_use]
    pub fn spawn<T, C>(cache: ResponseCache<T, C>, config: SchedulerConfig) -> Self
    where
        T: Transport + 'static,
        C: CommandCatalog + 'static,
    {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(cache, config, cancel.clone()));
        Self { cancel, task }
    }

    /// Ask the task to stop without waiting for it.
    pub fn request_shutdown(&self) { self.cancel.cancel(); }

    /// Stop the task and wait for it to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }

    /// Whether the background task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool { self.task.is_finished() }
}

async fn run<T, C>(cache: ResponseCache<T, C>, config: SchedulerConfig, cancel: CancellationToken)
where
    T: Transport + 'static,
    C: CommandCatalog + 'static,
{
    let limiter = RateLimiter::builder()
        .max(config.refreshes_per_second())
        .initial(config.refreshes_per_second())
        .refill(config.refreshes_per_second())
        .interval(Duration::from_secs(1))
        .build();
    let mut ticker = time::interval(config.tick());
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let evicted = cache.sweep_expired();
        if evicted > 0 {
            debug!(evicted, "evicted expired cache entries");
        }

        for (key, every) in cache.live_keys() {
            if cancel.is_cancelled() {
                return;
            }
            if !cache.is_due(&key, every) {
                continue;
            }
            tokio::select! {
                () = cancel.cancelled() => return,
                () = limiter.acquire(1) => {}
            }
            if let Err(err) = cache.refresh(&key).await {
                // Recorded on the entry by the refresh driver; consumers
                // keep the last good response.
                warn!(%key, %err, "background refresh failed");
            }
        }
    }

    debug!("refresh scheduler stopped");
}
