//! Engine configuration types.
//!
//! Each component takes a small config struct with validated or defaulted
//! tunables. Defaults mirror the host card's observed behaviour: replies
//! normally land within a couple of seconds, and dashboards tolerate data up
//! to five minutes old.

use std::time::Duration;

/// Tunables for the response assembler.
#[derive(Clone, Copy, Debug)]
pub struct AssemblerConfig {
    /// Upper bound on a single `poll_fragment` wait. Shorter intervals make
    /// cancellation and deadline checks more responsive at the cost of more
    /// wakeups.
    pub poll_interval: Duration,
    /// Maximum number of re-dispatches after a malformed classification.
    /// The deadline keeps counting across retries.
    pub max_retries: u32,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            max_retries: 2,
        }
    }
}

/// Tunables for the response cache.
#[derive(Clone, Copy, Debug)]
pub struct CacheConfig {
    /// TTL applied to newly installed entries.
    pub default_ttl: Duration,
    /// Deadline handed to the assembler for each refresh.
    pub refresh_deadline: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
            refresh_deadline: Duration::from_secs(10),
        }
    }
}

/// Highest refresh rate the scheduler accepts, in refreshes per second.
/// A serial console cannot usefully absorb more than this.
pub const MAX_REFRESH_RATE: usize = 100;

/// Tunables for the background refresh scheduler.
#[derive(Clone, Copy, Debug)]
pub struct SchedulerConfig {
    tick: Duration,
    refreshes_per_second: usize,
}

impl SchedulerConfig {
    /// Build a validated scheduler configuration.
    ///
    /// Returns `None` when `tick` is zero or the rate is zero or above
    /// [`MAX_REFRESH_RATE`].
    #[must_use]
    pub fn new(tick: Duration, refreshes_per_second: usize) -> Option<Self> {
        if tick.is_zero() {
            return None;
        }
        if refreshes_per_second == 0 || refreshes_per_second > MAX_REFRESH_RATE {
            return None;
        }
        Some(Self {
            tick,
            refreshes_per_second,
        })
    }

    /// How often the scheduler wakes to sweep and refresh.
    #[must_use]
    pub fn tick(&self) -> Duration { self.tick }

    /// Pacing budget for refreshes issued against the serial link.
    #[must_use]
    pub fn refreshes_per_second(&self) -> usize { self.refreshes_per_second }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            refreshes_per_second: 5,
        }
    }
}
