//! Metric helpers for `hostlink`.
//!
//! This module defines metric names and simple helper functions wrapping the
//! [`metrics`](https://docs.rs/metrics) crate. With the `metrics` feature
//! disabled the helpers compile to no-ops so call sites stay unconditional.

#[cfg(feature = "metrics")]
use metrics::{counter, gauge};

/// Name of the counter tracking cache hits.
pub const CACHE_HITS: &str = "hostlink_cache_hits_total";
/// Name of the counter tracking cache misses.
pub const CACHE_MISSES: &str = "hostlink_cache_misses_total";
/// Name of the counter tracking fragments consumed by the assembler.
pub const FRAGMENTS_PROCESSED: &str = "hostlink_fragments_processed_total";
/// Name of the counter tracking assembly failures, labelled by kind.
pub const ASSEMBLY_FAILURES: &str = "hostlink_assembly_failures_total";
/// Name of the gauge tracking in-flight assemblies.
pub const ASSEMBLIES_IN_FLIGHT: &str = "hostlink_assemblies_in_flight";

/// Record a cache hit.
pub fn inc_cache_hits() {
    #[cfg(feature = "metrics")]
    counter!(CACHE_HITS).increment(1);
}

/// Record a cache miss.
pub fn inc_cache_misses() {
    #[cfg(feature = "metrics")]
    counter!(CACHE_MISSES).increment(1);
}

/// Record a fragment consumed by the assembler.
pub fn inc_fragments() {
    #[cfg(feature = "metrics")]
    counter!(FRAGMENTS_PROCESSED).increment(1);
}

/// Record an assembly failure with its kind label.
pub fn inc_assembly_failures(kind: &'static str) {
    #[cfg(feature = "metrics")]
    counter!(ASSEMBLY_FAILURES, "kind" => kind).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = kind;
}

/// Increment the in-flight assemblies gauge.
pub fn inc_in_flight() {
    #[cfg(feature = "metrics")]
    gauge!(ASSEMBLIES_IN_FLIGHT).increment(1.0);
}

/// Decrement the in-flight assemblies gauge.
pub fn dec_in_flight() {
    #[cfg(feature = "metrics")]
    gauge!(ASSEMBLIES_IN_FLIGHT).decrement(1.0);
}
