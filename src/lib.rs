//! Public API for the `hostlink` library.
//!
//! This crate provides the response assembly and caching engine for PCIe
//! host cards reachable over a byte-oriented serial link: fragment
//! classification and reassembly, typed failure handling, a coalescing
//! response cache, and a background refresh scheduler. The transport, the
//! command catalog, and snapshot persistence are collaborator traits so the
//! engine never knows whether bytes come from hardware or a simulation.

pub mod assembler;
pub mod cache;
pub mod command;
pub mod config;
pub mod matcher;
pub mod metrics;
pub mod response;
pub mod scheduler;
pub mod transport;

pub use assembler::{AssemblyError, AssemblyResult, ResponseAssembler};
pub use cache::{
    CacheEntry,
    CacheSnapshot,
    CacheStats,
    FileSnapshotStore,
    ResponseCache,
    SnapshotEntry,
    SnapshotError,
    SnapshotStore,
};
pub use command::{CommandCatalog, CommandFamily, CommandKey, CompletionRule, StaticCatalog};
pub use config::{AssemblerConfig, CacheConfig, MAX_REFRESH_RATE, SchedulerConfig};
pub use matcher::{Classification, MalformedKind, classify, decode_fields};
pub use response::{FieldValue, StructuredResponse};
pub use scheduler::RefreshScheduler;
pub use transport::{RawFragment, Transport};
#[cfg(any(test, feature = "test-helpers"))]
pub use transport::ScriptedTransport;
