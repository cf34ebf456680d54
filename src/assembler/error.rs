//! Failure taxonomy for response assembly.

use thiserror::Error;

use crate::{command::CommandKey, matcher::MalformedKind};

/// Failures surfaced by [`ResponseAssembler::assemble`](super::ResponseAssembler::assemble).
///
/// The enum is `Clone` so a single outcome can be broadcast to every caller
/// joined to a coalesced refresh.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum AssemblyError {
    /// The deadline elapsed without a complete classification.
    #[error("assembly for `{key}` timed out")]
    Timeout {
        /// Command the deadline expired on.
        key: CommandKey,
    },
    /// The pattern matcher rejected the accumulated bytes and retries are
    /// exhausted.
    #[error("malformed response for `{key}`: {kind}")]
    Malformed {
        /// Command whose response was rejected.
        key: CommandKey,
        /// Why the bytes were rejected.
        kind: MalformedKind,
    },
    /// An assembly for this key already exists. Caller error; the engine's
    /// coalescing layer joins in-flight work instead of triggering this.
    #[error("assembly for `{key}` is already in flight")]
    AlreadyInFlight {
        /// Command with the existing assembly.
        key: CommandKey,
    },
    /// External cancellation was honoured before completion.
    #[error("assembly for `{key}` was cancelled")]
    Cancelled {
        /// Command whose assembly was cancelled.
        key: CommandKey,
    },
    /// The transport could not be written or read at all.
    #[error("transport unavailable: {message}")]
    TransportUnavailable {
        /// Underlying I/O error rendered as text so the variant stays `Clone`.
        message: String,
    },
}

impl AssemblyError {
    pub(crate) fn transport(err: &std::io::Error) -> Self {
        Self::TransportUnavailable {
            message: err.to_string(),
        }
    }

    /// Stable label used for failure metrics.
    #[must_use]
    pub fn kind_label(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::Malformed { .. } => "malformed",
            Self::AlreadyInFlight { .. } => "already_in_flight",
            Self::Cancelled { .. } => "cancelled",
            Self::TransportUnavailable { .. } => "transport_unavailable",
        }
    }
}
