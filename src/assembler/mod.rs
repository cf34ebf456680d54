//! Stateful assembly of fragmented command responses.
//!
//! [`ResponseAssembler`] drives the transport for one command at a time:
//! dispatch the encoded request, poll for fragments, append them in arrival
//! order, and classify the accumulated bytes after every fragment until the
//! pattern matcher reports completion or the operation resolves to a typed
//! failure. Per-key exclusivity and the single-owner transport rule both
//! live here.

use std::{sync::Arc, time::SystemTime};

use dashmap::{DashMap, mapref::entry::Entry};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    command::{CommandCatalog, CommandKey},
    config::AssemblerConfig,
    matcher::{Classification, MalformedKind, classify},
    metrics,
    response::StructuredResponse,
    transport::Transport,
};

pub mod error;
mod state;

pub use error::AssemblyError;

use state::AssemblyState;

/// Result alias for assembly operations.
pub type AssemblyResult = Result<Arc<StructuredResponse>, AssemblyError>;

/// Reconstructs logically complete responses from raw serial fragments.
///
/// The assembler holds the only mutable per-command state in the engine. Two
/// invariants are enforced here:
///
/// - at most one assembly exists per [`CommandKey`] at any instant; a second
///   `assemble` for the same key is rejected with
///   [`AssemblyError::AlreadyInFlight`];
/// - only one assembly at a time writes to the transport, whichever key it
///   belongs to. Other assemblies queue on the dispatch lock.
pub struct ResponseAssembler<T, C> {
    transport: T,
    catalog: C,
    config: AssemblerConfig,
    dispatch: tokio::sync::Mutex<()>,
    in_flight: DashMap<CommandKey, CancellationToken>,
}

impl<T, C> ResponseAssembler<T, C>
where
    T: Transport,
    C: CommandCatalog,
{
    /// Create an assembler over the given transport and command catalog.
    pub fn new(transport: T, catalog: C, config: AssemblerConfig) -> Self {
        Self {
            transport,
            catalog,
            config,
            dispatch: tokio::sync::Mutex::new(()),
            in_flight: DashMap::new(),
        }
    }

    /// Assemble the response for `key`, resolving no later than `deadline`.
    ///
    /// # Errors
    ///
    /// Returns [`AssemblyError::AlreadyInFlight`] when an assembly for the
    /// key exists, [`AssemblyError::Timeout`] when the deadline elapses,
    /// [`AssemblyError::Malformed`] when classification rejects the bytes
    /// and retries are exhausted, and
    /// [`AssemblyError::TransportUnavailable`] when the link cannot be used
    /// at all.
    pub async fn assemble(&self, key: &CommandKey, deadline: Instant) -> AssemblyResult {
        self.assemble_with_cancel(key, deadline, CancellationToken::new())
            .await
    }

    /// [`assemble`](Self::assemble) with an externally owned cancellation
    /// token.
    ///
    /// Triggering the token destroys the assembly immediately and resolves
    /// the operation to [`AssemblyError::Cancelled`]. Fragments arriving for
    /// the key afterwards are discarded; a dead assembly is never
    /// resurrected.
    ///
    /// # Errors
    ///
    /// As for [`assemble`](Self::assemble), plus
    /// [`AssemblyError::Cancelled`].
    pub async fn assemble_with_cancel(
        &self,
        key: &CommandKey,
        deadline: Instant,
        cancel: CancellationToken,
    ) -> AssemblyResult {
        match self.in_flight.entry(key.clone()) {
            Entry::Occupied(_) => {
                return Err(AssemblyError::AlreadyInFlight { key: key.clone() });
            }
            Entry::Vacant(vacant) => {
                vacant.insert(cancel.clone());
            }
        }
        metrics::inc_in_flight();
        let _guard = InFlightGuard {
            in_flight: &self.in_flight,
            key,
        };

        let result = self.run(key, deadline, &cancel).await;
        if let Err(err) = &result {
            metrics::inc_assembly_failures(err.kind_label());
        }
        result
    }

    /// Cancel the in-flight assembly for `key`, if any.
    ///
    /// Returns whether an assembly was found to cancel.
    pub fn cancel(&self, key: &CommandKey) -> bool {
        match self.in_flight.get(key) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Whether an assembly for `key` is currently in flight.
    #[must_use]
    pub fn is_in_flight(&self, key: &CommandKey) -> bool { self.in_flight.contains_key(key) }

    async fn run(
        &self,
        key: &CommandKey,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> AssemblyResult {
        let family = self.catalog.family(key);
        let request = self.catalog.encode_request(key);

        // Single-owner dispatch point: assemblies for other keys queue here
        // instead of interleaving commands on the serial link.
        let _dispatch = tokio::select! {
            () = cancel.cancelled() => {
                return Err(AssemblyError::Cancelled { key: key.clone() });
            }
            guard = self.dispatch.lock() => guard,
        };

        // The deadline may have elapsed while queued behind another key.
        // Writing the command now would orphan a reply on the link and
        // corrupt fragment attribution for whoever dispatches next.
        if Instant::now() >= deadline {
            warn!(%key, "deadline expired while queued for dispatch");
            return Err(AssemblyError::Timeout { key: key.clone() });
        }

        let mut state = AssemblyState::new(Instant::now());
        debug!(%key, "dispatching command");
        self.transport
            .send(&request)
            .await
            .map_err(|err| AssemblyError::transport(&err))?;
        state.await_fragment();

        loop {
            let now = Instant::now();
            if now >= deadline {
                warn!(
                    %key,
                    retries = state.retry_count(),
                    elapsed_ms = state.started_at().elapsed().as_millis(),
                    "assembly deadline exceeded",
                );
                return Err(AssemblyError::Timeout { key: key.clone() });
            }
            let wait = self.config.poll_interval.min(deadline - now);

            let polled = tokio::select! {
                () = cancel.cancelled() => {
                    debug!(%key, phase = ?state.phase(), "assembly cancelled");
                    return Err(AssemblyError::Cancelled { key: key.clone() });
                }
                result = self.transport.poll_fragment(wait) => {
                    result.map_err(|err| AssemblyError::transport(&err))?
                }
            };
            let Some(fragment) = polled else {
                state.await_fragment();
                continue;
            };

            metrics::inc_fragments();
            state.append(fragment.payload());

            let verdict = match classify(state.accumulated(), family) {
                Classification::Complete(fields) => {
                    debug!(%key, bytes = state.len(), "assembly complete");
                    return Ok(Arc::new(StructuredResponse::new(
                        fields,
                        state.take_raw(),
                        SystemTime::now(),
                    )));
                }
                Classification::Pending => {
                    // Never loop pending past the family's size cap.
                    let over_cap = family
                        .is_some_and(|f| state.len() > f.max_response_size().get());
                    if over_cap {
                        Some(MalformedKind::Overflow)
                    } else {
                        None
                    }
                }
                Classification::Malformed(kind) => Some(kind),
            };

            match verdict {
                None => state.await_fragment(),
                Some(kind) => {
                    // Re-dispatching an unknown command would fail identically;
                    // fail closed without hammering the device.
                    let retryable = kind != MalformedKind::UnknownFamily;
                    if retryable && state.retry_count() < self.config.max_retries {
                        warn!(
                            %key,
                            %kind,
                            retry = state.retry_count() + 1,
                            "malformed response, re-dispatching",
                        );
                        state.begin_retry();
                        self.transport
                            .send(&request)
                            .await
                            .map_err(|err| AssemblyError::transport(&err))?;
                        state.await_fragment();
                    } else {
                        return Err(AssemblyError::Malformed {
                            key: key.clone(),
                            kind,
                        });
                    }
                }
            }
        }
    }
}

/// Removes the in-flight marker when an assembly resolves, whatever the
/// outcome. Dropping the marker is what destroys the assembly's identity:
/// later fragments find no state to attach to.
struct InFlightGuard<'a> {
    in_flight: &'a DashMap<CommandKey, CancellationToken>,
    key: &'a CommandKey,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(self.key);
        metrics::dec_in_flight();
    }
}
