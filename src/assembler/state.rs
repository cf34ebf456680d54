//! Per-command accumulation state and its lifecycle phases.

use bytes::BytesMut;
use tokio::time::Instant;

/// Lifecycle phase of one in-flight assembly.
///
/// The terminal outcomes (completed, malformed, timed out, cancelled) are
/// not phases: they are the value the assembly resolves to, and the state
/// object is destroyed the moment one is reached. No transition leaves a
/// terminal outcome.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum AssemblyPhase {
    /// State created; the command is being dispatched to the transport.
    /// Retries re-enter this phase with the retry count incremented, so
    /// deadline accounting spans all retries of one logical assembly.
    Idle,
    /// Waiting on the transport for the next fragment. The only suspension
    /// point in the engine.
    AwaitingFragment,
    /// A fragment was just appended and classification returned pending.
    Accumulating,
}

/// Accumulator for one in-flight command.
///
/// Owned exclusively by the assembler; at most one exists per command key at
/// any instant. Fragments are append-only in arrival order; the assembler
/// never reorders them. Out-of-order arrival is the transport's
/// responsibility to avoid, not this type's to fix.
#[derive(Debug)]
pub(super) struct AssemblyState {
    buffer: BytesMut,
    started_at: Instant,
    retry_count: u32,
    phase: AssemblyPhase,
}

impl AssemblyState {
    pub(super) fn new(started_at: Instant) -> Self {
        Self {
            buffer: BytesMut::new(),
            started_at,
            retry_count: 0,
            phase: AssemblyPhase::Idle,
        }
    }

    pub(super) fn append(&mut self, payload: &[u8]) {
        self.buffer.extend_from_slice(payload);
        self.phase = AssemblyPhase::Accumulating;
    }

    /// Clear the buffer for a re-dispatch of the same logical assembly.
    /// The start instant is untouched: the deadline spans all retries.
    pub(super) fn begin_retry(&mut self) {
        self.buffer.clear();
        self.retry_count += 1;
        self.phase = AssemblyPhase::Idle;
    }

    pub(super) fn await_fragment(&mut self) { self.phase = AssemblyPhase::AwaitingFragment; }

    pub(super) fn accumulated(&self) -> &[u8] { &self.buffer }

    pub(super) fn len(&self) -> usize { self.buffer.len() }

    pub(super) fn retry_count(&self) -> u32 { self.retry_count }

    pub(super) fn phase(&self) -> AssemblyPhase { self.phase }

    pub(super) fn started_at(&self) -> Instant { self.started_at }

    pub(super) fn take_raw(&mut self) -> Vec<u8> { self.buffer.split().freeze().to_vec() }
}
