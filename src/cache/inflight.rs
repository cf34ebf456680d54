//! Registry entries for coalesced in-flight refreshes.
//!
//! New callers attach to an existing [`InFlightRefresh`] instead of starting
//! duplicate work; the driver resolves every attached caller with one
//! broadcast. A [`JoinGuard`] tracks attachment: when the last joiner
//! detaches before the outcome lands, the guard cancels the underlying
//! assembly. Detaching while others remain joined affects nobody else.

use std::sync::{
    Arc,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::assembler::AssemblyResult;

/// Broadcast capacity per refresh. The driver sends exactly one outcome, so
/// a single slot suffices; the margin guards against lag-drop semantics.
const OUTCOME_CHANNEL_CAPACITY: usize = 4;

static NEXT_FLIGHT_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Debug)]
pub(super) struct InFlightRefresh {
    id: u64,
    tx: broadcast::Sender<AssemblyResult>,
    joiners: Arc<AtomicUsize>,
    cancel: CancellationToken,
}

impl InFlightRefresh {
    pub(super) fn new() -> Self {
        let (tx, _) = broadcast::channel(OUTCOME_CHANNEL_CAPACITY);
        Self {
            id: NEXT_FLIGHT_ID.fetch_add(1, Ordering::Relaxed),
            tx,
            joiners: Arc::new(AtomicUsize::new(0)),
            cancel: CancellationToken::new(),
        }
    }

    /// Identity of this flight, distinguishing it from any replacement
    /// registered under the same key.
    pub(super) fn id(&self) -> u64 { self.id }

    /// Whether the flight was already cancelled by its joiners detaching.
    /// A cancelled flight must not accept new joiners: its driver is
    /// unwinding and will broadcast nothing they want.
    pub(super) fn is_cancelled(&self) -> bool { self.cancel.is_cancelled() }

    /// Attach one caller: a receiver for the outcome plus its join guard.
    pub(super) fn join(&self) -> (broadcast::Receiver<AssemblyResult>, JoinGuard) {
        self.joiners.fetch_add(1, Ordering::SeqCst);
        let guard = JoinGuard {
            joiners: Arc::clone(&self.joiners),
            cancel: self.cancel.clone(),
        };
        (self.tx.subscribe(), guard)
    }

    /// Token the driver hands to the assembler.
    pub(super) fn cancel_token(&self) -> CancellationToken { self.cancel.clone() }

    /// Resolve every joined caller with the outcome.
    ///
    /// Send errors mean every joiner already detached; the outcome is
    /// dropped, which is exactly what a fully cancelled refresh wants.
    pub(super) fn resolve(self, outcome: AssemblyResult) { let _ = self.tx.send(outcome); }
}

/// Tracks one caller's attachment to an in-flight refresh.
///
/// Dropping the guard detaches the caller. Cancellation fires only when the
/// joiner count reaches zero; once the outcome has been broadcast the token
/// is inert, so guards dropped after a normal completion are harmless.
#[derive(Debug)]
pub(super) struct JoinGuard {
    joiners: Arc<AtomicUsize>,
    cancel: CancellationToken,
}

impl Drop for JoinGuard {
    fn drop(&mut self) {
        if self.joiners.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_detaching_joiner_triggers_cancellation() {
        let flight = InFlightRefresh::new();
        let token = flight.cancel_token();

        let (_rx_a, guard_a) = flight.join();
        let (_rx_b, guard_b) = flight.join();

        drop(guard_a);
        assert!(!token.is_cancelled(), "one joiner is still attached");

        drop(guard_b);
        assert!(token.is_cancelled(), "no joiners remain");
    }

    #[tokio::test]
    async fn every_joiner_receives_the_same_outcome() {
        let flight = InFlightRefresh::new();
        let (mut rx_a, _guard_a) = flight.join();
        let (mut rx_b, _guard_b) = flight.join();

        let key = crate::command::CommandKey::bare("status");
        flight.resolve(Err(crate::assembler::AssemblyError::Timeout {
            key: key.clone(),
        }));

        let outcome_a = rx_a.recv().await.expect("outcome broadcast");
        let outcome_b = rx_b.recv().await.expect("outcome broadcast");
        assert_eq!(outcome_a, outcome_b);
        assert_eq!(
            outcome_a,
            Err(crate::assembler::AssemblyError::Timeout { key })
        );
    }
}
