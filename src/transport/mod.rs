//! The serial transport collaborator boundary.
//!
//! The engine never opens or configures the physical link itself; it drives
//! whatever [`Transport`] implementation it is given. The trait is the only
//! I/O boundary in the crate, so the engine cannot tell whether bytes come
//! from real hardware or a simulation.

use std::{
    io,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::Bytes;

#[cfg(any(test, feature = "test-helpers"))]
pub mod mock;
#[cfg(any(test, feature = "test-helpers"))]
pub use mock::ScriptedTransport;

/// One raw chunk of bytes delivered by the transport for an in-flight
/// command.
///
/// Fragments are ephemeral: the assembler consumes the payload and discards
/// the fragment.
#[derive(Clone, Debug)]
pub struct RawFragment {
    payload: Bytes,
    received_at: Instant,
}

impl RawFragment {
    /// Wrap a received chunk with its arrival timestamp.
    #[must_use]
    pub fn new(payload: Bytes, received_at: Instant) -> Self {
        Self {
            payload,
            received_at,
        }
    }

    /// Wrap a received chunk, timestamping it now.
    #[must_use]
    pub fn received_now(payload: Bytes) -> Self { Self::new(payload, Instant::now()) }

    /// Borrow the fragment bytes.
    #[must_use]
    pub fn payload(&self) -> &[u8] { &self.payload }

    /// Consume the fragment, returning the owned payload.
    #[must_use]
    pub fn into_payload(self) -> Bytes { self.payload }

    /// When the transport delivered this fragment.
    #[must_use]
    pub fn received_at(&self) -> Instant { self.received_at }
}

/// Byte-oriented serial link to the host card.
///
/// Implementations must tolerate concurrent `&self` access, but the engine
/// guarantees that at most one assembly drives `send`/`poll_fragment` at a
/// time (the single-owner dispatch rule): a serial link cannot interleave
/// unrelated commands without corrupting fragment attribution.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write an encoded command to the device.
    ///
    /// # Errors
    ///
    /// Returns an [`io::Error`] when the link cannot be written at all.
    async fn send(&self, bytes: &[u8]) -> io::Result<()>;

    /// Wait up to `timeout` for the next available fragment.
    ///
    /// Returns `Ok(None)` when no data arrived within the window; that is
    /// not an error, the caller re-checks its deadline and polls again.
    ///
    /// # Errors
    ///
    /// Returns an [`io::Error`] when the link cannot be read at all.
    async fn poll_fragment(&self, timeout: Duration) -> io::Result<Option<RawFragment>>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    async fn send(&self, bytes: &[u8]) -> io::Result<()> { (**self).send(bytes).await }

    async fn poll_fragment(&self, timeout: Duration) -> io::Result<Option<RawFragment>> {
        (**self).poll_fragment(timeout).await
    }
}
