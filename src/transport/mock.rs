#![cfg(any(test, feature = "test-helpers"))]
//! Scripted transport for unit and behavioural tests.
//!
//! [`ScriptedTransport`] replays canned reply scripts: each call to `send`
//! consumes the next script, and `poll_fragment` delivers that script's
//! chunks after their configured delays. Delays interact correctly with
//! `tokio::time::pause`, so tests can fast-forward through multi-second
//! deadlines deterministically.

use std::{
    collections::VecDeque,
    io,
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::sleep;

use super::{RawFragment, Transport};

#[derive(Clone, Debug)]
struct Chunk {
    delay: Duration,
    bytes: Bytes,
}

#[derive(Debug, Default)]
struct ScriptState {
    scripts: VecDeque<Vec<Chunk>>,
    pending: VecDeque<Chunk>,
    sent: Vec<Vec<u8>>,
    unavailable: bool,
}

enum PollAction {
    Idle,
    Wait,
    Deliver(Duration, Bytes),
}

/// Transport double that replays scripted replies.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    state: Mutex<ScriptState>,
    sends: AtomicUsize,
}

impl ScriptedTransport {
    /// Create a transport with no scripted replies; every poll times out.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Create a transport whose reads and writes always fail.
    #[must_use]
    pub fn unavailable() -> Self {
        let transport = Self::default();
        transport
            .state
            .lock()
            .expect("script state poisoned")
            .unavailable = true;
        transport
    }

    /// Queue the reply script consumed by the next unscripted `send`.
    ///
    /// Each chunk is `(delay since the previous chunk, bytes)`.
    pub fn push_reply<I>(&self, chunks: I)
    where
        I: IntoIterator<Item = (Duration, Vec<u8>)>,
    {
        let script = chunks
            .into_iter()
            .map(|(delay, bytes)| Chunk {
                delay,
                bytes: Bytes::from(bytes),
            })
            .collect();
        self.state
            .lock()
            .expect("script state poisoned")
            .scripts
            .push_back(script);
    }

    /// Builder-style form of [`push_reply`](Self::push_reply).
    #[must_use]
    pub fn with_reply<I>(self, chunks: I) -> Self
    where
        I: IntoIterator<Item = (Duration, Vec<u8>)>,
    {
        self.push_reply(chunks);
        self
    }

    /// Number of `send` calls observed so far.
    #[must_use]
    pub fn send_count(&self) -> usize { self.sends.load(Ordering::SeqCst) }

    /// All request byte strings written so far, in dispatch order.
    #[must_use]
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .expect("script state poisoned")
            .sent
            .clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, bytes: &[u8]) -> io::Result<()> {
        let mut state = self.state.lock().expect("script state poisoned");
        if state.unavailable {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "link down"));
        }
        state.sent.push(bytes.to_vec());
        // A new dispatch supersedes whatever the previous reply left queued;
        // the half-duplex link drains before the next command goes out.
        state.pending = state.scripts.pop_front().unwrap_or_default().into();
        drop(state);
        self.sends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn poll_fragment(&self, timeout: Duration) -> io::Result<Option<RawFragment>> {
        let action = {
            let mut state = self.state.lock().expect("script state poisoned");
            if state.unavailable {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "link down"));
            }
            match state.pending.front_mut() {
                None => PollAction::Idle,
                Some(chunk) if chunk.delay <= timeout => {
                    let chunk = state.pending.pop_front().expect("front exists");
                    PollAction::Deliver(chunk.delay, chunk.bytes)
                }
                Some(chunk) => {
                    chunk.delay -= timeout;
                    PollAction::Wait
                }
            }
        };

        match action {
            PollAction::Idle | PollAction::Wait => {
                sleep(timeout).await;
                Ok(None)
            }
            PollAction::Deliver(delay, bytes) => {
                sleep(delay).await;
                Ok(Some(RawFragment::received_now(bytes)))
            }
        }
    }
}
