//! Outbound half of a client transport.
//!
//! The engine never touches sockets. It hands encoded frames to a
//! [`Transport`] and asks it to tear down when a connection closes.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Sink for encoded server messages belonging to one connection.
pub trait Transport: Send + Sync {
    /// Queue an encoded frame. Returns `false` if it could not be queued.
    fn send(&self, frame: Arc<String>) -> bool;

    /// Tear down the underlying channel. Idempotent.
    fn close(&self);

    /// Whether [`close`](Self::close) has been called.
    fn is_closed(&self) -> bool;
}

/// [`Transport`] backed by a bounded mpsc queue.
///
/// The receiving half is drained by a socket writer (see
/// [`crate::websocket::session`]) or directly by tests. Teardown is
/// signalled through a [`CancellationToken`].
pub struct ChannelTransport {
    tx: mpsc::Sender<Arc<String>>,
    closed: CancellationToken,
    dropped: AtomicU64,
}

impl ChannelTransport {
    /// Create a transport with an outbound queue of `capacity` frames.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let transport = Self {
            tx,
            closed: CancellationToken::new(),
            dropped: AtomicU64::new(0),
        };
        (transport, rx)
    }

    /// Token cancelled when the transport is closed.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Frames dropped because the queue was full or gone.
    pub fn drop_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Transport for ChannelTransport {
    fn send(&self, frame: Arc<String>) -> bool {
        if self.closed.is_cancelled() {
            return false;
        }
        if self.tx.try_send(frame).is_ok() {
            true
        } else {
            let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    fn close(&self) {
        self.closed.cancel();
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl std::fmt::Debug for ChannelTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelTransport")
            .field("closed", &self.is_closed())
            .field("dropped", &self.drop_count())
            .finish()
    }
}
