//! Client connection state.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tether_core::{ConnectionId, ServerMessage};
use tracing::{debug, error, warn};

use crate::reactive::ReactiveVar;
use crate::transport::Transport;

type CloseCallback = Box<dyn FnOnce() + Send>;

/// One client session.
///
/// A connection starts live and becomes closed exactly once. It is never
/// reopened; a reconnecting client gets a new [`ConnectionId`].
pub struct Connection {
    id: ConnectionId,
    live: AtomicBool,
    user_id: ReactiveVar<Option<String>>,
    close_callbacks: Mutex<Vec<CloseCallback>>,
    protocol_version: Mutex<Option<&'static str>>,
    transport: Arc<dyn Transport>,
    connected_at: Instant,
}

/// Snapshot returned by [`Connection::status`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    /// Connection id.
    pub id: ConnectionId,
    /// Whether the connection is still live.
    pub connected: bool,
    /// Negotiated protocol version, once the handshake completed.
    pub protocol_version: Option<&'static str>,
    /// Current user id.
    pub user_id: Option<String>,
}

impl Connection {
    /// Create a live connection over `transport`.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_id(ConnectionId::new(), transport)
    }

    /// Create a live connection with a caller-chosen id.
    pub fn with_id(id: ConnectionId, transport: Arc<dyn Transport>) -> Self {
        Self {
            id,
            live: AtomicBool::new(true),
            user_id: ReactiveVar::new(None),
            close_callbacks: Mutex::new(Vec::new()),
            protocol_version: Mutex::new(None),
            transport,
            connected_at: Instant::now(),
        }
    }

    /// Connection id.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Whether the connection is still live.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Liveness, handshake and user snapshot.
    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            id: self.id.clone(),
            connected: self.is_live(),
            protocol_version: *self.protocol_version.lock(),
            user_id: self.user_id.get_untracked(),
        }
    }

    /// Current value of the user-id slot.
    pub fn user_id(&self) -> Option<String> {
        self.user_id.get_untracked()
    }

    pub(crate) fn user_id_var(&self) -> &ReactiveVar<Option<String>> {
        &self.user_id
    }

    /// Overwrite the user-id slot, invalidating every subscription run.
    ///
    /// Only reachable through [`InvocationContext::set_user_id`], which
    /// checks the caller is a method invoked on this connection.
    ///
    /// [`InvocationContext::set_user_id`]: crate::context::InvocationContext::set_user_id
    pub(crate) fn set_user_id(&self, user_id: Option<String>) {
        debug!(connection_id = %self.id, user_id = ?user_id, "user id changed");
        self.user_id.set(user_id);
    }

    /// Negotiated protocol version, if the handshake has completed.
    pub fn protocol_version(&self) -> Option<&'static str> {
        *self.protocol_version.lock()
    }

    pub(crate) fn complete_handshake(&self, version: &'static str) {
        *self.protocol_version.lock() = Some(version);
    }

    /// Time since the connection was created.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Register a callback fired once when the connection closes.
    ///
    /// Callbacks run in registration order. Registering on an already closed
    /// connection schedules the callback on the runtime instead of running it
    /// inline, so the caller never observes it re-entrantly.
    pub fn on_close(&self, callback: impl FnOnce() + Send + 'static) {
        let mut callbacks = self.close_callbacks.lock();
        if self.is_live() {
            callbacks.push(Box::new(callback));
            return;
        }
        drop(callbacks);

        let connection_id = self.id.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            drop(handle.spawn(async move {
                run_close_callback(&connection_id, Box::new(callback));
            }));
        } else {
            warn!(%connection_id, "no runtime for late close callback, running inline");
            run_close_callback(&connection_id, Box::new(callback));
        }
    }

    /// Close the connection. Idempotent.
    ///
    /// Marks the connection dead, fires every close callback once in
    /// registration order, then tears down the transport.
    pub fn close(&self) {
        let callbacks = {
            let mut callbacks = self.close_callbacks.lock();
            if !self.live.swap(false, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut *callbacks)
        };

        debug!(connection_id = %self.id, callbacks = callbacks.len(), "closing connection");
        for callback in callbacks {
            run_close_callback(&self.id, callback);
        }
        self.transport.close();
    }

    /// Encode and queue a message. Returns `false` once closed or if the
    /// transport refused the frame.
    ///
    /// A live connection whose transport refuses a frame is closed: the
    /// client would otherwise wait forever on a reply that was dropped.
    pub fn send(&self, message: &ServerMessage) -> bool {
        if !self.is_live() {
            return false;
        }
        match message.encode() {
            Ok(json) => {
                if self.transport.send(Arc::new(json)) {
                    return true;
                }
                warn!(connection_id = %self.id, "outbound queue refused frame, closing slow client");
                self.close();
                false
            }
            Err(e) => {
                error!(connection_id = %self.id, error = %e, "failed to encode message");
                false
            }
        }
    }
}

fn run_close_callback(connection_id: &ConnectionId, callback: CloseCallback) {
    if catch_unwind(AssertUnwindSafe(callback)).is_err() {
        error!(%connection_id, "close callback panicked");
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("live", &self.is_live())
            .field("user_id", &self.user_id())
            .finish_non_exhaustive()
    }
}
