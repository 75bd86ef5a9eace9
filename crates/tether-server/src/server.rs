//! `Server`: the composition root.
//!
//! Owns the connection set, the hook registries, the method and
//! publication tables and the subscription engine. Transports report
//! connects, frames and disconnects here; everything else is routed on.

use std::collections::HashMap;
use std::future::{Future, IntoFuture};
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use metrics::{counter, gauge, histogram};
use parking_lot::RwLock;
use serde_json::Value;
use tether_core::messages::{SUPPORTED_PROTOCOL_VERSIONS, negotiate_version};
use tether_core::{CallId, ClientMessage, ConnectionId, ServerMessage, SubscriptionId};
use tether_hooks::{HookHandle, HookRegistry};
use tracing::{Instrument, debug, info, info_span, instrument};

use crate::connection::Connection;
use crate::context::InvocationContext;
use crate::methods::{
    MethodHandler, MethodRegistry, Outcome, Params, Reply, async_method_fn, method_fn,
};
use crate::metrics::{
    CONNECTION_DURATION_SECONDS, CONNECTIONS_ACTIVE, CONNECTIONS_CLOSED_TOTAL, CONNECTIONS_TOTAL,
    MESSAGES_RECEIVED_TOTAL, PROTOCOL_ERRORS_TOTAL,
};
use crate::publications::{PublicationRegistry, PublishHandler, async_publish_fn, publish_fn};
use crate::subscription::{SubscriptionCallbacks, SubscriptionEngine};
use crate::transport::Transport;

/// Callback fired for every new connection.
pub type ConnectionHook = dyn Fn(&Arc<Connection>) + Send + Sync;

/// Callback fired for every decoded inbound message, before routing.
pub type MessageHook = dyn Fn(&ClientMessage, &Arc<Connection>) + Send + Sync;

struct Inner {
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    connection_hooks: HookRegistry<ConnectionHook>,
    message_hooks: HookRegistry<MessageHook>,
    methods: Arc<MethodRegistry>,
    publications: Arc<PublicationRegistry>,
    subscriptions: Arc<SubscriptionEngine>,
}

impl Inner {
    fn forget(&self, connection_id: &ConnectionId) {
        let _ = self.connections.write().remove(connection_id);
        let stopped = self.subscriptions.stop_all(connection_id);
        info!(%connection_id, subscriptions = stopped, "connection closed");
    }
}

/// The real-time server. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

impl Server {
    /// Create a server with empty registries.
    pub fn new() -> Self {
        let methods = Arc::new(MethodRegistry::new());
        let publications = Arc::new(PublicationRegistry::new());
        let subscriptions = Arc::new(SubscriptionEngine::new(publications.clone(), methods.clone()));
        Self {
            inner: Arc::new(Inner {
                connections: RwLock::new(HashMap::new()),
                connection_hooks: HookRegistry::new("connection"),
                message_hooks: HookRegistry::new("message"),
                methods,
                publications,
                subscriptions,
            }),
        }
    }

    // ── Registration ────────────────────────────────────────────────

    /// Register a method. The closure may return a [`Reply`] or an
    /// [`Outcome`].
    pub fn register_method<F, R>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&Arc<InvocationContext>, Params) -> R + Send + Sync + 'static,
        R: Into<Reply> + 'static,
    {
        self.inner.methods.register(name, method_fn(f));
    }

    /// Register a method whose result is always deferred.
    pub fn register_async_method<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(Arc<InvocationContext>, Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        self.inner.methods.register(name, async_method_fn(f));
    }

    /// Register a method implemented as a [`MethodHandler`].
    pub fn register_method_handler(&self, name: impl Into<String>, handler: Arc<dyn MethodHandler>) {
        self.inner.methods.register(name, handler);
    }

    /// Register several methods at once, e.g. a [`Methods`](crate::methods::Methods) batch.
    pub fn register_methods(&self, batch: impl IntoIterator<Item = (String, Arc<dyn MethodHandler>)>) {
        self.inner.methods.register_many(batch);
    }

    /// Register a publication.
    pub fn register_publication<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&Arc<InvocationContext>, Params) + Send + Sync + 'static,
    {
        self.inner.publications.register(name, publish_fn(f));
    }

    /// Register a publication with an async body.
    pub fn register_async_publication<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(Arc<InvocationContext>, Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        self.inner.publications.register(name, async_publish_fn(f));
    }

    /// Register a publication implemented as a [`PublishHandler`].
    pub fn register_publication_handler(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn PublishHandler>,
    ) {
        self.inner.publications.register(name, handler);
    }

    /// Register several publications at once, e.g. a
    /// [`Publications`](crate::publications::Publications) batch.
    pub fn register_publications(
        &self,
        batch: impl IntoIterator<Item = (String, Arc<dyn PublishHandler>)>,
    ) {
        self.inner.publications.register_many(batch);
    }

    /// Run `hook` for every connection created from now on.
    pub fn on_connection(&self, hook: impl Fn(&Arc<Connection>) + Send + Sync + 'static) -> HookHandle {
        self.inner.connection_hooks.register(Arc::new(hook))
    }

    /// Run `hook` for every decoded inbound message, before it is routed.
    pub fn on_message(
        &self,
        hook: impl Fn(&ClientMessage, &Arc<Connection>) + Send + Sync + 'static,
    ) -> HookHandle {
        self.inner.message_hooks.register(Arc::new(hook))
    }

    // ── Administrative calls ────────────────────────────────────────

    /// Invoke a method with no client behind it.
    ///
    /// The handler body runs before this returns; a deferred result is
    /// handed back unresolved rather than waited for.
    pub fn call_method_sync(&self, name: &str, params: Params) -> Reply {
        let ctx = Arc::new(InvocationContext::for_administrative_call(
            self.inner.methods.clone(),
            name,
        ));
        self.inner.methods.dispatch(ctx, params)
    }

    /// Invoke a method with no client behind it and await its outcome.
    pub fn call_method_async(&self, name: &str, params: Params) -> BoxFuture<'static, Outcome> {
        self.call_method_sync(name, params).into_future()
    }

    /// Same as [`call_method_async`](Self::call_method_async), taking any
    /// argument list.
    pub fn apply_async(
        &self,
        name: &str,
        params: impl IntoIterator<Item = Value>,
    ) -> BoxFuture<'static, Outcome> {
        self.call_method_async(name, params.into_iter().collect())
    }

    // ── Transport entry points ──────────────────────────────────────

    /// A transport opened a new session.
    #[instrument(skip_all)]
    pub fn handle_connect(&self, transport: Arc<dyn Transport>) -> Arc<Connection> {
        let conn = Arc::new(Connection::new(transport));
        let connection_id = conn.id().clone();
        let _ = self
            .inner
            .connections
            .write()
            .insert(connection_id.clone(), conn.clone());
        counter!(CONNECTIONS_TOTAL).increment(1);
        gauge!(CONNECTIONS_ACTIVE).increment(1.0);
        info!(%connection_id, "connection opened");

        let inner = Arc::downgrade(&self.inner);
        let opened = Instant::now();
        conn.on_close(move || {
            counter!(CONNECTIONS_CLOSED_TOTAL).increment(1);
            gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
            histogram!(CONNECTION_DURATION_SECONDS).record(opened.elapsed().as_secs_f64());
            if let Some(inner) = inner.upgrade() {
                inner.forget(&connection_id);
            }
        });

        self.inner.connection_hooks.fire_all(|hook| hook(&conn));
        conn
    }

    /// A transport delivered a text frame.
    pub fn handle_message(&self, conn: &Arc<Connection>, text: &str) {
        match ClientMessage::parse(text) {
            Ok(msg) => self.handle_client_message(conn, msg),
            Err(err) => {
                counter!(PROTOCOL_ERRORS_TOTAL).increment(1);
                debug!(connection_id = %conn.id(), error = %err, "undecodable frame");
                let _ = conn.send(&ServerMessage::Error {
                    reason: err.to_string(),
                    offending_message: serde_json::from_str::<Value>(text).ok(),
                });
            }
        }
    }

    /// Route a decoded message.
    #[instrument(skip_all, fields(connection_id = %conn.id(), kind = msg.kind()))]
    pub fn handle_client_message(&self, conn: &Arc<Connection>, msg: ClientMessage) {
        if !conn.is_live() {
            debug!("message on closed connection dropped");
            return;
        }
        counter!(MESSAGES_RECEIVED_TOTAL, "kind" => msg.kind()).increment(1);
        self.inner.message_hooks.fire_all(|hook| hook(&msg, conn));

        let handshake_done = conn.protocol_version().is_some();
        match msg {
            ClientMessage::Connect { version, support } => {
                if handshake_done {
                    protocol_error(conn, "Already connected", Some(&ClientMessage::Connect { version, support }));
                } else {
                    handshake(conn, &version, &support);
                }
            }
            other if !handshake_done => protocol_error(conn, "Must connect first", Some(&other)),
            ClientMessage::Ping { id } => {
                let _ = conn.send(&ServerMessage::Pong { id });
            }
            ClientMessage::Pong { .. } => {}
            ClientMessage::Method {
                id,
                method,
                params,
                random_seed,
            } => self.handle_method(conn, id, &method, params, random_seed),
            ClientMessage::Sub { id, name, params } => self.handle_sub(conn, id, &name, params),
            ClientMessage::Unsub { id } => {
                if !self.inner.subscriptions.unsubscribe(conn.id(), &id) {
                    let _ = conn.send(&ServerMessage::nosub(id, None));
                }
            }
        }
    }

    /// A transport reported the session gone.
    pub fn handle_disconnect(&self, conn: &Arc<Connection>) {
        conn.close();
    }

    fn handle_method(
        &self,
        conn: &Arc<Connection>,
        id: CallId,
        method: &str,
        params: Params,
        random_seed: Option<String>,
    ) {
        let span = info_span!("method", call_id = %id, method);
        let reply = span.in_scope(|| {
            let ctx = Arc::new(InvocationContext::for_client_call(
                conn.clone(),
                self.inner.methods.clone(),
                method,
                random_seed,
            ));
            self.inner.methods.dispatch(ctx, params)
        });

        match reply {
            Reply::Ready(outcome) => {
                let _ = conn.send(&ServerMessage::method_result(id, &outcome));
            }
            Reply::Deferred(fut) => {
                let conn = conn.clone();
                drop(tokio::spawn(
                    async move {
                        let outcome = fut.await;
                        let _ = conn.send(&ServerMessage::method_result(id, &outcome));
                    }
                    .instrument(span),
                ));
            }
        }
    }

    fn handle_sub(&self, conn: &Arc<Connection>, id: SubscriptionId, name: &str, params: Params) {
        let (ready_conn, ready_id) = (conn.clone(), id.clone());
        let (stop_conn, stop_id) = (conn.clone(), id.clone());
        let callbacks = SubscriptionCallbacks::new(
            move || {
                let _ = ready_conn.send(&ServerMessage::Ready {
                    subs: vec![ready_id],
                });
            },
            move |err| {
                let _ = stop_conn.send(&ServerMessage::nosub(stop_id, err.as_ref()));
            },
        );
        let _ = self
            .inner
            .subscriptions
            .subscribe(conn, id, name, params, callbacks);
    }

    // ── Queries ─────────────────────────────────────────────────────

    /// Look up a live connection.
    pub fn connection(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.inner.connections.read().get(id).cloned()
    }

    /// All live connections.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.inner.connections.read().values().cloned().collect()
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.read().len()
    }

    /// Number of live subscriptions across all connections.
    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.count()
    }

    /// Close every live connection. Returns how many were closed.
    pub fn close_all(&self) -> usize {
        let connections = self.connections();
        for conn in &connections {
            conn.close();
        }
        connections.len()
    }

    /// The method registry.
    pub fn methods(&self) -> &Arc<MethodRegistry> {
        &self.inner.methods
    }

    /// The publication registry.
    pub fn publications(&self) -> &Arc<PublicationRegistry> {
        &self.inner.publications
    }

    /// The subscription engine.
    pub fn subscriptions(&self) -> &Arc<SubscriptionEngine> {
        &self.inner.subscriptions
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("connections", &self.connection_count())
            .field("subscriptions", &self.subscription_count())
            .field("methods", &self.inner.methods.methods())
            .field("publications", &self.inner.publications.publications())
            .finish()
    }
}

fn handshake(conn: &Arc<Connection>, version: &str, support: &[String]) {
    if let Some(agreed) = negotiate_version(version, support) {
        conn.complete_handshake(agreed);
        debug!(version = agreed, "handshake complete");
        let _ = conn.send(&ServerMessage::Connected {
            session: conn.id().clone(),
        });
    } else {
        info!(version, "unsupported protocol version");
        let _ = conn.send(&ServerMessage::Failed {
            version: SUPPORTED_PROTOCOL_VERSIONS[0].to_owned(),
        });
        conn.close();
    }
}

fn protocol_error(conn: &Arc<Connection>, reason: &str, offending: Option<&ClientMessage>) {
    counter!(PROTOCOL_ERRORS_TOTAL).increment(1);
    debug!(reason, "protocol error");
    let _ = conn.send(&ServerMessage::Error {
        reason: reason.to_owned(),
        offending_message: offending.and_then(|m| serde_json::to_value(m).ok()),
    });
}
