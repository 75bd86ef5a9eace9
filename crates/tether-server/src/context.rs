//! Ambient invocation context.
//!
//! Every method call and every subscription run executes under an
//! [`InvocationContext`] recording on whose behalf the code runs. The
//! context is installed in a tokio task-local, so [`current`] works anywhere
//! below the handler without threading a parameter through.
//!
//! # Continuations
//!
//! A task-local only covers the code that runs inside its scope. A future
//! created under one context but polled later (from another task, or after
//! the handler returned) would otherwise see whatever happens to be ambient
//! at poll time. [`bind`] captures the context when the future is created
//! and re-installs it around every poll; the dispatcher applies the same
//! wrapping to every deferred handler result.
//!
//! # Nesting
//!
//! A call made from a method keeps the caller's connection. A call made from
//! a subscription run gets no connection at all: work a publication does on
//! its own behalf is never attributed to the subscribing client. Reactive
//! reads inside such a call still count as inputs of the run.

use std::future::Future;
use std::sync::Arc;

use futures::future::Either;
use parking_lot::Mutex;
use serde_json::Value;
use tether_core::MethodError;
use tether_core::random::RandomStream;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::connection::Connection;
use crate::methods::{MethodRegistry, Reply};
use crate::reactive::Dependencies;
use crate::subscription::Subscription;

tokio::task_local! {
    static CURRENT: Arc<InvocationContext>;
}

/// What an [`InvocationContext`] was created for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvocationKind {
    /// A method call (client, nested or administrative).
    Method,
    /// One run of a publish handler.
    SubscriptionRun,
}

/// On whose behalf the current code is running.
pub struct InvocationContext {
    kind: InvocationKind,
    name: String,
    connection: Option<Arc<Connection>>,
    user_id: Mutex<Option<String>>,
    random: RandomStream,
    subscription: Option<Arc<Subscription>>,
    dependencies: Option<Arc<Dependencies>>,
    methods: Arc<MethodRegistry>,
}

impl InvocationContext {
    /// Context for a method call received from `connection`.
    pub(crate) fn for_client_call(
        connection: Arc<Connection>,
        methods: Arc<MethodRegistry>,
        name: &str,
        random_seed: Option<String>,
    ) -> Self {
        let random = random_seed.map_or_else(RandomStream::fresh, RandomStream::new);
        Self {
            kind: InvocationKind::Method,
            name: name.to_owned(),
            user_id: Mutex::new(connection.user_id()),
            connection: Some(connection),
            random,
            subscription: None,
            dependencies: None,
            methods,
        }
    }

    /// Context for a server-initiated call with no client behind it.
    pub(crate) fn for_administrative_call(methods: Arc<MethodRegistry>, name: &str) -> Self {
        Self {
            kind: InvocationKind::Method,
            name: name.to_owned(),
            connection: None,
            user_id: Mutex::new(None),
            random: RandomStream::fresh(),
            subscription: None,
            dependencies: None,
            methods,
        }
    }

    /// Child context for a call issued from within `parent`.
    pub(crate) fn for_nested_call(parent: &Self, name: &str) -> Self {
        let connection = match parent.kind {
            InvocationKind::SubscriptionRun => None,
            InvocationKind::Method => parent.connection.clone(),
        };
        Self {
            kind: InvocationKind::Method,
            name: name.to_owned(),
            connection,
            user_id: Mutex::new(parent.user_id()),
            random: RandomStream::new(parent.random.id(&format!("/rpc/{name}"))),
            subscription: None,
            dependencies: parent.dependencies.clone(),
            methods: parent.methods.clone(),
        }
    }

    /// Context for one run of `subscription`.
    pub(crate) fn for_subscription_run(
        subscription: Arc<Subscription>,
        methods: Arc<MethodRegistry>,
        dependencies: Arc<Dependencies>,
    ) -> Self {
        let connection = subscription.connection().clone();
        Self {
            kind: InvocationKind::SubscriptionRun,
            name: subscription.name().to_owned(),
            user_id: Mutex::new(connection.user_id()),
            connection: Some(connection),
            random: RandomStream::fresh(),
            subscription: Some(subscription),
            dependencies: Some(dependencies),
            methods,
        }
    }

    /// What this context was created for.
    pub fn kind(&self) -> InvocationKind {
        self.kind
    }

    /// Whether this context belongs to a publish handler run.
    pub fn is_subscription_run(&self) -> bool {
        self.kind == InvocationKind::SubscriptionRun
    }

    /// Method or publication name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Originating connection; `None` for server-internal work.
    pub fn connection(&self) -> Option<&Arc<Connection>> {
        self.connection.as_ref()
    }

    /// User id attributed to this invocation.
    ///
    /// A snapshot taken when the context was created (updated by this
    /// context's own [`set_user_id`](Self::set_user_id)), not a live read of
    /// the connection's slot.
    pub fn user_id(&self) -> Option<String> {
        self.user_id.lock().clone()
    }

    /// Change the user id of the originating connection.
    ///
    /// Every subscription on that connection reruns. Fails when there is no
    /// originating connection or when called from a publish handler.
    pub fn set_user_id(&self, user_id: Option<String>) -> Result<(), MethodError> {
        if self.is_subscription_run() {
            return Err(MethodError::internal(
                "set_user_id cannot be called from a publish handler",
            ));
        }
        let Some(connection) = &self.connection else {
            return Err(MethodError::internal(
                "set_user_id cannot be called on a server-initiated method call",
            ));
        };
        *self.user_id.lock() = user_id.clone();
        connection.set_user_id(user_id);
        Ok(())
    }

    /// Deterministic random streams for this invocation.
    pub fn random(&self) -> &RandomStream {
        &self.random
    }

    /// Seed behind [`random`](Self::random).
    pub fn random_seed(&self) -> &str {
        self.random.seed()
    }

    /// Subscription this run belongs to.
    pub fn subscription(&self) -> Option<&Arc<Subscription>> {
        self.subscription.as_ref()
    }

    pub(crate) fn dependencies(&self) -> Option<&Arc<Dependencies>> {
        self.dependencies.as_ref()
    }

    /// Invoke another method on behalf of this context.
    pub fn call(&self, name: &str, params: Vec<Value>) -> Reply {
        let child = Arc::new(Self::for_nested_call(self, name));
        self.methods.dispatch(child, params)
    }

    /// Mark the subscription ready. Publish handlers only.
    pub fn ready(&self) {
        match &self.subscription {
            Some(sub) => sub.ready(),
            None => warn!(invocation = %self.name, "ready() called outside a publish handler"),
        }
    }

    /// Stop the subscription without error. Publish handlers only.
    pub fn stop(&self) {
        match &self.subscription {
            Some(sub) => sub.stop(),
            None => warn!(invocation = %self.name, "stop() called outside a publish handler"),
        }
    }

    /// Stop the subscription with `err`. Publish handlers only.
    pub fn error(&self, err: MethodError) {
        match &self.subscription {
            Some(sub) => sub.error(err),
            None => warn!(invocation = %self.name, error = %err, "error() called outside a publish handler"),
        }
    }
}

impl std::fmt::Debug for InvocationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationContext")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("connection", &self.connection.as_ref().map(|c| c.id().clone()))
            .field("user_id", &self.user_id())
            .finish_non_exhaustive()
    }
}

/// The ambient context, if any.
pub fn current() -> Option<Arc<InvocationContext>> {
    CURRENT.try_with(Arc::clone).ok()
}

/// Run `body` with `ctx` ambient, restoring the previous context afterwards
/// (also when `body` unwinds).
pub fn run_with_context<R>(ctx: Arc<InvocationContext>, body: impl FnOnce() -> R) -> R {
    CURRENT.sync_scope(ctx, body)
}

/// Make `ctx` ambient during every poll of `fut`.
pub fn scope<F: Future>(ctx: Arc<InvocationContext>, fut: F) -> impl Future<Output = F::Output> {
    CURRENT.scope(ctx, fut)
}

/// Bind `fut` to the context ambient right now.
///
/// Without an ambient context the future is returned unchanged.
pub fn bind<F: Future>(fut: F) -> impl Future<Output = F::Output> {
    match current() {
        Some(ctx) => Either::Left(CURRENT.scope(ctx, fut)),
        None => Either::Right(fut),
    }
}

/// Spawn `fut` on the runtime, bound to the ambient context.
pub fn spawn_bound<F>(fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(bind(fut))
}
