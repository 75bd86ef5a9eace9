//! Subscription engine.
//!
//! Each subscription is driven by its own task, so runs of one
//! subscription never overlap while different subscriptions proceed
//! independently. After every run the driver waits for either a stop
//! request or a change to one of the inputs the run read, whichever comes
//! first. Changes that pile up while a run is in flight are seen as one, so
//! a burst of writes costs a single rerun.
//!
//! A stop from the handler or from a closing connection drops any pending
//! rerun. A client unsubscribe does not: if an input of the last run has
//! changed, that rerun still happens once before the subscription stops.
//!
//! ```text
//!   Active ──stop()/error()/unsubscribe/close──▶ Stopping ──run returns──▶ Stopped
//!     │ ▲                                                         (on_stop fires once)
//!     └─┘ input changed → rerun
//! ```

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::FutureExt;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::Serialize;
use tether_core::{ConnectionId, MethodError, SubscriptionId};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info_span};

use crate::connection::Connection;
use crate::context::{self, InvocationContext};
use crate::methods::{MethodRegistry, Outcome, Params, Reply, panic_message};
use crate::metrics::{
    SUBSCRIPTION_RERUNS_TOTAL, SUBSCRIPTIONS_ACTIVE, SUBSCRIPTIONS_STARTED_TOTAL,
    SUBSCRIPTIONS_STOPPED_TOTAL,
};
use crate::publications::{PublicationRegistry, PublishHandler};
use crate::reactive::{self, Dependencies, Dependency};

/// Lifecycle of a [`Subscription`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionState {
    /// Running or waiting for an input to change.
    Active,
    /// A stop was requested; the in-flight run (if any) is finishing.
    Stopping,
    /// Terminal. `on_stop` has fired.
    Stopped,
}

type ReadyCallback = Box<dyn FnOnce() + Send>;
type StopCallback = Box<dyn FnOnce(Option<MethodError>) + Send>;

/// Notifications delivered to whoever opened the subscription.
pub struct SubscriptionCallbacks {
    on_ready: ReadyCallback,
    on_stop: StopCallback,
}

impl SubscriptionCallbacks {
    /// `on_ready` fires at most once; `on_stop` fires exactly once.
    pub fn new(
        on_ready: impl FnOnce() + Send + 'static,
        on_stop: impl FnOnce(Option<MethodError>) + Send + 'static,
    ) -> Self {
        Self {
            on_ready: Box::new(on_ready),
            on_stop: Box::new(on_stop),
        }
    }

    /// Callbacks that do nothing.
    pub fn noop() -> Self {
        Self::new(|| {}, |_| {})
    }
}

impl std::fmt::Debug for SubscriptionCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionCallbacks").finish_non_exhaustive()
    }
}

struct Lifecycle {
    state: SubscriptionState,
    error: Option<MethodError>,
    rerun_pending_changes: bool,
}

/// One live instance of a publication for one connection.
pub struct Subscription {
    id: SubscriptionId,
    name: String,
    connection: Arc<Connection>,
    params: Params,
    handler: Arc<dyn PublishHandler>,
    lifecycle: Mutex<Lifecycle>,
    ready: AtomicBool,
    on_ready: Mutex<Option<ReadyCallback>>,
    on_stop: Mutex<Option<StopCallback>>,
    halt: CancellationToken,
    runs: AtomicU64,
}

impl Subscription {
    fn new(
        id: SubscriptionId,
        name: &str,
        connection: Arc<Connection>,
        params: Params,
        handler: Arc<dyn PublishHandler>,
        callbacks: SubscriptionCallbacks,
    ) -> Self {
        Self {
            id,
            name: name.to_owned(),
            connection,
            params,
            handler,
            lifecycle: Mutex::new(Lifecycle {
                state: SubscriptionState::Active,
                error: None,
                rerun_pending_changes: false,
            }),
            ready: AtomicBool::new(false),
            on_ready: Mutex::new(Some(callbacks.on_ready)),
            on_stop: Mutex::new(Some(callbacks.on_stop)),
            halt: CancellationToken::new(),
            runs: AtomicU64::new(0),
        }
    }

    /// Client-chosen id.
    pub fn id(&self) -> &SubscriptionId {
        &self.id
    }

    /// Publication name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Owning connection.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SubscriptionState {
        self.lifecycle.lock().state
    }

    /// Whether [`ready`](Self::ready) has been called.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Number of runs started so far.
    pub fn run_count(&self) -> u64 {
        self.runs.load(Ordering::Acquire)
    }

    /// Report the initial result set as delivered. Only the first call counts.
    pub fn ready(&self) {
        if self.state() != SubscriptionState::Active || self.ready.swap(true, Ordering::AcqRel) {
            return;
        }
        let callback = self.on_ready.lock().take();
        if let Some(callback) = callback {
            debug!(subscription = %self.id, "subscription ready");
            if catch_unwind(AssertUnwindSafe(callback)).is_err() {
                error!(subscription = %self.id, "on_ready callback panicked");
            }
        }
    }

    /// Stop without error once the in-flight run returns. No further reruns.
    pub fn stop(&self) {
        self.begin_stop(None, false);
    }

    /// Stop with `err` once the in-flight run returns.
    pub fn error(&self, err: MethodError) {
        self.begin_stop(Some(err), false);
    }

    /// Stop on the client's request. A rerun already due to a changed input
    /// still happens first.
    pub fn unsubscribe(&self) {
        self.begin_stop(None, true);
    }

    fn begin_stop(&self, err: Option<MethodError>, rerun_pending_changes: bool) {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state != SubscriptionState::Active {
                return;
            }
            lifecycle.state = SubscriptionState::Stopping;
            lifecycle.error = err;
            lifecycle.rerun_pending_changes = rerun_pending_changes;
        }
        self.halt.cancel();
    }

    fn is_halted(&self) -> bool {
        self.halt.is_cancelled()
    }

    async fn drive(self: Arc<Self>, methods: Arc<MethodRegistry>, engine: Weak<SubscriptionEngine>) {
        let mut deps = Vec::new();
        while !self.is_halted() {
            deps = self.run_once(&methods).await;
            if self.is_halted() {
                break;
            }
            tokio::select! {
                biased;
                () = self.halt.cancelled() => break,
                () = reactive::wait_for_change(&mut deps) => {
                    counter!(SUBSCRIPTION_RERUNS_TOTAL, "publication" => self.name.clone()).increment(1);
                    debug!("input changed, rerunning");
                }
            }
        }

        if self.rerun_owed(&deps) {
            counter!(SUBSCRIPTION_RERUNS_TOTAL, "publication" => self.name.clone()).increment(1);
            debug!("input changed before stop, final rerun");
            let _ = self.run_once(&methods).await;
        }

        // Free the id before on_stop so the client may reuse it right away.
        if let Some(engine) = engine.upgrade() {
            engine.remove(&self);
        }
        self.finalize();
    }

    fn rerun_owed(&self, deps: &[Dependency]) -> bool {
        self.lifecycle.lock().rerun_pending_changes && deps.iter().any(Dependency::has_changed)
    }

    async fn run_once(self: &Arc<Self>, methods: &Arc<MethodRegistry>) -> Vec<Dependency> {
        let run = self.runs.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(run, "running publish handler");

        // Subscribe before the context snapshots the user id so that a write
        // racing with run start is not lost.
        let deps = Arc::new(Dependencies::default());
        deps.add(self.connection.user_id_var().dependency());
        let ctx = Arc::new(InvocationContext::for_subscription_run(
            self.clone(),
            methods.clone(),
            deps.clone(),
        ));

        let started = catch_unwind(AssertUnwindSafe(|| {
            context::run_with_context(ctx.clone(), || self.handler.run(&ctx, self.params.clone()))
        }));
        let outcome: Outcome = match started {
            Ok(Reply::Ready(outcome)) => outcome,
            Ok(Reply::Deferred(fut)) => context::scope(ctx, AssertUnwindSafe(fut).catch_unwind())
                .await
                .unwrap_or_else(|panic| Err(self.panicked(panic.as_ref()))),
            Err(panic) => Err(self.panicked(panic.as_ref())),
        };

        if let Err(err) = outcome {
            if err.is_internal() {
                error!(run, error = %err, "publish handler failed");
            } else {
                debug!(run, error = %err, "publish handler returned error");
            }
            self.error(err);
        }
        deps.take()
    }

    fn panicked(&self, payload: &(dyn std::any::Any + Send)) -> MethodError {
        MethodError::internal(format!(
            "publication '{}' panicked: {}",
            self.name,
            panic_message(payload)
        ))
    }

    fn finalize(&self) {
        let err = {
            let mut lifecycle = self.lifecycle.lock();
            lifecycle.state = SubscriptionState::Stopped;
            lifecycle.error.take()
        };
        drop(self.on_ready.lock().take());

        let callback = self.on_stop.lock().take();
        if let Some(callback) = callback {
            debug!(error = ?err, "subscription stopped");
            if catch_unwind(AssertUnwindSafe(|| callback(err))).is_err() {
                error!(subscription = %self.id, "on_stop callback panicked");
            }
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("connection", self.connection.id())
            .field("state", &self.state())
            .field("runs", &self.run_count())
            .finish_non_exhaustive()
    }
}

/// Runs publications for every connection.
pub struct SubscriptionEngine {
    publications: Arc<PublicationRegistry>,
    methods: Arc<MethodRegistry>,
    live: Mutex<HashMap<ConnectionId, HashMap<SubscriptionId, Arc<Subscription>>>>,
}

impl SubscriptionEngine {
    /// Create an engine over the given registries.
    pub fn new(publications: Arc<PublicationRegistry>, methods: Arc<MethodRegistry>) -> Self {
        Self {
            publications,
            methods,
            live: Mutex::new(HashMap::new()),
        }
    }

    /// Start a subscription and spawn its driver.
    ///
    /// An unknown publication fails at once through `on_stop`. An id that is
    /// already live on the connection is ignored and `None` is returned.
    pub fn subscribe(
        self: &Arc<Self>,
        connection: &Arc<Connection>,
        id: SubscriptionId,
        name: &str,
        params: Params,
        callbacks: SubscriptionCallbacks,
    ) -> Option<Arc<Subscription>> {
        let Some(handler) = self.publications.get(name) else {
            debug!(connection_id = %connection.id(), subscription = %id, publication = name, "publication not found");
            (callbacks.on_stop)(Some(MethodError::publication_not_found(name)));
            return None;
        };

        let sub = Arc::new(Subscription::new(
            id.clone(),
            name,
            connection.clone(),
            params,
            handler,
            callbacks,
        ));
        {
            let mut live = self.live.lock();
            let subs = live.entry(connection.id().clone()).or_default();
            if subs.contains_key(&id) {
                debug!(connection_id = %connection.id(), subscription = %id, "duplicate subscription id ignored");
                return None;
            }
            let _ = subs.insert(id.clone(), sub.clone());
        }
        counter!(SUBSCRIPTIONS_STARTED_TOTAL, "publication" => name.to_owned()).increment(1);
        gauge!(SUBSCRIPTIONS_ACTIVE).increment(1.0);

        // close() flips liveness before its callbacks run, so either
        // stop_all saw this entry or this check does.
        if !connection.is_live() {
            sub.stop();
        }

        let span = info_span!(
            "subscription",
            connection_id = %connection.id(),
            subscription = %id,
            publication = name,
        );
        drop(tokio::spawn(
            sub.clone()
                .drive(self.methods.clone(), Arc::downgrade(self))
                .instrument(span),
        ));
        Some(sub)
    }

    /// Stop a live subscription. Returns `false` if no such id is live.
    pub fn unsubscribe(&self, connection_id: &ConnectionId, id: &SubscriptionId) -> bool {
        let sub = self.get(connection_id, id);
        match sub {
            Some(sub) => {
                debug!(%connection_id, subscription = %id, "unsubscribe");
                sub.unsubscribe();
                true
            }
            None => false,
        }
    }

    /// Stop every subscription of a connection. Returns how many were live.
    pub fn stop_all(&self, connection_id: &ConnectionId) -> usize {
        let subs: Vec<Arc<Subscription>> = self
            .live
            .lock()
            .get(connection_id)
            .map(|subs| subs.values().cloned().collect())
            .unwrap_or_default();
        for sub in &subs {
            sub.stop();
        }
        subs.len()
    }

    /// Look up a live subscription.
    pub fn get(&self, connection_id: &ConnectionId, id: &SubscriptionId) -> Option<Arc<Subscription>> {
        self.live.lock().get(connection_id)?.get(id).cloned()
    }

    /// Total live subscriptions.
    pub fn count(&self) -> usize {
        self.live.lock().values().map(HashMap::len).sum()
    }

    /// Live subscriptions of one connection.
    pub fn count_for(&self, connection_id: &ConnectionId) -> usize {
        self.live.lock().get(connection_id).map_or(0, HashMap::len)
    }

    fn remove(&self, sub: &Arc<Subscription>) {
        let mut live = self.live.lock();
        let connection_id = sub.connection.id();
        let Some(subs) = live.get_mut(connection_id) else {
            return;
        };
        if subs.get(&sub.id).is_some_and(|s| Arc::ptr_eq(s, sub)) {
            let _ = subs.remove(&sub.id);
            counter!(SUBSCRIPTIONS_STOPPED_TOTAL, "publication" => sub.name.clone()).increment(1);
            gauge!(SUBSCRIPTIONS_ACTIVE).decrement(1.0);
        }
        if subs.is_empty() {
            let _ = live.remove(connection_id);
        }
    }
}

impl std::fmt::Debug for SubscriptionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionEngine")
            .field("live", &self.count())
            .finish_non_exhaustive()
    }
}
