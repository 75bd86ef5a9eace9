//! Method registry and dispatch.
//!
//! Handlers are plain functions of the invocation context and positional
//! params. They return a [`Reply`]: either a value computed on the spot or
//! a future that settles later. The dispatcher runs the synchronous part
//! under the call's [`InvocationContext`], wraps any deferred part so the
//! same context is ambient whenever it is polled, and turns panics into
//! internal errors.

use std::future::{Future, IntoFuture};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::BoxFuture;
use metrics::{counter, histogram};
use serde_json::Value;
use tether_core::MethodError;
use tracing::{debug, error, warn};

use crate::context::{self, InvocationContext};
use crate::metrics::{METHOD_CALLS_TOTAL, METHOD_DURATION_SECONDS, METHOD_ERRORS_TOTAL};
use crate::registry::{Batch, HandlerTable};

/// Positional call parameters.
pub type Params = Vec<Value>;

/// Outcome of a method or publish handler.
pub type Outcome = Result<Value, MethodError>;

/// Calls slower than this are logged.
const SLOW_CALL: Duration = Duration::from_secs(5);

/// Result of invoking a handler: settled now or later.
pub enum Reply {
    /// Settled synchronously.
    Ready(Outcome),
    /// Settles when the future completes.
    Deferred(BoxFuture<'static, Outcome>),
}

impl Reply {
    /// Successful reply.
    pub fn ok(value: impl Into<Value>) -> Self {
        Self::Ready(Ok(value.into()))
    }

    /// Failed reply.
    pub fn err(err: MethodError) -> Self {
        Self::Ready(Err(err))
    }

    /// Reply that settles when `fut` completes.
    pub fn deferred<F>(fut: F) -> Self
    where
        F: Future<Output = Outcome> + Send + 'static,
    {
        Self::Deferred(Box::pin(fut))
    }

    /// Whether the reply is already settled.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    /// The outcome if settled, otherwise the reply itself.
    pub fn try_settled(self) -> Result<Outcome, Self> {
        match self {
            Self::Ready(outcome) => Ok(outcome),
            deferred @ Self::Deferred(_) => Err(deferred),
        }
    }
}

impl From<Outcome> for Reply {
    fn from(outcome: Outcome) -> Self {
        Self::Ready(outcome)
    }
}

impl From<MethodError> for Reply {
    fn from(err: MethodError) -> Self {
        Self::Ready(Err(err))
    }
}

impl IntoFuture for Reply {
    type Output = Outcome;
    type IntoFuture = BoxFuture<'static, Outcome>;

    fn into_future(self) -> Self::IntoFuture {
        match self {
            Self::Ready(outcome) => Box::pin(futures::future::ready(outcome)),
            Self::Deferred(fut) => fut,
        }
    }
}

impl std::fmt::Debug for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready(outcome) => f.debug_tuple("Ready").field(outcome).finish(),
            Self::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

/// A remotely callable procedure.
pub trait MethodHandler: Send + Sync {
    /// Run the handler. `ctx` is also ambient via [`context::current`].
    fn call(&self, ctx: &Arc<InvocationContext>, params: Params) -> Reply;
}

struct FnMethod<F>(F);

impl<F, R> MethodHandler for FnMethod<F>
where
    F: Fn(&Arc<InvocationContext>, Params) -> R + Send + Sync,
    R: Into<Reply>,
{
    fn call(&self, ctx: &Arc<InvocationContext>, params: Params) -> Reply {
        (self.0)(ctx, params).into()
    }
}

struct AsyncFnMethod<F>(F);

impl<F, Fut> MethodHandler for AsyncFnMethod<F>
where
    F: Fn(Arc<InvocationContext>, Params) -> Fut + Send + Sync,
    Fut: Future<Output = Outcome> + Send + 'static,
{
    fn call(&self, ctx: &Arc<InvocationContext>, params: Params) -> Reply {
        Reply::deferred((self.0)(ctx.clone(), params))
    }
}

/// Box a closure returning a [`Reply`] (or anything convertible into one).
pub fn method_fn<F, R>(f: F) -> Arc<dyn MethodHandler>
where
    F: Fn(&Arc<InvocationContext>, Params) -> R + Send + Sync + 'static,
    R: Into<Reply> + 'static,
{
    Arc::new(FnMethod(f))
}

/// Box an async closure. The returned future becomes a deferred reply.
pub fn async_method_fn<F, Fut>(f: F) -> Arc<dyn MethodHandler>
where
    F: Fn(Arc<InvocationContext>, Params) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Outcome> + Send + 'static,
{
    Arc::new(AsyncFnMethod(f))
}

/// Several methods registered at once.
pub type Methods = Batch<dyn MethodHandler>;

impl Batch<dyn MethodHandler> {
    /// Add a method.
    #[must_use]
    pub fn method<F, R>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Arc<InvocationContext>, Params) -> R + Send + Sync + 'static,
        R: Into<Reply> + 'static,
    {
        self.with_handler(name, method_fn(f))
    }

    /// Add an async method.
    #[must_use]
    pub fn async_method<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Arc<InvocationContext>, Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        self.with_handler(name, async_method_fn(f))
    }
}

/// Registry mapping method names to handlers, and the dispatcher over it.
pub struct MethodRegistry {
    table: HandlerTable<dyn MethodHandler>,
}

impl MethodRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            table: HandlerTable::new("method"),
        }
    }

    /// Register a handler. A later registration of the same name wins.
    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn MethodHandler>) {
        self.table.insert(name, handler);
    }

    /// Register several handlers.
    pub fn register_many(&self, batch: impl IntoIterator<Item = (String, Arc<dyn MethodHandler>)>) {
        self.table.extend(batch);
    }

    /// List all registered method names (sorted).
    pub fn methods(&self) -> Vec<String> {
        self.table.names()
    }

    /// Check whether a method is registered.
    pub fn has_method(&self, name: &str) -> bool {
        self.table.contains(name)
    }

    /// Invoke the method named by `ctx` with `params`.
    ///
    /// The handler body runs synchronously before this returns. A deferred
    /// result is returned still pending, bound to `ctx`.
    pub fn dispatch(&self, ctx: Arc<InvocationContext>, params: Params) -> Reply {
        let method = ctx.name().to_owned();
        counter!(METHOD_CALLS_TOTAL, "method" => method.clone()).increment(1);

        let Some(handler) = self.table.get(&method) else {
            counter!(METHOD_ERRORS_TOTAL, "method" => method.clone(), "error_type" => "not_found")
                .increment(1);
            debug!(method, "method not found");
            return Reply::err(MethodError::method_not_found(&method));
        };

        let start = Instant::now();
        let body = catch_unwind(AssertUnwindSafe(|| {
            context::run_with_context(ctx.clone(), || handler.call(&ctx, params))
        }));

        match body {
            Ok(Reply::Ready(outcome)) => {
                record(&method, start, &outcome);
                Reply::Ready(outcome)
            }
            Ok(Reply::Deferred(fut)) => {
                let continuation = context::scope(ctx, AssertUnwindSafe(fut).catch_unwind());
                Reply::deferred(async move {
                    let outcome = continuation
                        .await
                        .unwrap_or_else(|panic| Err(panicked(&method, panic.as_ref())));
                    record(&method, start, &outcome);
                    outcome
                })
            }
            Err(panic) => {
                let outcome = Err(panicked(&method, panic.as_ref()));
                record(&method, start, &outcome);
                Reply::Ready(outcome)
            }
        }
    }
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodRegistry")
            .field("methods", &self.methods())
            .finish()
    }
}

/// Message carried by a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

fn panicked(method: &str, payload: &(dyn std::any::Any + Send)) -> MethodError {
    MethodError::internal(format!("method '{method}' panicked: {}", panic_message(payload)))
}

fn record(method: &str, start: Instant, outcome: &Outcome) {
    let duration = start.elapsed();
    histogram!(METHOD_DURATION_SECONDS, "method" => method.to_owned())
        .record(duration.as_secs_f64());

    if let Err(err) = outcome {
        counter!(METHOD_ERRORS_TOTAL, "method" => method.to_owned(), "error_type" => err.code().to_owned())
            .increment(1);
        if err.is_internal() {
            error!(method, error = %err, "method failed");
        } else {
            debug!(method, error = %err, "method returned error");
        }
    }

    if duration >= SLOW_CALL {
        warn!(method, duration_secs = duration.as_secs_f64(), "slow method call");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn registry() -> Arc<MethodRegistry> {
        Arc::new(MethodRegistry::new())
    }

    fn admin(registry: &Arc<MethodRegistry>, name: &str) -> Arc<InvocationContext> {
        Arc::new(InvocationContext::for_administrative_call(registry.clone(), name))
    }

    fn call(registry: &Arc<MethodRegistry>, name: &str, params: Params) -> Reply {
        registry.dispatch(admin(registry, name), params)
    }

    // ── Registration ────────────────────────────────────────────────

    #[test]
    fn register_and_list() {
        let reg = registry();
        reg.register("b", method_fn(|_, _| Reply::ok(1)));
        reg.register("a", method_fn(|_, _| Reply::ok(2)));
        assert_eq!(reg.methods(), vec!["a", "b"]);
        assert!(reg.has_method("a"));
        assert!(!reg.has_method("c"));
    }

    #[test]
    fn register_many_batch() {
        let reg = registry();
        reg.register_many(
            Methods::new()
                .method("one", |_, _| Reply::ok(1))
                .async_method("two", |_, _| async { Ok(json!(2)) }),
        );
        assert_eq!(reg.methods(), vec!["one", "two"]);
    }

    #[test]
    fn reregistration_replaces_handler() {
        let reg = registry();
        reg.register("m", method_fn(|_, _| Reply::ok("old")));
        reg.register("m", method_fn(|_, _| Reply::ok("new")));
        let out = call(&reg, "m", vec![]).try_settled().unwrap();
        assert_eq!(out.unwrap(), json!("new"));
    }

    // ── Dispatch ────────────────────────────────────────────────────

    #[test]
    fn dispatch_ready_success() {
        let reg = registry();
        reg.register("echo", method_fn(|_, params: Params| Reply::ok(params)));
        let out = call(&reg, "echo", vec![json!(1), json!("x")]).try_settled().unwrap();
        assert_eq!(out.unwrap(), json!([1, "x"]));
    }

    #[test]
    fn dispatch_method_not_found() {
        let reg = registry();
        let out = call(&reg, "no.such", vec![]).try_settled().unwrap();
        let err = out.unwrap_err();
        assert_eq!(err.code(), tether_core::errors::METHOD_NOT_FOUND);
        assert!(err.to_string().contains("no.such"));
    }

    #[test]
    fn handler_returning_result_converts() {
        let reg = registry();
        reg.register(
            "fails",
            method_fn(|_, _| -> Outcome { Err(MethodError::application("nope")) }),
        );
        let err = call(&reg, "fails", vec![]).try_settled().unwrap().unwrap_err();
        assert_matches!(err, MethodError::Application { ref error, .. } if error == "nope");
    }

    #[test]
    fn handler_sees_its_context_as_current() {
        let reg = registry();
        reg.register(
            "who",
            method_fn(|ctx: &Arc<InvocationContext>, _| {
                let ambient = context::current().unwrap();
                Reply::ok(Arc::ptr_eq(ctx, &ambient))
            }),
        );
        let out = call(&reg, "who", vec![]).try_settled().unwrap();
        assert_eq!(out.unwrap(), json!(true));
    }

    #[test]
    fn panic_in_body_becomes_internal() {
        let reg = registry();
        reg.register("boom", method_fn(|_, _| -> Reply { panic!("secret detail") }));
        let err = call(&reg, "boom", vec![]).try_settled().unwrap().unwrap_err();
        assert!(err.is_internal());
        assert!(err.to_string().contains("secret detail"));
        assert!(!err.to_error_body().message.contains("secret detail"));
    }

    #[tokio::test]
    async fn dispatch_deferred_success() {
        let reg = registry();
        reg.register(
            "later",
            async_method_fn(|_, _| async {
                tokio::task::yield_now().await;
                Ok(json!("done"))
            }),
        );
        let reply = call(&reg, "later", vec![]);
        assert!(!reply.is_ready());
        assert_eq!(reply.await.unwrap(), json!("done"));
    }

    #[tokio::test]
    async fn deferred_application_error_forwarded() {
        let reg = registry();
        reg.register(
            "reject",
            async_method_fn(|_, _| async {
                Err(MethodError::application_with_reason("x raised", "bad input")
                    .with_details(json!({"field": "name"})))
            }),
        );
        let err = call(&reg, "reject", vec![]).await.unwrap_err();
        let body = err.to_error_body();
        assert_eq!(body.error, "x raised");
        assert_eq!(body.reason.as_deref(), Some("bad input"));
        assert_eq!(body.details, Some(json!({"field": "name"})));
    }

    #[tokio::test]
    async fn deferred_panic_becomes_internal() {
        let reg = registry();
        reg.register(
            "late_boom",
            async_method_fn(|_, _| async {
                tokio::task::yield_now().await;
                if true {
                    panic!("hidden");
                }
                Ok(Value::Null)
            }),
        );
        let err = call(&reg, "late_boom", vec![]).await.unwrap_err();
        assert!(err.is_internal());
        assert_eq!(err.to_error_body().error, "INTERNAL_ERROR");
    }

    #[tokio::test]
    async fn deferred_continuation_sees_attaching_context() {
        let reg = registry();
        reg.register(
            "captures",
            method_fn(|ctx: &Arc<InvocationContext>, _| {
                let expected = ctx.clone();
                Reply::deferred(async move {
                    tokio::task::yield_now().await;
                    let seen = context::current().unwrap();
                    Ok(json!(Arc::ptr_eq(&seen, &expected)))
                })
            }),
        );

        let reply = call(&reg, "captures", vec![]);
        // Poll the continuation from under an unrelated context.
        let other = admin(&reg, "other");
        let out = context::scope(other, reply.into_future()).await;
        assert_eq!(out.unwrap(), json!(true));
    }

    #[tokio::test]
    async fn deferred_continuation_polled_from_another_task() {
        let reg = registry();
        reg.register(
            "name",
            async_method_fn(|_, _| async {
                tokio::task::yield_now().await;
                Ok(json!(context::current().map(|c| c.name().to_owned())))
            }),
        );
        let reply = call(&reg, "name", vec![]);
        let out = tokio::spawn(reply.into_future()).await.unwrap();
        assert_eq!(out.unwrap(), json!("name"));
    }

    #[test]
    fn reply_conversions() {
        let r: Reply = Ok(json!(1)).into();
        assert!(r.is_ready());
        let r: Reply = MethodError::application("e").into();
        assert_matches!(r.try_settled(), Ok(Err(MethodError::Application { .. })));
        let r = Reply::deferred(async { Ok(Value::Null) });
        assert!(r.try_settled().is_err());
    }

    #[test]
    fn panic_message_extraction() {
        let s: Box<dyn std::any::Any + Send> = Box::new("static");
        assert_eq!(panic_message(s.as_ref()), "static");
        let s: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(s.as_ref()), "owned");
        let s: Box<dyn std::any::Any + Send> = Box::new(42);
        assert_eq!(panic_message(s.as_ref()), "non-string panic payload");
    }
}
