//! Publication registry.
//!
//! A publish handler runs once per subscription and again whenever an input
//! it read changes. It signals progress through the context: `ready()`,
//! `stop()` and `error()`. Its own return value only matters when it is an
//! error, which stops the subscription with that error.

use std::future::Future;
use std::sync::Arc;

use crate::context::InvocationContext;
use crate::methods::{Outcome, Params, Reply};
use crate::registry::{Batch, HandlerTable};

/// A publication: produces a live result set for one subscription.
pub trait PublishHandler: Send + Sync {
    /// Execute one run.
    fn run(&self, ctx: &Arc<InvocationContext>, params: Params) -> Reply;
}

struct FnPublication<F>(F);

impl<F> PublishHandler for FnPublication<F>
where
    F: Fn(&Arc<InvocationContext>, Params) + Send + Sync,
{
    fn run(&self, ctx: &Arc<InvocationContext>, params: Params) -> Reply {
        (self.0)(ctx, params);
        Reply::ok(serde_json::Value::Null)
    }
}

struct AsyncFnPublication<F>(F);

impl<F, Fut> PublishHandler for AsyncFnPublication<F>
where
    F: Fn(Arc<InvocationContext>, Params) -> Fut + Send + Sync,
    Fut: Future<Output = Outcome> + Send + 'static,
{
    fn run(&self, ctx: &Arc<InvocationContext>, params: Params) -> Reply {
        Reply::deferred((self.0)(ctx.clone(), params))
    }
}

/// Box a synchronous publish closure.
pub fn publish_fn<F>(f: F) -> Arc<dyn PublishHandler>
where
    F: Fn(&Arc<InvocationContext>, Params) + Send + Sync + 'static,
{
    Arc::new(FnPublication(f))
}

/// Box an async publish closure. An `Err` outcome stops the subscription.
pub fn async_publish_fn<F, Fut>(f: F) -> Arc<dyn PublishHandler>
where
    F: Fn(Arc<InvocationContext>, Params) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Outcome> + Send + 'static,
{
    Arc::new(AsyncFnPublication(f))
}

/// Several publications registered at once.
pub type Publications = Batch<dyn PublishHandler>;

impl Batch<dyn PublishHandler> {
    /// Add a publication.
    #[must_use]
    pub fn publication<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Arc<InvocationContext>, Params) + Send + Sync + 'static,
    {
        self.with_handler(name, publish_fn(f))
    }

    /// Add an async publication.
    #[must_use]
    pub fn async_publication<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Arc<InvocationContext>, Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        self.with_handler(name, async_publish_fn(f))
    }
}

/// Registry mapping publication names to handlers.
pub struct PublicationRegistry {
    table: HandlerTable<dyn PublishHandler>,
}

impl PublicationRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            table: HandlerTable::new("publication"),
        }
    }

    /// Register a handler. A later registration of the same name wins.
    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn PublishHandler>) {
        self.table.insert(name, handler);
    }

    /// Register several handlers.
    pub fn register_many(
        &self,
        batch: impl IntoIterator<Item = (String, Arc<dyn PublishHandler>)>,
    ) {
        self.table.extend(batch);
    }

    /// Look up a handler.
    pub fn get(&self, name: &str) -> Option<Arc<dyn PublishHandler>> {
        self.table.get(name)
    }

    /// Registered publication names, sorted.
    pub fn publications(&self) -> Vec<String> {
        self.table.names()
    }

    /// Whether `name` is registered.
    pub fn has_publication(&self, name: &str) -> bool {
        self.table.contains(name)
    }
}

impl Default for PublicationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PublicationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublicationRegistry")
            .field("publications", &self.publications())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::methods::MethodRegistry;
    use serde_json::json;
    use tether_core::MethodError;

    fn admin() -> Arc<InvocationContext> {
        Arc::new(InvocationContext::for_administrative_call(
            Arc::new(MethodRegistry::new()),
            "test",
        ))
    }

    #[test]
    fn register_and_lookup() {
        let reg = PublicationRegistry::new();
        reg.register("feed", publish_fn(|ctx, _| ctx.ready()));
        assert!(reg.has_publication("feed"));
        assert!(reg.get("feed").is_some());
        assert!(reg.get("other").is_none());
    }

    #[test]
    fn batch_forms_normalize_to_one_table() {
        let reg = PublicationRegistry::new();
        reg.register("legacy", publish_fn(|ctx, _| ctx.stop()));
        reg.register_many(
            Publications::new()
                .publication("object_form", |ctx, _| ctx.stop())
                .async_publication("async_form", |_, _| async { Ok(json!(null)) }),
        );
        assert_eq!(
            reg.publications(),
            vec!["async_form", "legacy", "object_form"]
        );
    }

    #[test]
    fn sync_publication_reports_success() {
        let handler = publish_fn(|_, _| {});
        let reply = handler.run(&admin(), vec![]);
        assert!(reply.try_settled().unwrap().is_ok());
    }

    #[tokio::test]
    async fn async_publication_error_is_deferred() {
        let handler = async_publish_fn(|_, _| async { Err(MethodError::application("denied")) });
        let reply = handler.run(&admin(), vec![]);
        assert!(!reply.is_ready());
        assert_eq!(reply.await.unwrap_err().code(), "denied");
    }

    #[test]
    fn debug_lists_names() {
        let reg = PublicationRegistry::new();
        reg.register("a", publish_fn(|_, _| {}));
        assert!(format!("{reg:?}").contains("\"a\""));
    }
}
