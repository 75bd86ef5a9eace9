//! Name → handler tables shared by methods and publications.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

/// A table of named handlers. Re-registering a name replaces the old handler.
pub struct HandlerTable<H: ?Sized> {
    kind: &'static str,
    handlers: RwLock<HashMap<String, Arc<H>>>,
}

impl<H: ?Sized> HandlerTable<H> {
    /// Create an empty table. `kind` only appears in logs.
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register `handler` under `name`, replacing any previous handler.
    pub fn insert(&self, name: impl Into<String>, handler: Arc<H>) {
        let name = name.into();
        let replaced = self.handlers.write().insert(name.clone(), handler).is_some();
        if replaced {
            warn!(kind = self.kind, handler = %name, "handler re-registered, previous one replaced");
        } else {
            debug!(kind = self.kind, handler = %name, "handler registered");
        }
    }

    /// Register every pair of `batch`. Same as inserting them one by one.
    pub fn extend(&self, batch: impl IntoIterator<Item = (String, Arc<H>)>) {
        for (name, handler) in batch {
            self.insert(name, handler);
        }
    }

    /// Look up a handler.
    pub fn get(&self, name: &str) -> Option<Arc<H>> {
        self.handlers.read().get(name).cloned()
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.read().contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<H: ?Sized> std::fmt::Debug for HandlerTable<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerTable")
            .field("kind", &self.kind)
            .field("names", &self.names())
            .finish()
    }
}

/// Several named handlers registered together.
///
/// Built with [`Methods`](crate::methods::Methods) or
/// [`Publications`](crate::publications::Publications).
pub struct Batch<H: ?Sized> {
    entries: Vec<(String, Arc<H>)>,
}

impl<H: ?Sized> Batch<H> {
    /// Empty batch.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Add an already boxed handler.
    #[must_use]
    pub fn with_handler(mut self, name: impl Into<String>, handler: Arc<H>) -> Self {
        self.entries.push((name.into(), handler));
        self
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<H: ?Sized> Default for Batch<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: ?Sized> IntoIterator for Batch<H> {
    type Item = (String, Arc<H>);
    type IntoIter = std::vec::IntoIter<(String, Arc<H>)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<H: ?Sized> FromIterator<(String, Arc<H>)> for Batch<H> {
    fn from_iter<I: IntoIterator<Item = (String, Arc<H>)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
