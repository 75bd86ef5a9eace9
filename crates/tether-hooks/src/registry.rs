//! Hook registry.
//!
//! Callbacks are kept in registration order. `F` is the callback's trait
//! object type (for example `dyn Fn(&Arc<Connection>) + Send + Sync`), so one
//! registry type serves every hook signature; the caller decides how to
//! invoke each callback in [`HookRegistry::fire_all`].

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, error};

struct Entry<F: ?Sized> {
    id: u64,
    callback: Arc<F>,
    stopped: Arc<AtomicBool>,
}

struct Inner<F: ?Sized> {
    next_id: u64,
    entries: Vec<Entry<F>>,
}

/// Registry of callbacks fired in registration order.
pub struct HookRegistry<F: ?Sized> {
    name: &'static str,
    inner: Arc<Mutex<Inner<F>>>,
}

impl<F: ?Sized + Send + Sync + 'static> HookRegistry<F> {
    /// Create an empty registry. `name` only appears in logs.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Arc::new(Mutex::new(Inner {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }

    /// Register a callback. It runs in every later pass until its handle is stopped.
    pub fn register(&self, callback: Arc<F>) -> HookHandle {
        let stopped = Arc::new(AtomicBool::new(false));
        let id = {
            let mut inner = self.inner.lock();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.entries.push(Entry {
                id,
                callback,
                stopped: stopped.clone(),
            });
            id
        };
        debug!(hook = self.name, id, "registered hook");

        let weak: Weak<Mutex<Inner<F>>> = Arc::downgrade(&self.inner);
        HookHandle {
            stopped,
            remove: Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.lock().entries.retain(|e| e.id != id);
                }
            }),
        }
    }

    /// Invoke every registered callback in registration order.
    ///
    /// The set of callbacks is fixed when the pass starts: callbacks
    /// registered during the pass do not run in it. Each callback's handle is
    /// re-checked right before invocation, so a stop issued by an earlier
    /// callback suppresses a later one in the same pass.
    pub fn fire_all(&self, mut invoke: impl FnMut(&F)) {
        let snapshot: Vec<(u64, Arc<F>, Arc<AtomicBool>)> = self
            .inner
            .lock()
            .entries
            .iter()
            .map(|e| (e.id, e.callback.clone(), e.stopped.clone()))
            .collect();

        for (id, callback, stopped) in snapshot {
            if stopped.load(Ordering::Acquire) {
                continue;
            }
            let outcome = catch_unwind(AssertUnwindSafe(|| invoke(&callback)));
            if outcome.is_err() {
                error!(hook = self.name, id, "hook callback panicked");
            }
        }
    }

    /// Number of registered (not stopped) callbacks.
    #[must_use]
    pub fn count(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether no callbacks are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Stop every registered callback.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        for entry in &inner.entries {
            entry.stopped.store(true, Ordering::Release);
        }
        inner.entries.clear();
    }
}

impl<F: ?Sized> std::fmt::Debug for HookRegistry<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("name", &self.name)
            .field("hook_count", &self.inner.lock().entries.len())
            .finish()
    }
}

/// Handle returned by [`HookRegistry::register`].
///
/// Dropping the handle does not unregister the callback.
pub struct HookHandle {
    stopped: Arc<AtomicBool>,
    remove: Box<dyn Fn() + Send + Sync>,
}

impl HookHandle {
    /// Unregister the callback. Idempotent.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            (self.remove)();
        }
    }

    /// Whether [`stop`](Self::stop) has been called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for HookHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookHandle")
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}
