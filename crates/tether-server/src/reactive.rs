//! Reactive inputs for publish handlers.
//!
//! A [`ReactiveVar`] is a value cell with a version counter. Reading it
//! inside a subscription run records a [`Dependency`] on the run's
//! [`Dependencies`]; writing it bumps the version, which wakes every
//! subscription whose last run read it. Versions travel over a
//! `tokio::sync::watch` channel, so any number of writes between two
//! observations collapse into one wakeup.

use futures::future::select_all;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;

use crate::context;

/// A value whose reads are tracked by subscription runs.
pub struct ReactiveVar<T> {
    value: RwLock<T>,
    version: watch::Sender<u64>,
}

impl<T: Clone> ReactiveVar<T> {
    /// Create a cell holding `value`.
    pub fn new(value: T) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            value: RwLock::new(value),
            version,
        }
    }

    /// Read the value, recording a dependency if a subscription run is ambient.
    pub fn get(&self) -> T {
        if let Some(deps) = context::current().and_then(|ctx| ctx.dependencies().cloned()) {
            deps.add(self.dependency());
        }
        self.get_untracked()
    }

    /// Read the value without recording a dependency.
    pub fn get_untracked(&self) -> T {
        self.value.read().clone()
    }

    /// Replace the value and invalidate every dependent run.
    ///
    /// Every write counts as a change, even when the new value equals the old.
    pub fn set(&self, value: T) {
        *self.value.write() = value;
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }

    /// Current version; bumped by every [`set`](Self::set).
    pub fn version(&self) -> u64 {
        *self.version.borrow()
    }

    /// A dependency that fires on the next write after this call.
    pub fn dependency(&self) -> Dependency {
        Dependency {
            rx: self.version.subscribe(),
        }
    }
}

impl<T: Clone + Default> Default for ReactiveVar<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for ReactiveVar<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactiveVar")
            .field("value", &*self.value.read())
            .field("version", &*self.version.borrow())
            .finish()
    }
}

/// One observed input of a run.
#[derive(Debug)]
pub struct Dependency {
    rx: watch::Receiver<u64>,
}

impl Dependency {
    /// Whether the input was written since the dependency was taken.
    pub fn has_changed(&self) -> bool {
        self.rx.has_changed().unwrap_or(false)
    }
}

/// Inputs read during one subscription run.
#[derive(Debug, Default)]
pub struct Dependencies {
    inner: Mutex<Vec<Dependency>>,
}

impl Dependencies {
    /// Record an input.
    pub fn add(&self, dependency: Dependency) {
        self.inner.lock().push(dependency);
    }

    /// Number of recorded inputs.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take every recorded input, leaving the set empty.
    pub(crate) fn take(&self) -> Vec<Dependency> {
        std::mem::take(&mut *self.inner.lock())
    }
}

/// Resolve once any of `deps` changes.
///
/// Inputs whose cell was dropped can never change again and are discarded.
/// With nothing left to watch this future never resolves.
pub(crate) async fn wait_for_change(deps: &mut Vec<Dependency>) {
    loop {
        if deps.is_empty() {
            std::future::pending::<()>().await;
        }
        let (changed, index) = {
            let watchers = deps.iter_mut().map(|d| Box::pin(d.rx.changed()));
            let (changed, index, _rest) = select_all(watchers).await;
            (changed, index)
        };
        if changed.is_ok() {
            return;
        }
        let _ = deps.swap_remove(index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn get_and_set() {
        let var = ReactiveVar::new(1);
        assert_eq!(var.get(), 1);
        var.set(2);
        assert_eq!(var.get_untracked(), 2);
        assert_eq!(var.version(), 1);
    }

    #[test]
    fn dependency_sees_later_writes_only() {
        let var = ReactiveVar::new("a".to_owned());
        var.set("b".into());
        let dep = var.dependency();
        assert!(!dep.has_changed());
        var.set("c".into());
        assert!(dep.has_changed());
    }

    #[test]
    fn same_value_write_still_invalidates() {
        let var = ReactiveVar::new(Some("u1".to_owned()));
        let dep = var.dependency();
        var.set(Some("u1".into()));
        assert!(dep.has_changed());
    }

    #[test]
    fn untracked_read_outside_run_records_nothing() {
        let deps = Dependencies::default();
        let var = ReactiveVar::new(0);
        let _ = var.get();
        assert!(deps.is_empty());
    }

    #[tokio::test]
    async fn wait_resolves_on_write() {
        let var = std::sync::Arc::new(ReactiveVar::new(0));
        let mut deps = vec![var.dependency()];
        let writer = var.clone();
        let _ = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            writer.set(1);
        });
        tokio::time::timeout(Duration::from_secs(1), wait_for_change(&mut deps))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn many_writes_collapse_into_one_wakeup() {
        let var = ReactiveVar::new(0);
        let mut deps = vec![var.dependency()];
        var.set(1);
        var.set(2);
        var.set(3);
        wait_for_change(&mut deps).await;
        assert!(!deps[0].has_changed());
        let again = tokio::time::timeout(Duration::from_millis(20), wait_for_change(&mut deps)).await;
        assert!(again.is_err());
    }

    #[tokio::test]
    async fn dropped_cell_is_discarded() {
        let gone = ReactiveVar::new(0);
        let live = ReactiveVar::new(0);
        let mut deps = vec![gone.dependency(), live.dependency()];
        drop(gone);
        live.set(1);
        wait_for_change(&mut deps).await;
        assert_eq!(deps.len(), 1);
    }

    #[tokio::test]
    async fn empty_set_never_resolves() {
        let mut deps = Vec::new();
        let res = tokio::time::timeout(Duration::from_millis(20), wait_for_change(&mut deps)).await;
        assert!(res.is_err());
    }

    #[test]
    fn dependencies_take_drains() {
        let var = ReactiveVar::new(0);
        let deps = Dependencies::default();
        deps.add(var.dependency());
        deps.add(var.dependency());
        assert_eq!(deps.len(), 2);
        assert_eq!(deps.take().len(), 2);
        assert!(deps.is_empty());
    }
}
