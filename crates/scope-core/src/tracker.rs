//! ContextTracker — which context of a given type is active on this thread.
//!
//! Every tracker owns one slot in a per-thread map. Installing a context
//! returns a [`TrackingGuard`] that puts the previous value back when it is
//! dropped, so nesting and panics restore the outer view. The guard is not
//! `Send`: it must be dropped on the thread that created it.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::binder::{CapturedContexts, Tracked};
use crate::context::Context;
use crate::injection::Instance;

thread_local! {
    static SLOTS: RefCell<HashMap<TrackerId, Instance>> = RefCell::new(HashMap::new());
}

static NEXT_TRACKER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one tracker, used to key the per-thread slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackerId(u64);

impl TrackerId {
    fn next() -> Self {
        Self(NEXT_TRACKER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TrackerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tracker-{}", self.0)
    }
}

/// The value currently installed for `id` on this thread.
pub(crate) fn installed(id: TrackerId) -> Option<Instance> {
    SLOTS.try_with(|slots| slots.borrow().get(&id).cloned()).ok().flatten()
}

/// Install `value` (or nothing) for `id` until the returned guard drops.
pub(crate) fn install(id: TrackerId, value: Option<Instance>) -> TrackingGuard {
    let previous = swap(id, value);
    TrackingGuard {
        tracker: id,
        previous,
        _not_send: PhantomData,
    }
}

fn swap(id: TrackerId, value: Option<Instance>) -> Option<Instance> {
    SLOTS
        .try_with(|slots| {
            let mut slots = slots.borrow_mut();
            match value {
                Some(v) => slots.insert(id, v),
                None => slots.remove(&id),
            }
        })
        .ok()
        .flatten()
}

// ─────────────────────────────────────────────────────────────────────────────
// Guard
// ─────────────────────────────────────────────────────────────────────────────

/// Restores the previously installed value of one tracker on drop.
#[must_use = "the context is uninstalled as soon as the guard is dropped"]
pub struct TrackingGuard {
    tracker: TrackerId,
    previous: Option<Instance>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for TrackingGuard {
    fn drop(&mut self) {
        // The replaced value is dropped after the slot borrow is released
        let replaced = swap(self.tracker, self.previous.take());
        drop(replaced);
    }
}

impl fmt::Debug for TrackingGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackingGuard")
            .field("tracker", &self.tracker)
            .field("restores_value", &self.previous.is_some())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tracker
// ─────────────────────────────────────────────────────────────────────────────

/// Tracks the active context of type `T`.
///
/// Trackers are cheap handles; copies share the same slot.
pub struct ContextTracker<T> {
    id: TrackerId,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Context> ContextTracker<T> {
    /// A tracker with a fresh, empty slot.
    pub fn new() -> Self {
        Self {
            id: TrackerId::next(),
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> TrackerId {
        self.id
    }

    /// The context installed on the current thread, if any.
    pub fn current(&self) -> Option<Arc<T>> {
        installed(self.id).and_then(|instance| instance.downcast::<T>().ok())
    }

    /// Install `context` until the returned guard is dropped.
    pub fn enter(&self, context: Arc<T>) -> TrackingGuard {
        install(self.id, Some(context as Instance))
    }

    /// Run `task` with `context` installed, restoring the previous value on
    /// every exit path.
    pub fn track_while_executing<R>(&self, context: Arc<T>, task: impl FnOnce() -> R) -> R {
        let _guard = self.enter(context);
        task()
    }

    /// Install `context` around every poll of `future`.
    pub fn track_future<F: Future>(&self, context: Arc<T>, future: F) -> Tracked<F> {
        Tracked::new(CapturedContexts::single(self.id, Some(context as Instance)), future)
    }
}

impl<T: Context> Default for ContextTracker<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for ContextTracker<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ContextTracker<T> {}

impl<T: Context> fmt::Debug for ContextTracker<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextTracker")
            .field("id", &self.id)
            .field("scope", &T::SCOPE)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::HttpSessionContext;

    #[test]
    fn nested_install_restores_outer() {
        let tracker = ContextTracker::<HttpSessionContext>::new();
        let outer = Arc::new(HttpSessionContext::new("outer"));
        let inner = Arc::new(HttpSessionContext::new("inner"));

        assert!(tracker.current().is_none());
        tracker.track_while_executing(outer.clone(), || {
            tracker.track_while_executing(inner.clone(), || {
                assert!(Arc::ptr_eq(&tracker.current().unwrap(), &inner));
            });
            assert!(Arc::ptr_eq(&tracker.current().unwrap(), &outer));
        });
        assert!(tracker.current().is_none());
    }

    #[test]
    fn trackers_do_not_share_slots() {
        let a = ContextTracker::<HttpSessionContext>::new();
        let b = ContextTracker::<HttpSessionContext>::new();
        let _guard = a.enter(Arc::new(HttpSessionContext::new("a")));
        assert!(a.current().is_some());
        assert!(b.current().is_none());
    }
}
