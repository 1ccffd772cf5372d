//! ContextBinder — carry the active contexts across a hand-off.
//!
//! A binder knows a fixed, ordered set of trackers. Wrapping a task captures
//! the value of each tracker on the submitting thread; running the wrapped
//! task installs the captured values in registration order and uninstalls
//! them in reverse. A tracker with nothing installed at capture time is
//! installed as "absent", so the task never sees a context leaked from the
//! thread that happens to run it.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

use crate::context::Context;
use crate::injection::Instance;
use crate::tracker::{self, ContextTracker, TrackerId, TrackingGuard};

/// Ordered set of trackers whose values travel with wrapped tasks.
#[derive(Debug, Clone, Default)]
pub struct ContextBinder {
    trackers: Vec<TrackerId>,
}

impl ContextBinder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `tracker`. Registering the same tracker twice has no effect.
    pub fn with_tracker<T: Context>(mut self, tracker: &ContextTracker<T>) -> Self {
        if !self.trackers.contains(&tracker.id()) {
            self.trackers.push(tracker.id());
        }
        self
    }

    pub fn trackers(&self) -> &[TrackerId] {
        &self.trackers
    }

    /// Snapshot the current value of every registered tracker.
    pub fn capture(&self) -> CapturedContexts {
        CapturedContexts {
            entries: self
                .trackers
                .iter()
                .map(|id| (*id, tracker::installed(*id)))
                .collect(),
        }
    }

    /// Bind `task` to the contexts active right now.
    pub fn wrap<F, R>(&self, task: F) -> impl FnOnce() -> R + Send + 'static + use<F, R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: 'static,
    {
        let contexts = self.capture();
        move || contexts.run(task)
    }

    /// Bind `future` to the contexts active right now; they are installed
    /// around each poll.
    pub fn wrap_future<F: Future>(&self, future: F) -> Tracked<F> {
        Tracked::new(self.capture(), future)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Captured contexts
// ─────────────────────────────────────────────────────────────────────────────

/// Tracker values captured at wrap time.
#[derive(Clone, Default)]
pub struct CapturedContexts {
    entries: Vec<(TrackerId, Option<Instance>)>,
}

impl CapturedContexts {
    pub(crate) fn single(id: TrackerId, value: Option<Instance>) -> Self {
        Self {
            entries: vec![(id, value)],
        }
    }

    pub(crate) fn from_entries(entries: Vec<(TrackerId, Option<Instance>)>) -> Self {
        Self { entries }
    }

    /// Run `task` with the captured values installed.
    pub fn run<R>(&self, task: impl FnOnce() -> R) -> R {
        let _guards = self.install();
        task()
    }

    /// Install the captured values around every poll of `future`.
    pub fn bind<F: Future>(self, future: F) -> Tracked<F> {
        Tracked::new(self, future)
    }

    /// Number of trackers that had a context at capture time.
    pub fn present(&self) -> usize {
        self.entries.iter().filter(|(_, v)| v.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.present() == 0
    }

    fn install(&self) -> GuardStack {
        GuardStack(
            self.entries
                .iter()
                .map(|(id, value)| tracker::install(*id, value.clone()))
                .collect(),
        )
    }
}

impl fmt::Debug for CapturedContexts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|(id, v)| (id, v.is_some())))
            .finish()
    }
}

/// Guards released last-installed first.
struct GuardStack(Vec<TrackingGuard>);

impl Drop for GuardStack {
    fn drop(&mut self) {
        while let Some(guard) = self.0.pop() {
            drop(guard);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tracked future
// ─────────────────────────────────────────────────────────────────────────────

/// A future that runs every poll with a fixed set of contexts installed.
///
/// The install is scoped to the poll, so the future may move between worker
/// threads and never leaves its contexts behind on a thread.
#[must_use = "futures do nothing unless polled"]
pub struct Tracked<F> {
    contexts: CapturedContexts,
    inner: Pin<Box<F>>,
}

impl<F: Future> Tracked<F> {
    pub(crate) fn new(contexts: CapturedContexts, future: F) -> Self {
        Self {
            contexts,
            inner: Box::pin(future),
        }
    }

    pub fn contexts(&self) -> &CapturedContexts {
        &self.contexts
    }
}

impl<F: Future> Future for Tracked<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let _guards = this.contexts.install();
        this.inner.as_mut().poll(cx)
    }
}

impl<F> fmt::Debug for Tracked<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracked").field("contexts", &self.contexts).finish()
    }
}
