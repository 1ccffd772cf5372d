//! ContextTrackingExecutor — a task executor whose tasks see the
//! submitter's contexts.
//!
//! Closures run on the runtime's blocking pool, futures on its workers.
//! Either way the submission is bound through a [`ContextBinder`] before it
//! leaves the submitting thread.

use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::binder::ContextBinder;
use crate::error::ScopeError;

struct ExecutorState {
    shutdown: AtomicBool,
    active: AtomicUsize,
    idle: Notify,
}

/// Counts one task as active until dropped.
struct ActivePermit(Arc<ExecutorState>);

impl ActivePermit {
    fn acquire(state: &Arc<ExecutorState>) -> Self {
        state.active.fetch_add(1, Ordering::SeqCst);
        Self(state.clone())
    }
}

impl Drop for ActivePermit {
    fn drop(&mut self) {
        if self.0.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Executor bound to a [`ContextBinder`] and a tokio runtime.
#[derive(Clone)]
pub struct ContextTrackingExecutor {
    name: Arc<str>,
    binder: ContextBinder,
    handle: Handle,
    state: Arc<ExecutorState>,
}

impl ContextTrackingExecutor {
    pub fn new(name: impl Into<Arc<str>>, binder: ContextBinder, handle: Handle) -> Self {
        Self {
            name: name.into(),
            binder,
            handle,
            state: Arc::new(ExecutorState {
                shutdown: AtomicBool::new(false),
                active: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn binder(&self) -> &ContextBinder {
        &self.binder
    }

    /// Run a blocking closure with the caller's contexts installed.
    pub fn execute<F, R>(&self, task: F) -> Result<TaskHandle<R>, ScopeError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let permit = self.admit()?;
        let task = self.binder.wrap(task);
        let join = self.handle.spawn_blocking(move || {
            let _permit = permit;
            task()
        });
        Ok(TaskHandle { join })
    }

    /// Spawn a future with the caller's contexts installed around each poll.
    pub fn spawn<F>(&self, future: F) -> Result<TaskHandle<F::Output>, ScopeError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let permit = self.admit()?;
        let future = self.binder.wrap_future(future);
        let join = self.handle.spawn(async move {
            let _permit = permit;
            future.await
        });
        Ok(TaskHandle { join })
    }

    /// Stop accepting tasks. Tasks already submitted run to completion.
    pub fn shutdown(&self) {
        if !self.state.shutdown.swap(true, Ordering::SeqCst) {
            info!(executor = %self.name, active = self.active_count(), "executor shutting down");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.shutdown.load(Ordering::SeqCst)
    }

    /// Tasks submitted and not yet finished.
    pub fn active_count(&self) -> usize {
        self.state.active.load(Ordering::SeqCst)
    }

    /// Wait until no task is active. Returns `false` on timeout.
    pub async fn await_termination(&self, timeout: Duration) -> bool {
        let idle = async {
            loop {
                let notified = self.state.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.state.active.load(Ordering::SeqCst) == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, idle).await.is_ok()
    }

    fn admit(&self) -> Result<ActivePermit, ScopeError> {
        let permit = ActivePermit::acquire(&self.state);
        if self.is_shutdown() {
            debug!(executor = %self.name, "rejecting task after shutdown");
            return Err(ScopeError::ExecutorShutdown(self.name.to_string()));
        }
        Ok(permit)
    }
}

impl std::fmt::Debug for ContextTrackingExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextTrackingExecutor")
            .field("name", &self.name)
            .field("shutdown", &self.is_shutdown())
            .field("active", &self.active_count())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Task handle
// ─────────────────────────────────────────────────────────────────────────────

/// Completion handle of a submitted task.
///
/// Resolves to the task's output, or to [`ScopeError::TaskPanicked`] /
/// [`ScopeError::TaskCancelled`].
#[must_use = "dropping the handle detaches the task"]
pub struct TaskHandle<R> {
    join: JoinHandle<R>,
}

impl<R> TaskHandle<R> {
    /// Cancel the task if it has not completed. Blocking closures that
    /// already started run to completion.
    pub fn abort(&self) {
        self.join.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

impl<R> Future for TaskHandle<R> {
    type Output = Result<R, ScopeError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.join).poll(cx).map(|result| {
            result.map_err(|e| {
                if e.is_panic() {
                    ScopeError::TaskPanicked(panic_message(e.into_panic()))
                } else {
                    ScopeError::TaskCancelled
                }
            })
        })
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
