//! Scopes and providers, the injection-side view of the trackers.
//!
//! A [`ContextScope`] resolves "the context of my type active on this
//! thread"; a [`ScopedProvider`] produces one binding inside whatever context
//! of that scope is active when it is asked. [`ScopeModule`] is the
//! process-wide owner of the three trackers and the binder built from them.

use std::fmt;
use std::sync::Arc;

use tokio::runtime::Handle;

use crate::binder::{CapturedContexts, ContextBinder};
use crate::context::{Context, ContainerCallContext, HttpSessionContext, WebsocketConnectionContext};
use crate::error::ScopeError;
use crate::executor::ContextTrackingExecutor;
use crate::injection::Instance;
use crate::key::Key;
use crate::tracker::ContextTracker;

/// Resolves the active context of type `T`.
pub struct ContextScope<T> {
    tracker: ContextTracker<T>,
}

impl<T: Context> ContextScope<T> {
    pub fn new(tracker: ContextTracker<T>) -> Self {
        Self { tracker }
    }

    pub fn tracker(&self) -> &ContextTracker<T> {
        &self.tracker
    }

    /// The active context, or [`ScopeError::OutOfScope`].
    pub fn current(&self) -> Result<Arc<T>, ScopeError> {
        self.tracker.current().ok_or(ScopeError::out_of_scope(T::SCOPE))
    }

    /// Produce `key` in the active context.
    pub fn produce<V: Send + Sync + 'static>(
        &self,
        key: &Key,
        producer: impl FnOnce() -> V,
    ) -> Result<Arc<V>, ScopeError> {
        self.current()?.injection().produce(key, producer)
    }

    /// A provider for `key` whose instances live in this scope.
    pub fn provider<V, P>(&self, key: Key, producer: P) -> ScopedProvider<V>
    where
        V: Send + Sync + 'static,
        P: Fn() -> V + Send + Sync + 'static,
    {
        let scope = *self;
        let resolve_key = key.clone();
        ScopedProvider {
            key,
            scope: T::SCOPE,
            resolve: Arc::new(move || scope.produce(&resolve_key, &producer)),
        }
    }
}

impl<T> Clone for ContextScope<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ContextScope<T> {}

impl<T: Context> fmt::Debug for ContextScope<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ContextScope").field(&T::SCOPE).finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Provider
// ─────────────────────────────────────────────────────────────────────────────

type Resolve<V> = Arc<dyn Fn() -> Result<Arc<V>, ScopeError> + Send + Sync>;

/// Produces a scoped `V` on demand.
///
/// `get()` returns the instance stored in the context active on the calling
/// thread, producing it on first use. Outside the scope it fails with
/// [`ScopeError::OutOfScope`].
pub struct ScopedProvider<V> {
    key: Key,
    scope: &'static str,
    resolve: Resolve<V>,
}

impl<V> ScopedProvider<V> {
    pub fn get(&self) -> Result<Arc<V>, ScopeError> {
        (self.resolve)()
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn scope(&self) -> &'static str {
        self.scope
    }
}

impl<V> Clone for ScopedProvider<V> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            scope: self.scope,
            resolve: self.resolve.clone(),
        }
    }
}

impl<V> fmt::Debug for ScopedProvider<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedProvider")
            .field("key", &self.key)
            .field("scope", &self.scope)
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Module
// ─────────────────────────────────────────────────────────────────────────────

/// Owner of the container-call, websocket-connection and HTTP-session
/// trackers. Built once at startup and handed to everything that installs
/// or resolves contexts.
#[derive(Debug, Clone)]
pub struct ScopeModule {
    session: ContextScope<HttpSessionContext>,
    connection: ContextScope<WebsocketConnectionContext>,
    call: ContextScope<ContainerCallContext>,
    binder: ContextBinder,
}

impl ScopeModule {
    pub fn new() -> Self {
        let session = ContextScope::new(ContextTracker::new());
        let connection = ContextScope::new(ContextTracker::new());
        let call = ContextScope::new(ContextTracker::new());

        // Outer scopes first so that inner scopes are uninstalled first
        let binder = ContextBinder::new()
            .with_tracker(session.tracker())
            .with_tracker(connection.tracker())
            .with_tracker(call.tracker());

        Self {
            session,
            connection,
            call,
            binder,
        }
    }

    pub fn session(&self) -> &ContextScope<HttpSessionContext> {
        &self.session
    }

    pub fn connection(&self) -> &ContextScope<WebsocketConnectionContext> {
        &self.connection
    }

    pub fn call(&self) -> &ContextScope<ContainerCallContext> {
        &self.call
    }

    pub fn binder(&self) -> &ContextBinder {
        &self.binder
    }

    /// An executor that propagates all three scopes.
    pub fn executor(&self, name: impl Into<Arc<str>>, handle: Handle) -> ContextTrackingExecutor {
        ContextTrackingExecutor::new(name, self.binder.clone(), handle)
    }

    /// Contexts to install while serving `call`: its session, its connection
    /// and the call itself. Links the call does not have are installed as
    /// absent.
    pub fn contexts_for(&self, call: &Arc<ContainerCallContext>) -> CapturedContexts {
        CapturedContexts::from_entries(vec![
            (self.session.tracker().id(), call.session().map(|s| s.clone() as Instance)),
            (self.connection.tracker().id(), call.connection().map(|c| c.clone() as Instance)),
            (self.call.tracker().id(), Some(call.clone() as Instance)),
        ])
    }
}

impl Default for ScopeModule {
    fn default() -> Self {
        Self::new()
    }
}
