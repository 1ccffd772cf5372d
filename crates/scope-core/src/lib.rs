//! Scopeway core — scoped injection contexts and context propagation.
//!
//! This crate owns the parts of scope propagation that do not depend on any
//! container or transport:
//! - [`InjectionContext`]: at-most-one instance per [`Key`] within one scope
//! - [`Context`] variants for a container call, a websocket connection and an
//!   HTTP session
//! - [`ContextTracker`]: "which context is active on this thread"
//! - [`ContextBinder`] / [`ContextTrackingExecutor`]: carry the active
//!   contexts across thread and task hand-offs
//!
//! Transports and servers build on top of it through [`ScopeModule`].

pub mod attributes;
pub mod binder;
pub mod context;
pub mod error;
pub mod executor;
pub mod injection;
pub mod key;
pub mod scope;
pub mod tracker;

pub use attributes::Attributes;
pub use binder::{CapturedContexts, ContextBinder, Tracked};
pub use context::{
    CallKind, ContainerCallContext, Context, ContextId, HttpSessionContext, WebsocketConnectionContext,
    WebsocketEvent,
};
pub use error::ScopeError;
pub use executor::{ContextTrackingExecutor, TaskHandle};
pub use injection::{ContextSnapshot, InjectionContext, Instance};
pub use key::Key;
pub use scope::{ContextScope, ScopeModule, ScopedProvider};
pub use tracker::{ContextTracker, TrackerId, TrackingGuard};
