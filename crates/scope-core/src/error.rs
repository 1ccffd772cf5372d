//! Scope error types.

use thiserror::Error;

/// Errors raised while resolving, producing or handing off scoped objects.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScopeError {
    /// No context of the requested scope is active on the current thread.
    #[error("no {scope} context is active on the current thread")]
    OutOfScope { scope: &'static str },

    /// The context was disposed; nothing more can be produced in it.
    #[error("context {id} has been closed")]
    ContextClosed { id: String },

    /// A key was used with a value type other than the one it names.
    #[error("key {key} cannot hold a value of type {requested}")]
    TypeMismatch { key: String, requested: &'static str },

    /// A fallible producer returned an error; nothing was stored.
    #[error("producer for {key} failed: {message}")]
    Producer { key: String, message: String },

    /// A producer asked, directly or through other keys, for the key it is
    /// producing.
    #[error("cyclic production of {key}")]
    CyclicProduction { key: String },

    /// A task handed off to an executor panicked.
    #[error("task panicked: {0}")]
    TaskPanicked(String),

    /// A task handed off to an executor was cancelled before completion.
    #[error("task was cancelled before completion")]
    TaskCancelled,

    /// The executor no longer accepts tasks.
    #[error("executor {0} is shut down")]
    ExecutorShutdown(String),
}

impl ScopeError {
    pub fn out_of_scope(scope: &'static str) -> Self {
        Self::OutOfScope { scope }
    }

    pub fn closed(id: impl ToString) -> Self {
        Self::ContextClosed { id: id.to_string() }
    }

    /// Whether this error means "a scoping contract was violated by the caller"
    /// rather than a failure of the produced object itself.
    pub fn is_scoping_failure(&self) -> bool {
        matches!(
            self,
            Self::OutOfScope { .. }
                | Self::ContextClosed { .. }
                | Self::TypeMismatch { .. }
                | Self::CyclicProduction { .. }
        )
    }
}
