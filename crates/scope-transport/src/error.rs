//! Transport error types.

use scope_cluster::ClusterError;
use scope_core::ScopeError;
use thiserror::Error;

use crate::connection::{ConnectionId, ConnectionState};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The connection is closing or closed.
    #[error("connection {0} is closed")]
    ConnectionClosed(ConnectionId),

    /// A lifecycle step was attempted out of order.
    #[error("invalid connection state transition {from:?} -> {to:?}")]
    InvalidTransition { from: ConnectionState, to: ConnectionState },

    /// The container could not accept an outbound frame.
    #[error("send failed: {0}")]
    Send(String),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Scope(#[from] ScopeError),
}
