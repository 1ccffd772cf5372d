//! Cluster error types.

use thiserror::Error;

use crate::cluster::SessionId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClusterError {
    /// No node owns the session.
    #[error("unknown cluster session {0}")]
    UnknownSession(SessionId),

    /// The owning node left the cluster or has no session listener.
    #[error("cluster node {0} is unavailable")]
    NodeUnavailable(String),

    /// The owning node accepted the message but could not deliver it.
    #[error("delivery to {session} failed: {reason}")]
    Delivery { session: SessionId, reason: String },

    /// This node has left the cluster.
    #[error("cluster node is closed")]
    Closed,
}
