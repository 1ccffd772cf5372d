//! The ClusterContext contract.

use std::fmt;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::ClusterError;

/// Cluster-wide identity of one websocket session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Completion of an asynchronous cluster send. Nothing is sent until polled.
pub type SendFuture = BoxFuture<'static, Result<(), ClusterError>>;

/// User properties of a session, visible from every node.
pub type UserProperties = Arc<DashMap<String, serde_json::Value>>;

/// A frame routed to a session on another node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterMessage {
    Text(String),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close { code: u16, reason: String },
}

impl ClusterMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Binary(_) => "binary",
            Self::Ping(_) => "ping",
            Self::Pong(_) => "pong",
            Self::Close { .. } => "close",
        }
    }
}

/// Receives directory changes and inbound messages for the sessions a node owns.
pub trait ClusterSessionListener: Send + Sync {
    /// A session was opened on `path` by another node.
    fn on_remote_open(&self, _path: &str, _session: &SessionId) {}

    /// A session on `path` owned by another node went away.
    fn on_remote_close(&self, _path: &str, _session: &SessionId) {}

    /// Deliver `message` to the local session. Returns `false` if the session
    /// is not open on this node.
    fn on_message(&self, session: &SessionId, message: ClusterMessage) -> bool;
}

/// Cross-node session directory and messaging.
///
/// Directory methods are synchronous; every send returns a [`SendFuture`]
/// that must be awaited for the frame to leave.
pub trait ClusterContext: Send + Sync {
    /// Name of this node.
    fn node_id(&self) -> &str;

    fn create_session_id(&self) -> SessionId;

    /// Record that this node owns `session`, open on `path`.
    fn register_session(&self, path: &str, session: &SessionId);

    fn remove_session(&self, path: &str, session: &SessionId);

    /// Sessions open on `path` owned by other nodes.
    fn remote_session_ids(&self, path: &str) -> Vec<SessionId>;

    fn distributed_user_properties(&self, session: &SessionId) -> UserProperties;

    /// Route `message` to the node owning `session`.
    fn send(&self, session: &SessionId, message: ClusterMessage) -> SendFuture;

    fn send_text(&self, session: &SessionId, text: String) -> SendFuture {
        self.send(session, ClusterMessage::Text(text))
    }

    fn send_binary(&self, session: &SessionId, data: Bytes) -> SendFuture {
        self.send(session, ClusterMessage::Binary(data))
    }

    fn send_ping(&self, session: &SessionId, payload: Bytes) -> SendFuture {
        self.send(session, ClusterMessage::Ping(payload))
    }

    fn send_pong(&self, session: &SessionId, payload: Bytes) -> SendFuture {
        self.send(session, ClusterMessage::Pong(payload))
    }

    fn close(&self, session: &SessionId, code: u16, reason: String) -> SendFuture {
        self.send(session, ClusterMessage::Close { code, reason })
    }

    /// Install the receiver of this node's directory events and inbound
    /// messages. The cluster does not keep the listener alive.
    fn set_session_listener(&self, listener: Weak<dyn ClusterSessionListener>);
}
