//! ConnectionProxy — the application's handle to one websocket session,
//! local or on another cluster node.
//!
//! Local proxies are created once per connection and stored in the
//! [`ConnectionRegistry`]; every peer query returns that same `Arc`.
//! Remote proxies are built per query and route frames through the
//! cluster's asynchronous sends. Proxies reach the registry through a weak
//! handle, so a connection's peer set never owns the registry.

use std::fmt;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use futures_util::future::{self, BoxFuture, FutureExt, TryFutureExt};
use parking_lot::Mutex;
use scope_cluster::{ClusterContext, SessionId, UserProperties};
use scope_core::WebsocketConnectionContext;
use tracing::debug;

use crate::connection::{CloseReason, ConnectionId, ConnectionState, Message, RawConnection};
use crate::error::TransportError;
use crate::registry::ConnectionRegistry;

/// Completion of a frame sent through a proxy.
pub type ProxySend = BoxFuture<'static, Result<(), TransportError>>;

enum Kind {
    Local {
        connection: Arc<dyn RawConnection>,
        context: Arc<WebsocketConnectionContext>,
        state: Mutex<ConnectionState>,
    },
    Remote {
        cluster: Arc<dyn ClusterContext>,
    },
}

pub struct ConnectionProxy {
    path: String,
    session: SessionId,
    kind: Kind,
    registry: Weak<ConnectionRegistry>,
}

impl ConnectionProxy {
    pub(crate) fn local(
        connection: Arc<dyn RawConnection>,
        context: Arc<WebsocketConnectionContext>,
        session: SessionId,
        registry: Weak<ConnectionRegistry>,
    ) -> Self {
        Self {
            path: connection.path().to_string(),
            session,
            kind: Kind::Local {
                connection,
                context,
                state: Mutex::new(ConnectionState::Opening),
            },
            registry,
        }
    }

    pub(crate) fn remote(
        path: &str,
        session: SessionId,
        cluster: Arc<dyn ClusterContext>,
        registry: Weak<ConnectionRegistry>,
    ) -> Self {
        Self {
            path: path.to_string(),
            session,
            kind: Kind::Remote { cluster },
            registry,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Cluster-wide session identity.
    pub fn session_id(&self) -> &SessionId {
        &self.session
    }

    /// Id of the local raw connection; `None` for remote sessions.
    pub fn connection_id(&self) -> Option<ConnectionId> {
        match &self.kind {
            Kind::Local { connection, .. } => Some(connection.id()),
            Kind::Remote { .. } => None,
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.kind, Kind::Remote { .. })
    }

    /// Connection context of a local session.
    pub fn context(&self) -> Option<&Arc<WebsocketConnectionContext>> {
        match &self.kind {
            Kind::Local { context, .. } => Some(context),
            Kind::Remote { .. } => None,
        }
    }

    /// The raw connection of a local session.
    pub fn raw(&self) -> Option<&Arc<dyn RawConnection>> {
        match &self.kind {
            Kind::Local { connection, .. } => Some(connection),
            Kind::Remote { .. } => None,
        }
    }

    /// Lifecycle state. Remote sessions are reported open while the
    /// directory lists them.
    pub fn state(&self) -> ConnectionState {
        match &self.kind {
            Kind::Local { state, .. } => *state.lock(),
            Kind::Remote { .. } => ConnectionState::Open,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub(crate) fn transition(&self, to: ConnectionState) -> Result<(), TransportError> {
        let Kind::Local { state, .. } = &self.kind else {
            return Ok(());
        };
        let mut state = state.lock();
        *state = state.transition(to)?;
        debug!(session = %self.session, state = ?to, "connection state changed");
        Ok(())
    }

    /// Move an open or opening local session to `Closing`. Returns `false`
    /// if it is already closing or closed, or if the session is remote.
    pub(crate) fn begin_close(&self) -> bool {
        let Kind::Local { state, .. } = &self.kind else {
            return false;
        };
        let mut state = state.lock();
        if !state.accepts_frames() {
            return false;
        }
        match state.transition(ConnectionState::Closing) {
            Ok(next) => {
                *state = next;
                debug!(session = %self.session, "connection closing");
                true
            }
            Err(_) => false,
        }
    }

    // ── Sending ───────────────────────────────────────────────────────────

    pub fn send(&self, message: Message) -> ProxySend {
        match &self.kind {
            Kind::Local {
                connection, state, ..
            } => {
                let result = if state.lock().accepts_frames() {
                    connection.send(message)
                } else {
                    Err(TransportError::ConnectionClosed(connection.id()))
                };
                future::ready(result).boxed()
            }
            Kind::Remote { cluster } => {
                let send = match message {
                    Message::Text(text) => cluster.send_text(&self.session, text),
                    Message::Binary(data) => cluster.send_binary(&self.session, data),
                    Message::Ping(payload) => cluster.send_ping(&self.session, payload),
                    Message::Pong(payload) => cluster.send_pong(&self.session, payload),
                };
                send.map_err(TransportError::from).boxed()
            }
        }
    }

    pub fn send_text(&self, text: impl Into<String>) -> ProxySend {
        self.send(Message::Text(text.into()))
    }

    pub fn send_binary(&self, data: impl Into<Bytes>) -> ProxySend {
        self.send(Message::Binary(data.into()))
    }

    pub fn send_ping(&self, payload: impl Into<Bytes>) -> ProxySend {
        self.send(Message::Ping(payload.into()))
    }

    pub fn send_pong(&self, payload: impl Into<Bytes>) -> ProxySend {
        self.send(Message::Pong(payload.into()))
    }

    /// Ask the connection to close. The endpoint's close callback runs once
    /// the container reports the socket closed.
    pub fn close(&self, reason: CloseReason) -> ProxySend {
        match &self.kind {
            Kind::Local { connection, .. } => future::ready(connection.close(reason)).boxed(),
            Kind::Remote { cluster } => cluster
                .close(&self.session, reason.code, reason.reason)
                .map_err(TransportError::from)
                .boxed(),
        }
    }

    // ── Peers ─────────────────────────────────────────────────────────────

    /// Every session open on this proxy's path across the cluster,
    /// including this one.
    pub fn peers(&self) -> Vec<Arc<ConnectionProxy>> {
        match self.registry.upgrade() {
            Some(registry) => registry.peers(&self.path),
            None => Vec::new(),
        }
    }

    /// User properties shared across the cluster, when clustered.
    pub fn distributed_user_properties(&self) -> Option<UserProperties> {
        match &self.kind {
            Kind::Remote { cluster } => Some(cluster.distributed_user_properties(&self.session)),
            Kind::Local { .. } => self
                .registry
                .upgrade()
                .and_then(|registry| registry.cluster().cloned())
                .map(|cluster| cluster.distributed_user_properties(&self.session)),
        }
    }
}

impl fmt::Debug for ConnectionProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionProxy")
            .field("path", &self.path)
            .field("session", &self.session)
            .field("remote", &self.is_remote())
            .field("state", &self.state())
            .finish()
    }
}
