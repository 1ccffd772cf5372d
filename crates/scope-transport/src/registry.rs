//! ConnectionRegistry — the arena of local connections and the peer
//! enumeration over the cluster directory.
//!
//! Uses parking_lot::RwLock for the maps; reads clone what they need and
//! release the lock before calling into proxies, the cluster or the
//! container.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use futures_util::future::join_all;
use parking_lot::RwLock;
use scope_cluster::{ClusterContext, ClusterMessage, ClusterSessionListener, SessionId};
use scope_core::WebsocketConnectionContext;
use tracing::{debug, info, warn};

use crate::connection::{CloseReason, ConnectionId, ConnectionState, Message, RawConnection};
use crate::proxy::ConnectionProxy;

pub struct ConnectionRegistry {
    this: Weak<ConnectionRegistry>,
    cluster: Option<Arc<dyn ClusterContext>>,
    connections: RwLock<HashMap<ConnectionId, Arc<ConnectionProxy>>>,
    /// path -> connections in registration order
    paths: RwLock<HashMap<String, Vec<ConnectionId>>>,
    sessions: RwLock<HashMap<SessionId, ConnectionId>>,
}

impl ConnectionRegistry {
    /// A registry for a single node, or for one node of `cluster`. A
    /// clustered registry receives the cluster's inbound messages for its
    /// local sessions.
    pub fn new(cluster: Option<Arc<dyn ClusterContext>>) -> Arc<Self> {
        let registry = Arc::new_cyclic(|this| Self {
            this: this.clone(),
            cluster,
            connections: RwLock::new(HashMap::new()),
            paths: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
        });

        if let Some(cluster) = &registry.cluster {
            let weak = Arc::downgrade(&registry);
            let listener: Weak<dyn ClusterSessionListener> = weak;
            cluster.set_session_listener(listener);
            info!(node = cluster.node_id(), "connection registry joined cluster");
        }
        registry
    }

    pub fn cluster(&self) -> Option<&Arc<dyn ClusterContext>> {
        self.cluster.as_ref()
    }

    /// Add a local connection in the `Opening` state and publish it to the
    /// cluster directory. Returns the connection's one proxy.
    pub fn register(
        &self,
        connection: Arc<dyn RawConnection>,
        context: Arc<WebsocketConnectionContext>,
    ) -> Arc<ConnectionProxy> {
        let id = connection.id();
        let path = connection.path().to_string();
        let session = match &self.cluster {
            Some(cluster) => cluster.create_session_id(),
            None => SessionId::new(id.to_string()),
        };

        let proxy = Arc::new(ConnectionProxy::local(
            connection,
            context,
            session.clone(),
            self.this.clone(),
        ));

        self.connections.write().insert(id, proxy.clone());
        self.paths.write().entry(path.clone()).or_default().push(id);
        self.sessions.write().insert(session.clone(), id);

        if let Some(cluster) = &self.cluster {
            cluster.register_session(&path, &session);
        }
        debug!(connection = %id, %path, %session, "connection registered");
        proxy
    }

    /// Remove a local connection and withdraw it from the cluster directory.
    pub fn deregister(&self, id: ConnectionId) -> Option<Arc<ConnectionProxy>> {
        let proxy = self.connections.write().remove(&id)?;

        {
            let mut paths = self.paths.write();
            if let Some(ids) = paths.get_mut(proxy.path()) {
                ids.retain(|other| *other != id);
                if ids.is_empty() {
                    paths.remove(proxy.path());
                }
            }
        }
        self.sessions.write().remove(proxy.session_id());

        if let Some(cluster) = &self.cluster {
            cluster.remove_session(proxy.path(), proxy.session_id());
        }
        debug!(connection = %id, path = proxy.path(), "connection deregistered");
        Some(proxy)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<ConnectionProxy>> {
        self.connections.read().get(&id).cloned()
    }

    /// Local sessions on `path` followed by the sessions other nodes hold
    /// on it. Local entries are the stored proxies; remote entries are
    /// fresh proxies on every call.
    pub fn peers(&self, path: &str) -> Vec<Arc<ConnectionProxy>> {
        let mut peers = self.local_connections(path);
        if let Some(cluster) = &self.cluster {
            peers.extend(cluster.remote_session_ids(path).into_iter().map(|session| {
                Arc::new(ConnectionProxy::remote(
                    path,
                    session,
                    cluster.clone(),
                    self.this.clone(),
                ))
            }));
        }
        peers
    }

    /// Local connections on `path` in the `Open` state.
    pub fn open_connections(&self, path: &str) -> Vec<Arc<ConnectionProxy>> {
        self.local_connections(path)
            .into_iter()
            .filter(|proxy| proxy.state() == ConnectionState::Open)
            .collect()
    }

    /// Number of local connections on every path.
    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Paths with at least one local connection.
    pub fn paths(&self) -> Vec<String> {
        self.paths.read().keys().cloned().collect()
    }

    /// Send `text` to every peer on `path`. Failures are logged and skipped.
    /// Returns the number of peers that accepted the frame.
    pub async fn broadcast_text(&self, path: &str, text: &str) -> usize {
        let peers = self.peers(path);
        let sends = peers.iter().map(|peer| peer.send_text(text));
        let results = join_all(sends).await;

        let mut delivered = 0;
        for (peer, result) in peers.iter().zip(results) {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => warn!(session = %peer.session_id(), remote = peer.is_remote(), "broadcast send failed: {e}"),
            }
        }
        delivered
    }

    fn local_connections(&self, path: &str) -> Vec<Arc<ConnectionProxy>> {
        let ids = self.paths.read().get(path).cloned().unwrap_or_default();
        let connections = self.connections.read();
        ids.iter().filter_map(|id| connections.get(id).cloned()).collect()
    }
}

impl ClusterSessionListener for ConnectionRegistry {
    fn on_remote_open(&self, path: &str, session: &SessionId) {
        debug!(path, %session, "remote session opened");
    }

    fn on_remote_close(&self, path: &str, session: &SessionId) {
        debug!(path, %session, "remote session closed");
    }

    fn on_message(&self, session: &SessionId, message: ClusterMessage) -> bool {
        let Some(id) = self.sessions.read().get(session).copied() else {
            return false;
        };
        let Some(proxy) = self.get(id) else {
            return false;
        };
        let Some(connection) = proxy.raw() else {
            return false;
        };

        let result = match message {
            ClusterMessage::Text(text) => connection.send(Message::Text(text)),
            ClusterMessage::Binary(data) => connection.send(Message::Binary(data)),
            ClusterMessage::Ping(payload) => connection.send(Message::Ping(payload)),
            ClusterMessage::Pong(payload) => connection.send(Message::Pong(payload)),
            ClusterMessage::Close { code, reason } => {
                connection.close(CloseReason::new(code, reason))
            }
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(connection = %id, "cluster delivery failed: {e}");
                false
            }
        }
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.connection_count())
            .field("clustered", &self.cluster.is_some())
            .finish()
    }
}
