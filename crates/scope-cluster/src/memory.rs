//! An in-process cluster hub.
//!
//! Every node joins the same hub. The hub holds the session directory, the
//! owner of each session and the distributed user properties; messages to a
//! session are handed to the owning node's listener when the send future is
//! polled.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cluster::{ClusterContext, ClusterMessage, ClusterSessionListener, SendFuture, SessionId, UserProperties};
use crate::error::ClusterError;

#[derive(Default)]
struct Hub {
    directory: RwLock<Directory>,
    nodes: RwLock<HashMap<String, Weak<MemoryClusterNode>>>,
    properties: DashMap<SessionId, UserProperties>,
}

/// Session listings and owners, kept under one lock so a listed session
/// always has an owner.
#[derive(Default)]
struct Directory {
    /// path -> session -> owning node
    paths: HashMap<String, BTreeMap<SessionId, String>>,
    owners: HashMap<SessionId, String>,
}

impl Directory {
    fn insert(&mut self, path: &str, session: &SessionId, node: &str) {
        self.paths
            .entry(path.to_string())
            .or_default()
            .insert(session.clone(), node.to_string());
        self.owners.insert(session.clone(), node.to_string());
    }

    fn remove(&mut self, path: &str, session: &SessionId) -> bool {
        let removed = self
            .paths
            .get_mut(path)
            .and_then(|sessions| sessions.remove(session))
            .is_some();
        if self.paths.get(path).is_some_and(BTreeMap::is_empty) {
            self.paths.remove(path);
        }
        if removed {
            self.owners.remove(session);
        }
        removed
    }

    /// Drop every session owned by `node`, returning `(path, session)` pairs.
    fn remove_node(&mut self, node: &str) -> Vec<(String, SessionId)> {
        let mut removed = Vec::new();
        for (path, sessions) in self.paths.iter_mut() {
            sessions.retain(|session, owner| {
                if *owner == node {
                    removed.push((path.clone(), session.clone()));
                    false
                } else {
                    true
                }
            });
        }
        self.paths.retain(|_, sessions| !sessions.is_empty());
        self.owners.retain(|_, owner| *owner != node);
        removed
    }
}

/// Handle to a shared in-memory cluster. Clones refer to the same hub.
#[derive(Clone, Default)]
pub struct MemoryCluster {
    hub: Arc<Hub>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node named `node_id`. Rejoining under the same name replaces
    /// the previous node.
    pub fn join(&self, node_id: impl Into<String>) -> Arc<MemoryClusterNode> {
        let node = Arc::new(MemoryClusterNode {
            id: node_id.into(),
            hub: self.hub.clone(),
            listener: RwLock::new(None),
            left: AtomicBool::new(false),
        });
        self.hub.nodes.write().insert(node.id.clone(), Arc::downgrade(&node));
        info!(node = %node.id, "node joined memory cluster");
        node
    }

    /// Names of the nodes currently in the cluster.
    pub fn nodes(&self) -> Vec<String> {
        let nodes = self.hub.nodes.read();
        let mut ids: Vec<String> = nodes
            .iter()
            .filter(|(_, node)| node.strong_count() > 0)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Number of sessions in the directory, across all nodes and paths.
    pub fn session_count(&self) -> usize {
        self.hub.directory.read().owners.len()
    }
}

impl fmt::Debug for MemoryCluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryCluster")
            .field("nodes", &self.nodes())
            .field("sessions", &self.session_count())
            .finish()
    }
}

impl Hub {
    fn listeners_except(&self, node_id: &str) -> Vec<Arc<dyn ClusterSessionListener>> {
        let nodes: Vec<Arc<MemoryClusterNode>> = self
            .nodes
            .read()
            .iter()
            .filter(|(id, _)| id.as_str() != node_id)
            .filter_map(|(_, node)| node.upgrade())
            .collect();
        nodes.iter().filter_map(|node| node.listener()).collect()
    }

    fn deliver(&self, session: &SessionId, message: ClusterMessage) -> Result<(), ClusterError> {
        let owner = self
            .directory
            .read()
            .owners
            .get(session)
            .cloned()
            .ok_or_else(|| ClusterError::UnknownSession(session.clone()))?;

        let node = self
            .nodes
            .read()
            .get(&owner)
            .and_then(Weak::upgrade)
            .filter(|node| !node.has_left())
            .ok_or_else(|| ClusterError::NodeUnavailable(owner.clone()))?;

        let listener = node.listener().ok_or(ClusterError::NodeUnavailable(owner))?;

        let kind = message.kind();
        if listener.on_message(session, message) {
            Ok(())
        } else {
            Err(ClusterError::Delivery {
                session: session.clone(),
                reason: format!("{kind} frame: session is not open on its node"),
            })
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Node
// ─────────────────────────────────────────────────────────────────────────────

/// One node's view of a [`MemoryCluster`].
pub struct MemoryClusterNode {
    id: String,
    hub: Arc<Hub>,
    listener: RwLock<Option<Weak<dyn ClusterSessionListener>>>,
    left: AtomicBool,
}

impl MemoryClusterNode {
    fn listener(&self) -> Option<Arc<dyn ClusterSessionListener>> {
        self.listener.read().as_ref().and_then(Weak::upgrade)
    }

    pub fn has_left(&self) -> bool {
        self.left.load(Ordering::SeqCst)
    }

    /// Leave the cluster: every session owned by this node is removed from
    /// the directory and later sends from this node fail with
    /// [`ClusterError::Closed`].
    pub fn leave(&self) {
        if self.left.swap(true, Ordering::SeqCst) {
            return;
        }

        let removed = self.hub.directory.write().remove_node(&self.id);
        self.hub.nodes.write().remove(&self.id);

        let listeners = self.hub.listeners_except(&self.id);
        for (path, session) in &removed {
            self.hub.properties.remove(session);
            for listener in &listeners {
                listener.on_remote_close(path, session);
            }
        }
        info!(node = %self.id, sessions = removed.len(), "node left memory cluster");
    }
}

impl ClusterContext for MemoryClusterNode {
    fn node_id(&self) -> &str {
        &self.id
    }

    fn create_session_id(&self) -> SessionId {
        SessionId::new(format!("{}-{}", self.id, Uuid::new_v4().simple()))
    }

    fn register_session(&self, path: &str, session: &SessionId) {
        if self.has_left() {
            warn!(node = %self.id, %session, "register on a node that left the cluster");
            return;
        }
        self.hub.directory.write().insert(path, session, &self.id);
        debug!(node = %self.id, path, %session, "cluster session registered");

        for listener in self.hub.listeners_except(&self.id) {
            listener.on_remote_open(path, session);
        }
    }

    fn remove_session(&self, path: &str, session: &SessionId) {
        if !self.hub.directory.write().remove(path, session) {
            return;
        }
        self.hub.properties.remove(session);
        debug!(node = %self.id, path, %session, "cluster session removed");

        for listener in self.hub.listeners_except(&self.id) {
            listener.on_remote_close(path, session);
        }
    }

    fn remote_session_ids(&self, path: &str) -> Vec<SessionId> {
        let directory = self.hub.directory.read();
        directory
            .paths
            .get(path)
            .map(|sessions| {
                sessions
                    .iter()
                    .filter(|(_, owner)| **owner != self.id)
                    .map(|(session, _)| session.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn distributed_user_properties(&self, session: &SessionId) -> UserProperties {
        self.hub.properties.entry(session.clone()).or_default().clone()
    }

    fn send(&self, session: &SessionId, message: ClusterMessage) -> SendFuture {
        let hub = self.hub.clone();
        let session = session.clone();
        let left = self.has_left();
        Box::pin(async move {
            if left {
                return Err(ClusterError::Closed);
            }
            hub.deliver(&session, message)
        })
    }

    fn set_session_listener(&self, listener: Weak<dyn ClusterSessionListener>) {
        *self.listener.write() = Some(listener);
    }
}

impl fmt::Debug for MemoryClusterNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryClusterNode")
            .field("id", &self.id)
            .field("left", &self.has_left())
            .finish()
    }
}
