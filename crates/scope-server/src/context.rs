//! ServerContext — the process-wide configuration object.
//!
//! Owns the trackers (through the [`ScopeModule`]), the connection
//! registry, the pinger and the session store. Built once in `main` and
//! shared by the router, the middleware and every endpoint.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use scope_cluster::ClusterContext;
use scope_core::ScopeModule;
use scope_transport::{CloseReason, ConnectionRegistry, Endpoint, EndpointProxy, PingObserver, Pinger};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::session::SessionStore;

/// How long shutdown waits for an in-flight probe round.
const PINGER_TERMINATION_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ServerContext {
    config: ServerConfig,
    scopes: ScopeModule,
    registry: Arc<ConnectionRegistry>,
    pinger: Pinger,
    sessions: Arc<SessionStore>,
    cleanup: Mutex<Option<JoinHandle<()>>>,
}

impl ServerContext {
    /// Build the server context and start the pinger and the session sweep
    /// on the current runtime. `cluster` makes this node one member of a
    /// cluster.
    pub fn start(config: ServerConfig, cluster: Option<Arc<dyn ClusterContext>>) -> Arc<Self> {
        let registry = ConnectionRegistry::new(cluster);
        let pinger = Pinger::start(config.pinger.clone());
        let sessions = Arc::new(SessionStore::new(config.session.clone()));
        let cleanup = sessions.spawn_cleanup();

        let node = registry.cluster().map(|cluster| cluster.node_id().to_string());
        info!(
            node = node.as_deref().unwrap_or("standalone"),
            max_idle_secs = config.session.max_idle_secs,
            "server context started"
        );

        Arc::new(Self {
            config,
            scopes: ScopeModule::new(),
            registry,
            pinger,
            sessions,
            cleanup: Mutex::new(Some(cleanup)),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn scopes(&self) -> &ScopeModule {
        &self.scopes
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn pinger(&self) -> &Pinger {
        &self.pinger
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// Cluster node id, if this node belongs to a cluster.
    pub fn node_id(&self) -> Option<&str> {
        self.registry.cluster().map(|cluster| cluster.node_id())
    }

    /// Drive `endpoint` with this server's scopes, registry and pinger.
    pub fn endpoint<E: Endpoint>(
        &self,
        endpoint: Arc<E>,
        observer: Option<Arc<dyn PingObserver>>,
    ) -> Arc<EndpointProxy<E>> {
        Arc::new(
            EndpointProxy::new(endpoint, self.scopes.clone(), self.registry.clone())
                .with_pinger(self.pinger.clone(), observer),
        )
    }

    /// Stop probing, ask every local connection to go away and close all
    /// sessions.
    pub async fn shutdown(&self) {
        let unprobed = self.pinger.stop();
        debug!(count = unprobed.len(), "pinger registrations dropped");
        if !self.pinger.await_termination(PINGER_TERMINATION_TIMEOUT).await {
            warn!("pinger did not terminate in time");
        }
        if let Some(cleanup) = self.cleanup.lock().take() {
            cleanup.abort();
        }

        for path in self.registry.paths() {
            for proxy in self.registry.open_connections(&path) {
                if let Err(e) = proxy.close(CloseReason::going_away()).await {
                    debug!(session = %proxy.session_id(), "close on shutdown failed: {e}");
                }
            }
        }

        let closed = self.sessions.close_all();
        info!(sessions = closed, "server context shut down");
    }
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContext")
            .field("node", &self.node_id())
            .field("registry", &self.registry)
            .field("pinger", &self.pinger)
            .field("sessions", &self.sessions)
            .finish()
    }
}
