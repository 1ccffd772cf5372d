//! The bound axum server.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::context::ServerContext;
use crate::error::ServerError;

pub struct ServerHandle {
    server: Arc<ServerContext>,
    /// Shutdown signal
    shutdown_tx: Option<mpsc::Sender<()>>,
    /// Server task handle
    handle: Option<JoinHandle<()>>,
    /// Actual bound address
    local_addr: SocketAddr,
}

impl ServerHandle {
    /// Bind the configured address and serve `app` until [`stop`](Self::stop).
    pub async fn start(server: Arc<ServerContext>, app: Router) -> Result<Self, ServerError> {
        let config = server.config();
        let addr = format!("{}:{}", config.hostname, config.port);
        let parsed: SocketAddr = addr.parse().map_err(|_| ServerError::InvalidAddress(addr.clone()))?;

        let listener = tokio::net::TcpListener::bind(parsed)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| ServerError::Bind { addr, source })?;

        info!("scopeway listening on http://{local_addr}");

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await
                .ok();
        });

        Ok(Self {
            server,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.server
    }

    /// Close every connection and session, then stop accepting requests.
    pub async fn stop(&mut self) {
        self.server.shutdown().await;
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        info!("scopeway server stopped");
    }
}
