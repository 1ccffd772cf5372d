//! Endpoint and EndpointProxy — the websocket lifecycle with scoped
//! contexts installed.
//!
//! Each callback runs inside a fresh container-call context, nested in the
//! connection context and the HTTP session the handshake belonged to. The
//! call context is disposed when the callback returns.

use std::future::Future;
use std::sync::Arc;

use scope_core::{
    ContainerCallContext, Context, HttpSessionContext, ScopeModule, WebsocketConnectionContext, WebsocketEvent,
};
use futures_util::FutureExt;
use tracing::{debug, info, warn};

use crate::connection::{CloseReason, ConnectionState, Message, RawConnection};
use crate::error::TransportError;
use crate::pinger::{PingObserver, Pinger};
use crate::proxy::ConnectionProxy;
use crate::registry::ConnectionRegistry;

/// Application callbacks for one websocket path.
///
/// Callbacks that fail are reported to [`on_error`](Endpoint::on_error);
/// they never tear down the connection by themselves.
pub trait Endpoint: Send + Sync + 'static {
    /// The connection is registered and open.
    fn on_open(&self, _session: &Arc<ConnectionProxy>) -> impl Future<Output = anyhow::Result<()>> + Send {
        async { Ok(()) }
    }

    /// A data frame arrived. Pongs answering the pinger's probes are not
    /// delivered.
    fn on_message(
        &self,
        session: &Arc<ConnectionProxy>,
        message: Message,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// A callback failed or the transport reported an error.
    fn on_error(&self, session: &Arc<ConnectionProxy>, error: &anyhow::Error) -> impl Future<Output = ()> + Send {
        warn!(session = %session.session_id(), "endpoint error: {error:#}");
        async {}
    }

    /// The connection is closing.
    fn on_close(&self, _session: &Arc<ConnectionProxy>, _reason: &CloseReason) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// Drives an [`Endpoint`] through the connection lifecycle.
pub struct EndpointProxy<E> {
    endpoint: Arc<E>,
    scopes: ScopeModule,
    registry: Arc<ConnectionRegistry>,
    pinger: Option<Pinger>,
    observer: Option<Arc<dyn PingObserver>>,
}

impl<E: Endpoint> EndpointProxy<E> {
    pub fn new(endpoint: Arc<E>, scopes: ScopeModule, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            endpoint,
            scopes,
            registry,
            pinger: None,
            observer: None,
        }
    }

    /// Probe connections of this endpoint with `pinger`.
    pub fn with_pinger(mut self, pinger: Pinger, observer: Option<Arc<dyn PingObserver>>) -> Self {
        self.pinger = Some(pinger);
        self.observer = observer;
        self
    }

    pub fn endpoint(&self) -> &Arc<E> {
        &self.endpoint
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Open `connection`: create its context, register it with the
    /// registry, the cluster and the pinger, then run `on_open`.
    pub async fn open(
        &self,
        connection: Arc<dyn RawConnection>,
        session: Option<Arc<HttpSessionContext>>,
    ) -> Result<Arc<ConnectionProxy>, TransportError> {
        let context = Arc::new(WebsocketConnectionContext::new(connection.path(), session));
        let proxy = self.registry.register(connection.clone(), context);

        if let Some(pinger) = &self.pinger {
            pinger.add_connection(connection.clone(), self.observer.clone());
        }
        proxy.transition(ConnectionState::Open)?;
        info!(connection = %connection.id(), path = connection.path(), "websocket connection opened");

        self.dispatch(&proxy, WebsocketEvent::Open, || self.endpoint.on_open(&proxy))
            .await?;
        Ok(proxy)
    }

    /// Deliver one inbound frame.
    pub async fn message(&self, proxy: &Arc<ConnectionProxy>, message: Message) -> Result<(), TransportError> {
        if let (Message::Pong(payload), Some(pinger), Some(id)) = (&message, &self.pinger, proxy.connection_id()) {
            if pinger.on_pong(id, payload) {
                return Ok(());
            }
        }
        self.dispatch(proxy, WebsocketEvent::Message, || self.endpoint.on_message(proxy, message))
            .await
    }

    /// Report a transport error to the endpoint.
    pub async fn error(&self, proxy: &Arc<ConnectionProxy>, error: anyhow::Error) -> Result<(), TransportError> {
        self.report(proxy, error).await
    }

    /// Close `proxy`: run `on_close`, stop probing it, withdraw it from the
    /// registry and the cluster, and dispose of its connection context.
    /// Closing an already closing or closed connection does nothing.
    pub async fn close(&self, proxy: &Arc<ConnectionProxy>, reason: CloseReason) -> Result<(), TransportError> {
        if !proxy.begin_close() {
            debug!(session = %proxy.session_id(), "close ignored, connection not open locally");
            return Ok(());
        }

        let on_close = || self.endpoint.on_close(proxy, &reason).map(|()| Ok(()));
        let dispatched = self.dispatch(proxy, WebsocketEvent::Close, on_close).await;

        if let Some(id) = proxy.connection_id() {
            if let Some(pinger) = &self.pinger {
                pinger.remove_connection(id);
            }
            self.registry.deregister(id);
        }
        if let Some(context) = proxy.context() {
            context.close();
        }
        proxy.transition(ConnectionState::Closed)?;
        info!(session = %proxy.session_id(), %reason, "websocket connection closed");
        dispatched
    }

    // ── Internal ──────────────────────────────────────────────────────────

    fn call_for(
        &self,
        proxy: &Arc<ConnectionProxy>,
        event: WebsocketEvent,
    ) -> Result<Arc<ContainerCallContext>, TransportError> {
        let connection = proxy
            .context()
            .cloned()
            .ok_or_else(|| TransportError::Send(format!("{event} on a remote session")))?;
        Ok(Arc::new(ContainerCallContext::websocket_event(event, connection)))
    }

    /// Run one callback in a fresh call context. `callback` builds the
    /// endpoint's future with the contexts already installed, so the
    /// synchronous part of a callback sees them too.
    async fn dispatch<C, F>(
        &self,
        proxy: &Arc<ConnectionProxy>,
        event: WebsocketEvent,
        callback: C,
    ) -> Result<(), TransportError>
    where
        C: FnOnce() -> F,
        F: Future<Output = anyhow::Result<()>>,
    {
        let call = self.call_for(proxy, event)?;
        let contexts = self.scopes.contexts_for(&call);
        let future = contexts.run(callback);
        let result = contexts.bind(future).await;
        call.close();

        if let Err(error) = result {
            self.report(proxy, error).await?;
        }
        Ok(())
    }

    async fn report(&self, proxy: &Arc<ConnectionProxy>, error: anyhow::Error) -> Result<(), TransportError> {
        let call = self.call_for(proxy, WebsocketEvent::Error)?;
        let contexts = self.scopes.contexts_for(&call);
        let future = contexts.run(|| self.endpoint.on_error(proxy, &error));
        contexts.bind(future).await;
        call.close();
        Ok(())
    }
}
