//! Axum websocket adapter.
//!
//! [`serve_socket`] runs one upgraded socket: a writer task drains the
//! connection's outbound queue into the socket sink while the reader loop
//! feeds inbound frames to the [`EndpointProxy`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{self, CloseFrame, WebSocket};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use scope_core::{Attributes, HttpSessionContext};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info, warn};

use crate::connection::{CloseReason, ConnectionId, Message, RawConnection};
use crate::endpoint::{Endpoint, EndpointProxy};
use crate::error::TransportError;

/// How long the writer gets to flush a close frame after the endpoint closed.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

enum Outbound {
    Frame(ws::Message),
    Close(CloseReason),
}

/// [`RawConnection`] over an axum websocket.
pub struct WsConnection {
    id: ConnectionId,
    path: String,
    attributes: Attributes,
    outbound: mpsc::UnboundedSender<Outbound>,
    open: AtomicBool,
    close_reason: Mutex<Option<CloseReason>>,
    closed: Notify,
}

impl WsConnection {
    fn new(path: String, outbound: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            id: ConnectionId::new(),
            path,
            attributes: Attributes::new(),
            outbound,
            open: AtomicBool::new(true),
            close_reason: Mutex::new(None),
            closed: Notify::new(),
        }
    }

    fn local_close_reason(&self) -> Option<CloseReason> {
        self.close_reason.lock().clone()
    }
}

impl RawConnection for WsConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn send(&self, message: Message) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ConnectionClosed(self.id));
        }
        let frame = match message {
            Message::Text(text) => ws::Message::Text(text.into()),
            Message::Binary(data) => ws::Message::Binary(data),
            Message::Ping(payload) => ws::Message::Ping(payload),
            Message::Pong(payload) => ws::Message::Pong(payload),
        };
        self.outbound
            .send(Outbound::Frame(frame))
            .map_err(|_| TransportError::ConnectionClosed(self.id))
    }

    fn close(&self, reason: CloseReason) -> Result<(), TransportError> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        *self.close_reason.lock() = Some(reason.clone());
        self.closed.notify_one();
        self.outbound
            .send(Outbound::Close(reason))
            .map_err(|_| TransportError::ConnectionClosed(self.id))
    }

    fn attributes(&self) -> &Attributes {
        &self.attributes
    }
}

/// Run an upgraded socket on `path` until either side closes it.
pub async fn serve_socket<E: Endpoint>(
    socket: WebSocket,
    path: String,
    session: Option<Arc<HttpSessionContext>>,
    endpoint: Arc<EndpointProxy<E>>,
) {
    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let connection = Arc::new(WsConnection::new(path, outbound_tx));
    let id = connection.id();

    let writer = tokio::spawn(async move {
        while let Some(outbound) = outbound_rx.recv().await {
            match outbound {
                Outbound::Frame(frame) => {
                    if let Err(e) = sink.send(frame).await {
                        debug!(connection = %id, "websocket write failed: {e}");
                        break;
                    }
                }
                Outbound::Close(reason) => {
                    let frame = CloseFrame {
                        code: reason.code,
                        reason: reason.reason.into(),
                    };
                    let _ = sink.send(ws::Message::Close(Some(frame))).await;
                    break;
                }
            }
        }
    });

    let raw: Arc<dyn RawConnection> = connection.clone();
    let proxy = match endpoint.open(raw, session).await {
        Ok(proxy) => proxy,
        Err(e) => {
            warn!(connection = %id, "websocket open failed: {e}");
            let _ = connection.close(CloseReason::new(1011, "open failed"));
            let _ = tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await;
            return;
        }
    };

    let reason = loop {
        tokio::select! {
            inbound = stream.next() => {
                let message = match inbound {
                    Some(Ok(ws::Message::Text(text))) => Message::Text(text.as_str().to_owned()),
                    Some(Ok(ws::Message::Binary(data))) => Message::Binary(data),
                    // The socket answers pings itself
                    Some(Ok(ws::Message::Ping(_))) => continue,
                    Some(Ok(ws::Message::Pong(payload))) => Message::Pong(payload),
                    Some(Ok(ws::Message::Close(frame))) => {
                        break frame
                            .map(|f| CloseReason::new(f.code, f.reason.as_str()))
                            .unwrap_or_else(CloseReason::normal);
                    }
                    Some(Err(e)) => {
                        let _ = endpoint.error(&proxy, anyhow::Error::new(e)).await;
                        break CloseReason::protocol_error("websocket error");
                    }
                    None => break CloseReason::going_away(),
                };
                if let Err(e) = endpoint.message(&proxy, message).await {
                    warn!(connection = %id, "message dispatch failed: {e}");
                }
            }
            _ = connection.closed.notified() => {
                break connection.local_close_reason().unwrap_or_else(CloseReason::normal);
            }
        }
    };

    if let Err(e) = endpoint.close(&proxy, reason.clone()).await {
        warn!(connection = %id, "websocket close failed: {e}");
    }
    let _ = connection.close(reason);
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        debug!(connection = %id, "websocket writer did not drain in time");
    }
    info!(connection = %id, "websocket session ended");
}
