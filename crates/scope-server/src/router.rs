//! Router assembly: websocket routes, the health route and the request
//! tracking layer.

use std::sync::Arc;

use axum::Router;
use axum::extract::{OriginalUri, State, WebSocketUpgrade};
use axum::http::{Extensions, StatusCode};
use axum::middleware;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use scope_core::ContainerCallContext;
use scope_transport::{Endpoint, EndpointProxy, PingObserver, serve_socket};
use serde_json::json;
use tracing::warn;

use crate::context::ServerContext;
use crate::http::track_request;

struct WsState<E> {
    server: Arc<ServerContext>,
    endpoint: Arc<EndpointProxy<E>>,
}

impl<E> Clone for WsState<E> {
    fn clone(&self) -> Self {
        Self {
            server: self.server.clone(),
            endpoint: self.endpoint.clone(),
        }
    }
}

/// A router serving `endpoint` on `route`. The peer set of a connection is
/// keyed by the request path, so a parameterised route such as
/// `/rooms/{room}` gives every room its own peers.
pub fn websocket_route<E: Endpoint>(
    server: &Arc<ServerContext>,
    route: &str,
    endpoint: Arc<E>,
    observer: Option<Arc<dyn PingObserver>>,
) -> Router {
    let state = WsState {
        server: server.clone(),
        endpoint: server.endpoint(endpoint, observer),
    };
    Router::new().route(route, get(ws_upgrade::<E>)).with_state(state)
}

/// The application: `routes` plus `/health`, every request tracked.
pub fn app(server: Arc<ServerContext>, routes: Router) -> Router {
    let health = Router::new().route("/health", get(health)).with_state(server.clone());
    routes
        .merge(health)
        .layer(middleware::from_fn_with_state(server, track_request))
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

async fn ws_upgrade<E: Endpoint>(
    ws: WebSocketUpgrade,
    State(state): State<WsState<E>>,
    OriginalUri(uri): OriginalUri,
    extensions: Extensions,
) -> Response {
    if let Some(max) = state.server.config().max_connections {
        let current = state.server.registry().connection_count();
        if current >= max {
            warn!("Connection rejected: max connections reached ({max})");
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    }

    let session = extensions
        .get::<Arc<ContainerCallContext>>()
        .and_then(|call| call.session().cloned());
    let path = uri.path().to_string();
    let endpoint = state.endpoint.clone();

    ws.on_upgrade(move |socket| serve_socket(socket, path, session, endpoint))
        .into_response()
}

async fn health(State(server): State<Arc<ServerContext>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "node": server.node_id(),
        "connections": server.registry().connection_count(),
        "sessions": server.sessions().len(),
        "probed": server.pinger().connection_count(),
    }))
}
