//! Scopeway server — wires the scope module, the connection registry, the
//! pinger and the HTTP session store into one axum application.
//!
//! The [`ServerContext`] is built once at startup; the router, the request
//! tracking middleware and every websocket endpoint share it.

pub mod config;
pub mod context;
pub mod error;
pub mod http;
pub mod router;
pub mod server;
pub mod session;

pub use config::{ServerConfig, SessionConfig};
pub use context::ServerContext;
pub use error::{ScopeRejection, ServerError};
pub use http::{SESSION_COOKIE, session_cookie, track_request};
pub use router::{app, websocket_route};
pub use server::ServerHandle;
pub use session::SessionStore;
