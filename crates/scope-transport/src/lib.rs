//! Scopeway transport — websocket connections with scoped contexts.
//!
//! - [`RawConnection`]: what the container provides for one socket
//! - [`EndpointProxy`]: drives an application [`Endpoint`] through the
//!   connection lifecycle with the connection, session and call contexts
//!   installed around every callback
//! - [`ConnectionRegistry`]: local connections by id, peer enumeration
//!   across the cluster
//! - [`Pinger`]: liveness probing of open connections
//! - [`ws`]: the axum websocket adapter

pub mod connection;
pub mod endpoint;
pub mod error;
pub mod loopback;
pub mod pinger;
pub mod proxy;
pub mod registry;
pub mod ws;

pub use connection::{CloseReason, ConnectionId, ConnectionState, Message, RawConnection};
pub use endpoint::{Endpoint, EndpointProxy};
pub use error::TransportError;
pub use loopback::LoopbackConnection;
pub use pinger::{PingObserver, Pinger, PingerConfig, PingerMode};
pub use proxy::{ConnectionProxy, ProxySend};
pub use registry::ConnectionRegistry;
pub use ws::{WsConnection, serve_socket};
