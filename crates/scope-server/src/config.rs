use std::time::Duration;

use scope_transport::PingerConfig;

use crate::http::SESSION_COOKIE;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Hostname to bind to
    pub hostname: String,
    /// Port to listen on (0 for OS-assigned)
    pub port: u16,
    /// Maximum concurrent websocket connections on this node
    pub max_connections: Option<usize>,
    pub session: SessionConfig,
    pub pinger: PingerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: "127.0.0.1".into(),
            port: 8080,
            max_connections: Some(1024),
            session: SessionConfig::default(),
            pinger: PingerConfig::default(),
        }
    }
}

/// HTTP session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Cookie carrying the session id
    pub cookie_name: String,
    /// Idle time after which a session expires
    pub max_idle_secs: i64,
    /// Time between sweeps for expired sessions
    pub cleanup_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: SESSION_COOKIE.into(),
            max_idle_secs: 30 * 60,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}
