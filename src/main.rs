//! Scopeway — scoped-context propagation for HTTP and websocket services.
//!
//! Serves a demo chat endpoint on `/rooms/{room}` with request, connection
//! and session scopes installed around every callback.
//!
//! Usage:
//!   scopeway                                  # Default port 8080
//!   scopeway --port 9000 --verbose            # Custom port, debug logs
//!   scopeway --log-format json                # Structured logs
//!   scopeway --keep-alive                     # Probe without closing dead peers

mod chat;

use std::time::Duration;

use anyhow::Context as _;
use axum::Router;
use clap::{Parser, ValueEnum};
use scope_server::{ServerConfig, ServerContext, ServerHandle, SessionConfig, app, websocket_route};
use scope_transport::{PingerConfig, PingerMode};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::chat::ChatEndpoint;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "scopeway", about = "Scoped contexts for HTTP and websocket services")]
struct Cli {
    /// Port to listen on (0 for OS-assigned)
    #[arg(long, default_value = "8080")]
    port: u16,

    /// Hostname to bind to
    #[arg(long, default_value = "127.0.0.1")]
    hostname: String,

    /// Maximum concurrent websocket connections
    #[arg(long, default_value = "1024")]
    max_connections: usize,

    /// Seconds between liveness probes
    #[arg(long, default_value = "55")]
    ping_interval: u64,

    /// Consecutive failed probes before a connection is closed
    #[arg(long, default_value = "4")]
    ping_failure_limit: u32,

    /// Send probes without counting failures
    #[arg(long)]
    keep_alive: bool,

    /// Seconds an HTTP session may stay idle
    #[arg(long, default_value = "1800")]
    session_idle: i64,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,

    /// Log output format
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

impl Cli {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            hostname: self.hostname.clone(),
            port: self.port,
            max_connections: Some(self.max_connections),
            session: SessionConfig {
                max_idle_secs: self.session_idle,
                ..SessionConfig::default()
            },
            pinger: PingerConfig {
                interval: Duration::from_secs(self.ping_interval.max(1)),
                failure_limit: self.ping_failure_limit.max(1),
                mode: if self.keep_alive {
                    PingerMode::KeepAlive
                } else {
                    PingerMode::ExpectPongs
                },
            },
        }
    }
}

fn init_tracing(cli: &Cli) {
    let default = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    match cli.log_format {
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    let server = ServerContext::start(cli.server_config(), None);
    let chat = ChatEndpoint::new(server.scopes(), server.registry().clone());
    let routes = Router::new().merge(websocket_route(&server, "/rooms/{room}", chat, None));

    let mut handle = ServerHandle::start(server.clone(), app(server, routes))
        .await
        .context("failed to start server")?;
    info!("chat rooms at ws://{}/rooms/<name>", handle.local_addr());

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    info!("shutting down");
    handle.stop().await;
    Ok(())
}
