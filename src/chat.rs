//! Demo endpoint: every room path is a chat room, every message is
//! broadcast to the room's peers, local and remote.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Context as _;
use scope_core::{Key, ScopeModule, ScopedProvider};
use scope_transport::{CloseReason, ConnectionProxy, ConnectionRegistry, Endpoint, Message};
use tracing::{debug, info};

/// Name a connection speaks under; one per connection.
struct Member {
    name: String,
}

/// Messages a session has sent, across all of its connections.
struct SessionStats {
    sent: AtomicUsize,
}

pub struct ChatEndpoint {
    registry: Arc<ConnectionRegistry>,
    member: ScopedProvider<Member>,
    stats: ScopedProvider<SessionStats>,
}

impl ChatEndpoint {
    pub fn new(scopes: &ScopeModule, registry: Arc<ConnectionRegistry>) -> Arc<Self> {
        let guests = AtomicUsize::new(0);
        let member = scopes.connection().provider(Key::of::<Member>(), move || Member {
            name: format!("guest-{}", guests.fetch_add(1, Ordering::SeqCst) + 1),
        });
        let stats = scopes.session().provider(Key::of::<SessionStats>(), || SessionStats {
            sent: AtomicUsize::new(0),
        });
        Arc::new(Self {
            registry,
            member,
            stats,
        })
    }
}

impl Endpoint for ChatEndpoint {
    async fn on_open(&self, session: &Arc<ConnectionProxy>) -> anyhow::Result<()> {
        let member = self.member.get()?;
        session
            .send_text(format!("welcome, {}", member.name))
            .await
            .context("welcome not delivered")?;
        let delivered = self
            .registry
            .broadcast_text(session.path(), &format!("* {} joined", member.name))
            .await;
        info!(room = session.path(), member = %member.name, delivered, "member joined");
        Ok(())
    }

    async fn on_message(&self, session: &Arc<ConnectionProxy>, message: Message) -> anyhow::Result<()> {
        let Some(text) = message.as_text() else {
            debug!(session = %session.session_id(), "non-text frame ignored");
            return Ok(());
        };
        let member = self.member.get()?;
        if let Ok(stats) = self.stats.get() {
            stats.sent.fetch_add(1, Ordering::Relaxed);
        }
        let line = format!("{}: {text}", member.name);
        self.registry.broadcast_text(session.path(), &line).await;
        Ok(())
    }

    async fn on_close(&self, session: &Arc<ConnectionProxy>, reason: &CloseReason) {
        let Ok(member) = self.member.get() else {
            return;
        };
        let sent = self.stats.get().map(|stats| stats.sent.load(Ordering::Relaxed)).unwrap_or(0);
        info!(room = session.path(), member = %member.name, sent, %reason, "member left");
        self.registry
            .broadcast_text(session.path(), &format!("* {} left", member.name))
            .await;
    }
}
