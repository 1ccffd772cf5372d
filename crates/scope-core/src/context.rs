//! Context variants — the units a scope can be bound to.
//!
//! Each context owns one [`InjectionContext`]. A [`ContainerCallContext`]
//! spans a single HTTP request or websocket event and links to the session
//! and connection it runs inside, so a call can resolve objects of all three
//! scopes.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::attributes::Attributes;
use crate::injection::{ContextSnapshot, InjectionContext};

/// Identity of one context instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextId(Uuid);

impl ContextId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A unit of scope: something that owns an injection context.
pub trait Context: Send + Sync + 'static {
    /// Scope name used in diagnostics ("container call", "websocket connection", ...).
    const SCOPE: &'static str;

    fn id(&self) -> ContextId;

    fn injection(&self) -> &InjectionContext;

    /// Dispose of every object produced in this context.
    fn close(&self) -> bool {
        self.injection().close()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Container call
// ─────────────────────────────────────────────────────────────────────────────

/// Websocket lifecycle events that open a container call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebsocketEvent {
    Open,
    Message,
    Error,
    Close,
}

impl fmt::Display for WebsocketEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Open => "open",
            Self::Message => "message",
            Self::Error => "error",
            Self::Close => "close",
        };
        f.write_str(name)
    }
}

/// What a container call is serving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallKind {
    HttpRequest { method: String, path: String },
    WebsocketEvent(WebsocketEvent),
}

/// Context of one container call: an HTTP request or a websocket event.
pub struct ContainerCallContext {
    id: ContextId,
    kind: CallKind,
    injection: InjectionContext,
    session: Option<Arc<HttpSessionContext>>,
    connection: Option<Arc<WebsocketConnectionContext>>,
}

impl ContainerCallContext {
    /// Call context for an HTTP request, optionally inside a session.
    pub fn http_request(
        method: impl Into<String>,
        path: impl Into<String>,
        session: Option<Arc<HttpSessionContext>>,
    ) -> Self {
        let id = ContextId::new();
        Self {
            id,
            kind: CallKind::HttpRequest {
                method: method.into(),
                path: path.into(),
            },
            injection: InjectionContext::new(format!("call {id}")),
            session,
            connection: None,
        }
    }

    /// Call context for one websocket event on `connection`.
    pub fn websocket_event(event: WebsocketEvent, connection: Arc<WebsocketConnectionContext>) -> Self {
        let id = ContextId::new();
        Self {
            id,
            kind: CallKind::WebsocketEvent(event),
            injection: InjectionContext::new(format!("call {id}")),
            session: connection.session().cloned(),
            connection: Some(connection),
        }
    }

    pub fn kind(&self) -> &CallKind {
        &self.kind
    }

    pub fn session(&self) -> Option<&Arc<HttpSessionContext>> {
        self.session.as_ref()
    }

    pub fn connection(&self) -> Option<&Arc<WebsocketConnectionContext>> {
        self.connection.as_ref()
    }
}

impl Context for ContainerCallContext {
    const SCOPE: &'static str = "container call";

    fn id(&self) -> ContextId {
        self.id
    }

    fn injection(&self) -> &InjectionContext {
        &self.injection
    }
}

impl fmt::Debug for ContainerCallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerCallContext")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("session", &self.session.as_ref().map(|s| s.id))
            .field("connection", &self.connection.as_ref().map(|c| c.id))
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Websocket connection
// ─────────────────────────────────────────────────────────────────────────────

/// Context spanning the lifetime of one websocket connection.
pub struct WebsocketConnectionContext {
    id: ContextId,
    path: String,
    injection: InjectionContext,
    session: Option<Arc<HttpSessionContext>>,
}

impl WebsocketConnectionContext {
    pub fn new(path: impl Into<String>, session: Option<Arc<HttpSessionContext>>) -> Self {
        let id = ContextId::new();
        Self {
            id,
            path: path.into(),
            injection: InjectionContext::new(format!("connection {id}")),
            session,
        }
    }

    /// Endpoint path the connection was opened on.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// HTTP session the handshake belonged to, if any.
    pub fn session(&self) -> Option<&Arc<HttpSessionContext>> {
        self.session.as_ref()
    }
}

impl Context for WebsocketConnectionContext {
    const SCOPE: &'static str = "websocket connection";

    fn id(&self) -> ContextId {
        self.id
    }

    fn injection(&self) -> &InjectionContext {
        &self.injection
    }
}

impl fmt::Debug for WebsocketConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebsocketConnectionContext")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("session", &self.session.as_ref().map(|s| s.id))
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP session
// ─────────────────────────────────────────────────────────────────────────────

/// Context spanning one HTTP session.
pub struct HttpSessionContext {
    id: ContextId,
    session_id: String,
    injection: InjectionContext,
    attributes: Attributes,
    created_at: DateTime<Utc>,
    last_accessed: Mutex<DateTime<Utc>>,
}

impl HttpSessionContext {
    pub fn new(session_id: impl Into<String>) -> Self {
        let id = ContextId::new();
        Self::with_injection(id, session_id.into(), InjectionContext::new(format!("session {id}")))
    }

    /// Rebuild a session that migrated from another node.
    pub fn restore(session_id: impl Into<String>, snapshot: ContextSnapshot) -> Self {
        let id = ContextId::new();
        Self::with_injection(
            id,
            session_id.into(),
            InjectionContext::restore(format!("session {id}"), snapshot),
        )
    }

    fn with_injection(id: ContextId, session_id: String, injection: InjectionContext) -> Self {
        let now = Utc::now();
        Self {
            id,
            session_id,
            injection,
            attributes: Attributes::new(),
            created_at: now,
            last_accessed: Mutex::new(now),
        }
    }

    /// Container-visible session identifier (the cookie value).
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_accessed(&self) -> DateTime<Utc> {
        *self.last_accessed.lock()
    }

    /// Record an access to the session.
    pub fn touch(&self) {
        *self.last_accessed.lock() = Utc::now();
    }

    /// Whether the session has been idle longer than `max_idle_secs`.
    pub fn is_expired(&self, max_idle_secs: i64) -> bool {
        Utc::now() > self.last_accessed() + Duration::seconds(max_idle_secs)
    }

    /// Transportable entries of this session, for migration to another node.
    pub fn snapshot(&self) -> ContextSnapshot {
        self.injection.snapshot()
    }

    #[doc(hidden)]
    pub fn set_last_accessed(&self, at: DateTime<Utc>) {
        *self.last_accessed.lock() = at;
    }
}

impl Context for HttpSessionContext {
    const SCOPE: &'static str = "http session";

    fn id(&self) -> ContextId {
        self.id
    }

    fn injection(&self) -> &InjectionContext {
        &self.injection
    }

    fn close(&self) -> bool {
        self.attributes.clear();
        self.injection.close()
    }
}

impl fmt::Debug for HttpSessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpSessionContext")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .field("created_at", &self.created_at)
            .field("last_accessed", &self.last_accessed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn websocket_call_inherits_connection_session() {
        let session = Arc::new(HttpSessionContext::new("abc"));
        let connection = Arc::new(WebsocketConnectionContext::new("/chat", Some(session.clone())));
        let call = ContainerCallContext::websocket_event(WebsocketEvent::Message, connection.clone());

        assert_eq!(call.kind(), &CallKind::WebsocketEvent(WebsocketEvent::Message));
        assert!(Arc::ptr_eq(call.session().unwrap(), &session));
        assert!(Arc::ptr_eq(call.connection().unwrap(), &connection));
    }

    #[test]
    fn session_expiry_follows_last_access() {
        let session = HttpSessionContext::new("abc");
        assert!(!session.is_expired(60));

        session.set_last_accessed(Utc::now() - Duration::seconds(120));
        assert!(session.is_expired(60));

        session.touch();
        assert!(!session.is_expired(60));
    }
}
