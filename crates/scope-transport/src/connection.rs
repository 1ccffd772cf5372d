//! The container-side connection contract and the connection state machine.

use std::fmt;

use bytes::Bytes;
use scope_core::Attributes;
use uuid::Uuid;

use crate::error::TransportError;

/// Identity of one raw connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A websocket data or control frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
}

impl Message {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }
}

/// Close code and reason sent in a close frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
}

impl CloseReason {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;

    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn normal() -> Self {
        Self::new(Self::NORMAL, "")
    }

    pub fn going_away() -> Self {
        Self::new(Self::GOING_AWAY, "")
    }

    pub fn protocol_error(reason: impl Into<String>) -> Self {
        Self::new(Self::PROTOCOL_ERROR, reason)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{} ({})", self.code, self.reason)
        }
    }
}

/// One socket as provided by the container.
///
/// `send` and `close` only enqueue; the container writes frames in order on
/// its own task.
pub trait RawConnection: Send + Sync {
    fn id(&self) -> ConnectionId;

    /// Endpoint path the socket was opened on.
    fn path(&self) -> &str;

    fn is_open(&self) -> bool;

    fn send(&self, message: Message) -> Result<(), TransportError>;

    fn close(&self, reason: CloseReason) -> Result<(), TransportError>;

    /// Per-connection user properties.
    fn attributes(&self) -> &Attributes;
}

// ─────────────────────────────────────────────────────────────────────────────
// State machine
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle of a connection as seen by its endpoint.
///
/// `Opening -> Open -> Closing -> Closed`; a connection that fails while
/// opening goes straight to `Closing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Opening,
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn can_transition_to(self, to: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, to),
            (Opening, Open) | (Opening, Closing) | (Open, Closing) | (Closing, Closed)
        )
    }

    /// The state after moving to `to`, or an error if the move is not allowed.
    pub fn transition(self, to: ConnectionState) -> Result<ConnectionState, TransportError> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(TransportError::InvalidTransition { from: self, to })
        }
    }

    /// Whether frames may still be sent.
    pub fn accepts_frames(self) -> bool {
        matches!(self, Self::Opening | Self::Open)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_transitions() {
        let state = ConnectionState::Opening;
        let state = state.transition(ConnectionState::Open).unwrap();
        let state = state.transition(ConnectionState::Closing).unwrap();
        let state = state.transition(ConnectionState::Closed).unwrap();
        assert_eq!(state, ConnectionState::Closed);
    }

    #[test]
    fn rejects_skipped_and_backward_transitions() {
        assert!(ConnectionState::Opening.transition(ConnectionState::Closed).is_err());
        assert!(ConnectionState::Open.transition(ConnectionState::Opening).is_err());
        assert!(ConnectionState::Closed.transition(ConnectionState::Open).is_err());
        assert_eq!(
            ConnectionState::Closing.transition(ConnectionState::Closing),
            Err(TransportError::InvalidTransition {
                from: ConnectionState::Closing,
                to: ConnectionState::Closing
            })
        );
    }

    #[test]
    fn close_reason_display() {
        assert_eq!(CloseReason::normal().to_string(), "1000");
        assert_eq!(
            CloseReason::protocol_error("too many failed pings").to_string(),
            "1002 (too many failed pings)"
        );
    }
}
