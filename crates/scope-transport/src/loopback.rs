//! An in-process [`RawConnection`] that records what is written to it.
//! Used to drive endpoints without a socket.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use scope_core::Attributes;

use crate::connection::{CloseReason, ConnectionId, Message, RawConnection};
use crate::error::TransportError;

pub struct LoopbackConnection {
    id: ConnectionId,
    path: String,
    attributes: Attributes,
    open: AtomicBool,
    failing: AtomicBool,
    sent: Mutex<Vec<Message>>,
    closes: Mutex<Vec<CloseReason>>,
}

impl LoopbackConnection {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            id: ConnectionId::new(),
            path: path.into(),
            attributes: Attributes::new(),
            open: AtomicBool::new(true),
            failing: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            closes: Mutex::new(Vec::new()),
        }
    }

    /// Make every subsequent send fail, as a broken socket would.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Frames written so far.
    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().clone()
    }

    /// Text frames written so far.
    pub fn sent_text(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter_map(|m| m.as_text().map(str::to_string))
            .collect()
    }

    /// Every close requested on this connection, including repeats.
    pub fn closes(&self) -> Vec<CloseReason> {
        self.closes.lock().clone()
    }
}

impl RawConnection for LoopbackConnection {
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
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::Send("loopback send failure".into()));
        }
        self.sent.lock().push(message);
        Ok(())
    }

    fn close(&self, reason: CloseReason) -> Result<(), TransportError> {
        self.closes.lock().push(reason);
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn attributes(&self) -> &Attributes {
        &self.attributes
    }
}
