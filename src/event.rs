use crate::error::Error;
use crate::message::Message;
use crate::network::IoSession;
use crate::reactor::Selectable;
use std::sync::Arc;

pub enum EventKind {
    /// A listener produced a socket; the source still has to be registered on
    /// an I/O loop.
    Accepted(Box<dyn Selectable>),
    Connected,
    Disconnected,
    Received,
    Sent(Message),
    Idle,
    Exception(Error),
}

/// One unit of dispatch for a session.
pub struct Event {
    pub session: Arc<IoSession>,
    pub kind: EventKind,
}

impl Event {
    pub fn new(session: Arc<IoSession>, kind: EventKind) -> Self {
        Self { session, kind }
    }

    pub fn name(&self) -> &'static str {
        match self.kind {
            EventKind::Accepted(_) => "accepted",
            EventKind::Connected => "connected",
            EventKind::Disconnected => "disconnected",
            EventKind::Received => "received",
            EventKind::Sent(_) => "sent",
            EventKind::Idle => "idle",
            EventKind::Exception(_) => "exception",
        }
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("session", &self.session.id())
            .field("kind", &self.name())
            .finish()
    }
}
