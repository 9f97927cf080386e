use crate::error::{Error, Result};
use crate::message::Message;
use crate::network::IoSession;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Application callbacks for session events.
///
/// Every method has a no-op default. A message returned from `on_connect` or
/// `on_receive` is encoded and sent back on the same session.
pub trait IoHandler: Send + Sync {
    fn on_connect(&self, _session: &Arc<IoSession>) -> Option<Message> {
        None
    }

    fn on_disconnect(&self, _session: &Arc<IoSession>) {}

    fn on_receive(&self, _session: &Arc<IoSession>, _message: Message) -> Option<Message> {
        None
    }

    fn on_sent(&self, _session: &Arc<IoSession>, _message: &Message) {}

    fn on_exception(&self, _session: &Arc<IoSession>, _error: &Error) {}

    fn on_idle(&self, _session: &Arc<IoSession>) {}

    /// Lets [`IoSession::sync_read`] find the response queue.
    fn as_synchronous(&self) -> Option<&SynchronousHandler> {
        None
    }
}

/// How often a blocked `take` rechecks the session state.
const TAKE_SLICE: Duration = Duration::from_millis(10);

/// Queues every received message per session for [`IoSession::sync_read`].
#[derive(Default)]
pub struct SynchronousHandler {
    responses: DashMap<u64, (Sender<Message>, Receiver<Message>)>,
}

impl SynchronousHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// The session's queue. A closed session gets no new queue.
    fn receiver(&self, session: &IoSession) -> Option<Receiver<Message>> {
        if let Some(entry) = self.responses.get(&session.id()) {
            return Some(entry.1.clone());
        }
        if session.is_closed() {
            return None;
        }
        Some(
            self.responses
                .entry(session.id())
                .or_insert_with(unbounded)
                .1
                .clone(),
        )
    }

    /// Sessions that still have a queue.
    pub fn tracked_sessions(&self) -> usize {
        self.responses.len()
    }

    /// Messages waiting for `session`.
    pub fn pending(&self, session: &IoSession) -> usize {
        self.responses
            .get(&session.id())
            .map(|entry| entry.1.len())
            .unwrap_or(0)
    }

    /// Next message for `session`, waiting up to `timeout`.
    pub fn take(&self, session: &IoSession, timeout: Duration) -> Result<Message> {
        let Some(receiver) = self.receiver(session) else {
            return Err(Error::ConnectionClosed);
        };
        let deadline = Instant::now() + timeout;

        loop {
            match receiver.recv_timeout(TAKE_SLICE) {
                Ok(message) => return Ok(message),
                Err(RecvTimeoutError::Timeout) => {
                    if session.is_closed() {
                        return receiver.try_recv().map_err(|_| Error::ConnectionClosed);
                    }
                    if Instant::now() >= deadline {
                        return Err(Error::Timeout(timeout));
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return Err(Error::ConnectionClosed),
            }
        }
    }
}

impl IoHandler for SynchronousHandler {
    fn on_receive(&self, session: &Arc<IoSession>, message: Message) -> Option<Message> {
        if session.is_closed() {
            return None;
        }
        let entry = self.responses.entry(session.id()).or_insert_with(unbounded);
        // Both ends live in the map, so the send cannot fail.
        let _ = entry.0.send(message);
        None
    }

    fn on_disconnect(&self, session: &Arc<IoSession>) {
        // A `take` already waiting keeps its own receiver and drains it.
        self.responses.remove(&session.id());
    }

    fn as_synchronous(&self) -> Option<&SynchronousHandler> {
        Some(self)
    }
}
