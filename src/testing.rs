//! Helpers shared by unit tests: a small runtime, an in-memory transport and a
//! handler that records every callback.

use crate::config::RuntimeConfig;
use crate::error::Error;
use crate::message::Message;
use crate::network::context::{ConnectionConfig, ConnectionConfigBuilder};
use crate::network::tls::Role;
use crate::network::transport::Transport;
use crate::network::{IoHandler, IoSession};
use crate::reactor::Runtime;
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Shuts the runtime down when the test ends.
pub(crate) struct RuntimeGuard(pub Arc<Runtime>);

impl Drop for RuntimeGuard {
    fn drop(&mut self) {
        self.0.shutdown();
    }
}

pub(crate) fn runtime() -> RuntimeGuard {
    let config = RuntimeConfig {
        accept_threads: 1,
        io_threads: 1,
        worker_threads: 2,
        worker_queue: 64,
        poll_interval_ms: 20,
    };
    RuntimeGuard(Runtime::new(&config).expect("runtime"))
}

/// Records writes instead of touching a socket.
#[derive(Clone, Default)]
pub(crate) struct MemoryTransport {
    written: Arc<Mutex<Vec<u8>>>,
    writes: Arc<Mutex<Vec<usize>>>,
    closed: Arc<AtomicBool>,
    datagram: Arc<AtomicBool>,
}

impl MemoryTransport {
    pub(crate) fn written(&self) -> Vec<u8> {
        self.written.lock().clone()
    }

    /// Size of every write call, in order.
    pub(crate) fn writes(&self) -> Vec<usize> {
        self.writes.lock().clone()
    }

    pub(crate) fn set_datagram(&self, datagram: bool) {
        self.datagram.store(datagram, Ordering::Release);
    }
}

impl Transport for MemoryTransport {
    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        if !self.is_open() {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        }
        self.written.lock().extend_from_slice(buf);
        self.writes.lock().push(buf.len());
        Ok(buf.len())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn is_datagram(&self) -> bool {
        self.datagram.load(Ordering::Acquire)
    }
}

/// A session not bound to any loop, so events run on the test thread.
pub(crate) fn memory_session(
    configure: impl FnOnce(ConnectionConfigBuilder) -> ConnectionConfigBuilder,
) -> (RuntimeGuard, Arc<IoSession>) {
    let (runtime, session, _) = memory_session_with_transport(configure);
    (runtime, session)
}

pub(crate) fn memory_session_with_transport(
    configure: impl FnOnce(ConnectionConfigBuilder) -> ConnectionConfigBuilder,
) -> (RuntimeGuard, Arc<IoSession>, MemoryTransport) {
    let runtime = runtime();
    let config = configure(ConnectionConfig::builder(Arc::clone(&runtime.0)))
        .build()
        .expect("config");
    let transport = MemoryTransport::default();
    let session = config.new_session(Box::new(transport.clone()), Role::Server);
    (runtime, session, transport)
}

type ReceiveHook = Box<dyn Fn(&Arc<IoSession>, &Message) -> Option<Message> + Send + Sync>;

/// Handler that remembers what it saw.
#[derive(Default)]
pub(crate) struct Recorder {
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    idles: AtomicUsize,
    received: Mutex<Vec<Message>>,
    sent: Mutex<Vec<Message>>,
    exceptions: Mutex<Vec<String>>,
    greeting: Option<Message>,
    hook: Option<ReceiveHook>,
}

impl Recorder {
    /// Record, then answer every message with `hook`.
    pub(crate) fn replying(
        hook: impl Fn(&Arc<IoSession>, &Message) -> Option<Message> + Send + Sync + 'static,
    ) -> Self {
        Self {
            hook: Some(Box::new(hook)),
            ..Default::default()
        }
    }

    /// Send `message` from `on_connect`.
    pub(crate) fn greeting(mut self, message: impl Into<Message>) -> Self {
        self.greeting = Some(message.into());
        self
    }

    pub(crate) fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub(crate) fn idles(&self) -> usize {
        self.idles.load(Ordering::SeqCst)
    }

    pub(crate) fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    pub(crate) fn exceptions(&self) -> Vec<String> {
        self.exceptions.lock().clone()
    }

    /// Received messages as text; bytes are decoded lossily.
    pub(crate) fn received_texts(&self) -> Vec<String> {
        self.received
            .lock()
            .iter()
            .map(|message| match message {
                Message::Text(text) => text.clone(),
                Message::Bytes(bytes) => String::from_utf8_lossy(bytes).into_owned(),
                Message::Object(_) => String::from("<object>"),
            })
            .collect()
    }
}

impl IoHandler for Recorder {
    fn on_connect(&self, _session: &Arc<IoSession>) -> Option<Message> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.greeting.clone()
    }

    fn on_disconnect(&self, _session: &Arc<IoSession>) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    fn on_receive(&self, session: &Arc<IoSession>, message: Message) -> Option<Message> {
        self.received.lock().push(message.clone());
        self.hook.as_ref().and_then(|hook| hook(session, &message))
    }

    fn on_sent(&self, _session: &Arc<IoSession>, message: &Message) {
        self.sent.lock().push(message.clone());
    }

    fn on_exception(&self, _session: &Arc<IoSession>, error: &Error) {
        self.exceptions.lock().push(error.to_string());
    }

    fn on_idle(&self, _session: &Arc<IoSession>) {
        self.idles.fetch_add(1, Ordering::SeqCst);
    }
}
