//! Per-connection session.
//!
//! A session owns the inbound [`ByteChannel`], the lifecycle state and the
//! two permits that serialize receive processing and writes. It is shared as
//! `Arc<IoSession>` between its socket source, its event loop, the worker
//! pool and the idle timer.

use crate::dispatcher;
use crate::error::{Error, Result};
use crate::io::ByteChannel;
use crate::message::Message;
use crate::network::context::ConnectionConfig;
use crate::network::handler::IoHandler;
use crate::network::tls::{Role, TlsHandshake};
use crate::network::transport::Transport;
use crate::reactor::{LoopHandle, TimerHandle, PRIORITY_CONTROL, PRIORITY_EVENT};
use dashmap::DashMap;
use mio::Token;
use parking_lot::Mutex;
use std::any::Any;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const INIT: u8 = 0;
const CONNECTED: u8 = 1;
const ESTABLISHED: u8 = 2;
const CLOSED: u8 = 3;

/// How long a blocked writer sleeps before retrying.
const RETRY_PAUSE: Duration = Duration::from_millis(1);

/// Observable session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    /// Socket is up; TLS may still be handshaking.
    Connected,
    Idle,
    Receiving,
    Sending,
    Closed,
}

struct Binding {
    handle: LoopHandle,
    token: Option<Token>,
}

pub struct IoSession {
    id: u64,
    config: Arc<ConnectionConfig>,
    role: Role,
    channel: ByteChannel,
    transport: Box<dyn Transport>,
    tls: OnceLock<TlsHandshake>,
    lifecycle: AtomicU8,
    receiving: AtomicBool,
    sending: AtomicBool,
    upgraded: AtomicBool,
    attributes: DashMap<String, Arc<dyn Any + Send + Sync>>,
    created: Instant,
    last_activity: AtomicU64,
    last_idle: AtomicU64,
    idle_timer: Mutex<Option<TimerHandle>>,
    binding: OnceLock<Binding>,
    write_lock: Mutex<()>,
    /// TLS records waiting for a worker to write them, in engine order.
    outbox: Mutex<Vec<u8>>,
    flush_queued: AtomicBool,
    queued_sends: AtomicUsize,
    buffers_released: AtomicBool,
}

/// Held while a receive pass runs. Dropping it frees the buffers of a session
/// that closed in the meantime.
pub struct ReceivePermit<'a> {
    session: &'a IoSession,
}

impl Drop for ReceivePermit<'_> {
    fn drop(&mut self) {
        self.session.receiving.store(false, Ordering::SeqCst);
        if self.session.is_closed() {
            self.session.release_buffers();
        }
    }
}

/// Held while a message is written.
pub struct SendPermit<'a> {
    session: &'a IoSession,
}

impl Drop for SendPermit<'_> {
    fn drop(&mut self) {
        self.session.sending.store(false, Ordering::SeqCst);
    }
}

impl IoSession {
    pub(crate) fn new(
        id: u64,
        config: Arc<ConnectionConfig>,
        transport: Box<dyn Transport>,
        role: Role,
    ) -> Self {
        Self {
            id,
            config,
            role,
            channel: ByteChannel::new(),
            transport,
            tls: OnceLock::new(),
            lifecycle: AtomicU8::new(INIT),
            receiving: AtomicBool::new(false),
            sending: AtomicBool::new(false),
            upgraded: AtomicBool::new(false),
            attributes: DashMap::new(),
            created: Instant::now(),
            last_activity: AtomicU64::new(0),
            last_idle: AtomicU64::new(0),
            idle_timer: Mutex::new(None),
            binding: OnceLock::new(),
            write_lock: Mutex::new(()),
            outbox: Mutex::new(Vec::new()),
            flush_queued: AtomicBool::new(false),
            queued_sends: AtomicUsize::new(0),
            buffers_released: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn config(&self) -> &Arc<ConnectionConfig> {
        &self.config
    }

    pub fn handler(&self) -> &Arc<dyn IoHandler> {
        self.config.handler()
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Decrypted inbound bytes waiting to be framed.
    pub fn channel(&self) -> &ByteChannel {
        &self.channel
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub fn tls(&self) -> Option<&TlsHandshake> {
        self.tls.get()
    }

    /// Create the TLS engine if the config carries a provider.
    pub(crate) fn init_tls(&self) -> Result<()> {
        let Some(provider) = self.config.tls_provider() else {
            return Ok(());
        };
        if self.tls.get().is_some() {
            return Ok(());
        }
        let conn = provider.new_connection(self.role)?;
        let _ = self.tls.set(TlsHandshake::new(conn));
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        match self.lifecycle.load(Ordering::Acquire) {
            INIT => SessionState::Init,
            CONNECTED => SessionState::Connected,
            CLOSED => SessionState::Closed,
            _ => {
                if self.receiving.load(Ordering::Acquire) {
                    SessionState::Receiving
                } else if self.sending.load(Ordering::Acquire) {
                    SessionState::Sending
                } else {
                    SessionState::Idle
                }
            }
        }
    }

    pub fn is_open(&self) -> bool {
        !self.is_closed() && self.transport.is_open()
    }

    pub fn is_closed(&self) -> bool {
        self.lifecycle.load(Ordering::SeqCst) == CLOSED
    }

    /// Connected or established.
    pub fn is_connected(&self) -> bool {
        matches!(self.lifecycle.load(Ordering::Acquire), CONNECTED | ESTABLISHED)
    }

    /// Past the handshake and `on_connect`.
    pub fn is_established(&self) -> bool {
        self.lifecycle.load(Ordering::Acquire) == ESTABLISHED
    }

    pub(crate) fn mark_connected(&self) -> bool {
        self.lifecycle
            .compare_exchange(INIT, CONNECTED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn establish(&self) -> bool {
        self.lifecycle
            .compare_exchange(CONNECTED, ESTABLISHED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// `None` if another receive pass is already running.
    pub fn try_begin_receive(&self) -> Option<ReceivePermit<'_>> {
        self.receiving
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| ReceivePermit { session: self })
    }

    pub fn is_receiving(&self) -> bool {
        self.receiving.load(Ordering::SeqCst)
    }

    /// Wait for the send permit. Fails with `Timeout` after `timeout` and with
    /// `ConnectionClosed` if the session closes while waiting.
    pub fn acquire_send(&self, timeout: Duration) -> Result<SendPermit<'_>> {
        let deadline = Instant::now() + timeout;
        loop {
            if self
                .sending
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Ok(SendPermit { session: self });
            }
            if self.is_closed() {
                return Err(Error::ConnectionClosed);
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout(timeout));
            }
            thread::sleep(RETRY_PAUSE);
        }
    }

    /// Switch framing to WebSocket frames after a successful upgrade.
    pub fn mark_upgraded(&self) {
        self.upgraded.store(true, Ordering::Release);
    }

    pub fn is_upgraded(&self) -> bool {
        self.upgraded.load(Ordering::Acquire)
    }

    pub fn set_attribute<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.attributes.insert(key.into(), Arc::new(value));
    }

    /// `None` if the key is missing or holds another type.
    pub fn attribute<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = Arc::clone(self.attributes.get(key)?.value());
        value.downcast::<T>().ok()
    }

    pub fn remove_attribute(&self, key: &str) -> bool {
        self.attributes.remove(key).is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.local_addr()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.transport.peer_addr()
    }

    fn elapsed_ms(&self) -> u64 {
        self.created.elapsed().as_millis() as u64
    }

    /// Record traffic on the session.
    pub fn touch(&self) {
        self.last_activity.store(self.elapsed_ms(), Ordering::Release);
    }

    /// No traffic and no idle event for at least `interval`.
    pub(crate) fn idle_due(&self, interval: Duration) -> bool {
        let last = self
            .last_activity
            .load(Ordering::Acquire)
            .max(self.last_idle.load(Ordering::Acquire));
        self.elapsed_ms().saturating_sub(last) >= interval.as_millis() as u64
    }

    pub(crate) fn mark_idle(&self) {
        self.last_idle.store(self.elapsed_ms(), Ordering::Release);
    }

    /// Attach the session to the loop that owns its socket.
    pub(crate) fn bind(&self, handle: LoopHandle, token: Option<Token>) -> bool {
        self.binding.set(Binding { handle, token }).is_ok()
    }

    pub fn event_loop(&self) -> Option<&LoopHandle> {
        self.binding.get().map(|binding| &binding.handle)
    }

    pub(crate) fn set_idle_timer(&self, handle: TimerHandle) {
        let mut slot = self.idle_timer.lock();
        if self.is_closed() {
            handle.cancel();
            return;
        }
        if let Some(previous) = slot.replace(handle) {
            previous.cancel();
        }
    }

    /// Close the session. Returns `true` only for the call that performed the
    /// transition; later calls do nothing.
    pub fn close(self: &Arc<Self>) -> bool {
        if self.lifecycle.swap(CLOSED, Ordering::SeqCst) == CLOSED {
            return false;
        }
        debug!("Closing session {}", self.id);

        if let Some(timer) = self.idle_timer.lock().take() {
            timer.cancel();
        }

        if let Some(tls) = self.tls.get().filter(|tls| tls.is_done()) {
            // Skip the alert if a writer holds the socket.
            if let Some(_guard) = self.write_lock.try_lock() {
                let mut outbox = self.outbox.lock();
                if let Ok(records) = tls.close_notify() {
                    outbox.extend_from_slice(&records);
                }
                let _ = self.transport.write(&outbox);
                outbox.clear();
            }
        }

        self.transport.close();

        if let Some(Binding {
            handle,
            token: Some(token),
        }) = self.binding.get()
        {
            let token = *token;
            let _ = handle.submit(PRIORITY_CONTROL, move |multiplexer| {
                multiplexer.deregister(token);
            });
        }

        dispatcher::fire_disconnect(self);
        true
    }

    /// Close after events already queued on the session's loop have run.
    pub(crate) fn close_deferred(self: &Arc<Self>) {
        if let Some(handle) = self.event_loop() {
            let session = Arc::clone(self);
            if handle
                .submit(PRIORITY_EVENT, move |_| {
                    session.close();
                })
                .is_ok()
            {
                return;
            }
        }
        self.close();
    }

    /// Free the inbound and TLS buffers. Safe to call more than once.
    pub(crate) fn release_buffers(&self) {
        if self.buffers_released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.channel.release();
        if let Some(tls) = self.tls.get() {
            tls.release();
        }
    }

    /// Queue `message` for encoding and sending on the worker pool.
    pub fn send(self: &Arc<Self>, message: impl Into<Message>) {
        dispatcher::send(self, message.into());
    }

    /// Encode and write `message` on the calling thread.
    pub fn sync_send(self: &Arc<Self>, message: impl Into<Message>) -> Result<usize> {
        dispatcher::send_now(self, message.into())
    }

    /// Next decoded message, waiting up to the read timeout. Requires the
    /// config's handler to be a [`crate::network::SynchronousHandler`].
    pub fn sync_read(&self) -> Result<Message> {
        let handler = self.config.handler().as_synchronous().ok_or_else(|| {
            Error::Config("sync_read needs a SynchronousHandler".into())
        })?;
        handler.take(self, self.config.settings().read_timeout())
    }

    /// Accept bytes read from the socket. TLS sessions unwrap them and queue
    /// any handshake records the engine produced for a worker to write.
    pub(crate) fn ingest(self: &Arc<Self>, bytes: &[u8]) -> Result<()> {
        self.touch();
        let Some(tls) = self.tls.get() else {
            self.channel.write_tail(bytes)?;
            return Ok(());
        };

        tls.feed(bytes)?;
        let became_done = {
            let mut outbox = self.outbox.lock();
            let unwrapped = tls.unwrap_into(&self.channel)?;
            outbox.extend_from_slice(&unwrapped.outgoing);
            unwrapped.became_done
        };
        self.schedule_flush();

        if became_done {
            debug!("Session {} TLS established", self.id);
            dispatcher::fire_connect(self);
        }
        Ok(())
    }

    /// Queue the engine's opening records, if any.
    pub(crate) fn begin_handshake(self: &Arc<Self>) -> Result<()> {
        let Some(tls) = self.tls.get() else {
            return Ok(());
        };
        {
            let mut outbox = self.outbox.lock();
            let records = tls.begin()?;
            outbox.extend_from_slice(&records);
        }
        self.schedule_flush();
        Ok(())
    }

    /// Hand queued records to the worker pool. Never writes on the caller.
    fn schedule_flush(self: &Arc<Self>) {
        if self.outbox.lock().is_empty() || self.flush_queued.swap(true, Ordering::AcqRel) {
            return;
        }
        let session = Arc::clone(self);
        let job = Box::new(move || {
            session.flush_queued.store(false, Ordering::Release);
            if let Err(e) = session.flush_outbox() {
                dispatcher::fail(&session, e);
            }
        });
        if let Err(e) = self.config.runtime().workers().submit(job) {
            self.flush_queued.store(false, Ordering::Release);
            warn!("TLS flush for session {} dropped: {}", self.id, e);
        }
    }

    /// Write every queued TLS record. Blocks while another writer holds the
    /// socket, so only worker and caller threads use it.
    pub(crate) fn flush_outbox(&self) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.flush_locked()
    }

    fn flush_locked(&self) -> Result<()> {
        loop {
            let pending = std::mem::take(&mut *self.outbox.lock());
            if pending.is_empty() {
                return Ok(());
            }
            if self.is_closed() {
                return Err(Error::ConnectionClosed);
            }
            self.write_all_locked(&pending)?;
        }
    }

    /// Write one encoded message, wrapping it first on TLS sessions.
    pub(crate) fn write_message(&self, bytes: &[u8]) -> Result<usize> {
        let _guard = self.write_lock.lock();
        match self.tls.get() {
            Some(tls) => {
                {
                    let mut outbox = self.outbox.lock();
                    let records = tls.wrap(bytes)?;
                    outbox.extend_from_slice(&records);
                }
                self.flush_locked()?;
                Ok(bytes.len())
            }
            None => self.write_all_locked(bytes),
        }
    }

    pub(crate) fn send_queued(&self) {
        self.queued_sends.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn send_finished(&self) {
        self.queued_sends.fetch_sub(1, Ordering::AcqRel);
    }

    /// Sends handed to the worker pool that have not finished yet.
    pub(crate) fn has_queued_sends(&self) -> bool {
        self.queued_sends.load(Ordering::Acquire) > 0
    }

    fn write_all_locked(&self, bytes: &[u8]) -> Result<usize> {
        let settings = self.config.settings();
        let chunk = if self.transport.is_datagram() {
            bytes.len().max(1)
        } else {
            settings.send_buffer_size
        };
        let deadline = Instant::now() + settings.send_timeout();

        let mut rest = bytes;
        while !rest.is_empty() {
            let end = rest.len().min(chunk);
            match self.transport.write(&rest[..end]) {
                Ok(0) => return Err(Error::ConnectionClosed),
                Ok(n) => rest = &rest[n..],
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(Error::Timeout(settings.send_timeout()));
                    }
                    thread::sleep(RETRY_PAUSE);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(bytes.len())
    }
}

impl std::fmt::Debug for IoSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoSession")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("state", &self.state())
            .field("peer", &self.peer_addr())
            .finish()
    }
}
