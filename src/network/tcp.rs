//! TCP listener, per-connection source and client.

use crate::dispatcher;
use crate::error::{Error, Result};
use crate::message::Message;
use crate::network::context::ConnectionConfig;
use crate::network::session::IoSession;
use crate::network::tls::Role;
use crate::network::transport::TcpTransport;
use crate::reactor::{wait_until, LoopHandle, Readiness, Selectable, Step, PRIORITY_CONTROL};
use crossbeam_channel::bounded;
use mio::net::{TcpListener, TcpStream};
use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};
use std::io::{self, ErrorKind, Read};
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Register `source` on `handle`'s loop and wait for the token.
/// `on_registered` runs on the loop thread before any readiness is seen.
pub(crate) fn register_source(
    handle: &LoopHandle,
    source: Box<dyn Selectable>,
    on_registered: impl FnOnce(Token) + Send + 'static,
) -> Result<Token> {
    if handle.in_loop() {
        return Err(Error::Rejected(
            "cannot wait for registration on the loop's own thread".into(),
        ));
    }

    let (tx, rx) = bounded(1);
    handle.submit(PRIORITY_CONTROL, move |multiplexer| {
        let result = multiplexer.register(source);
        if let Ok(token) = &result {
            on_registered(*token);
        }
        let _ = tx.send(result);
    })?;

    match rx.recv() {
        Ok(result) => Ok(result?),
        // Task dropped unrun: the loop stopped.
        Err(_) => Err(Error::Shutdown),
    }
}

fn resolve(address: &str) -> Result<SocketAddr> {
    address
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| Error::Config(format!("cannot resolve {}", address)))
}

/// Reads one TCP connection into its session.
pub(crate) struct TcpSource {
    session: Arc<IoSession>,
    stream: Arc<TcpStream>,
    connecting: bool,
    scratch: Vec<u8>,
}

impl TcpSource {
    pub(crate) fn new(session: Arc<IoSession>, stream: Arc<TcpStream>, connecting: bool) -> Self {
        let size = session.config().settings().read_buffer_size;
        Self {
            session,
            stream,
            connecting,
            scratch: vec![0u8; size],
        }
    }

    fn interest(&self) -> Interest {
        if self.connecting {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        }
    }

    /// `Ok(true)` once a non-blocking connect has completed.
    fn poll_connect(&self) -> io::Result<bool> {
        if let Some(e) = self.stream.take_error()? {
            return Err(e);
        }
        match self.stream.peer_addr() {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotConnected => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn flush_received(&self) {
        if self.session.is_established() && matches!(self.session.channel().is_empty(), Ok(false)) {
            dispatcher::fire_receive(&self.session);
        }
    }

    fn hang_up(&self) -> Step {
        self.flush_received();
        self.session.close_deferred();
        Step::Close
    }
}

impl Selectable for TcpSource {
    fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        let fd = self.stream.as_raw_fd();
        registry.register(&mut SourceFd(&fd), token, self.interest())
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        let fd = self.stream.as_raw_fd();
        registry.deregister(&mut SourceFd(&fd))
    }

    fn ready(&mut self, readiness: Readiness) -> Step {
        if self.session.is_closed() {
            return Step::Close;
        }

        if self.connecting {
            match self.poll_connect() {
                Ok(true) => {
                    self.connecting = false;
                    let nodelay = self.session.config().settings().tcp_nodelay;
                    if let Err(e) = self.stream.set_nodelay(nodelay) {
                        debug!("set_nodelay failed: {}", e);
                    }
                    debug!("Session {} connected to {:?}", self.session.id(), self.session.peer_addr());
                    if self.session.mark_connected() {
                        dispatcher::fire_connect(&self.session);
                    }
                }
                Ok(false) => return Step::Continue,
                Err(e) => {
                    dispatcher::fail(&self.session, e.into());
                    return Step::Close;
                }
            }
        }

        if !(readiness.readable || readiness.read_closed || readiness.error) {
            return Step::Continue;
        }

        let depth = self.session.config().settings().read_recursion_depth;
        let mut reads = 0;
        loop {
            if reads == depth {
                self.flush_received();
                return Step::Resume;
            }

            match (&*self.stream).read(&mut self.scratch) {
                Ok(0) => return self.hang_up(),
                Ok(n) => {
                    reads += 1;
                    if let Err(e) = self.session.ingest(&self.scratch[..n]) {
                        dispatcher::fail(&self.session, e);
                        return Step::Close;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::ConnectionReset => return self.hang_up(),
                Err(e) => {
                    dispatcher::fail(&self.session, e.into());
                    return Step::Close;
                }
            }
        }

        self.flush_received();
        Step::Continue
    }

    fn shutdown(&mut self) {
        self.session.close();
    }
}

/// Accepts connections and hands each one to the I/O group.
struct Listener {
    listener: TcpListener,
    config: Arc<ConnectionConfig>,
}

impl Selectable for Listener {
    fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        registry.register(&mut self.listener, token, Interest::READABLE)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.listener)
    }

    fn ready(&mut self, _readiness: Readiness) -> Step {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    debug!("New connection from {}", addr);
                    if let Err(e) = stream.set_nodelay(self.config.settings().tcp_nodelay) {
                        debug!("set_nodelay failed for {}: {}", addr, e);
                    }

                    let stream = Arc::new(stream);
                    let transport = TcpTransport::new(Arc::clone(&stream));
                    let session = self.config.new_session(Box::new(transport), Role::Server);
                    let source = TcpSource::new(Arc::clone(&session), stream, false);
                    dispatcher::fire_accepted(&session, Box::new(source));
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                    break;
                }
            }
        }
        Step::Continue
    }
}

/// A listening socket on one accept loop.
pub struct TcpServer {
    config: Arc<ConnectionConfig>,
    local_addr: SocketAddr,
    handle: LoopHandle,
    token: Token,
    closed: AtomicBool,
}

impl TcpServer {
    /// Bind to the configured host and port (port 0 picks a free one).
    pub fn bind(config: Arc<ConnectionConfig>) -> Result<Self> {
        let address = resolve(&config.settings().address())?;
        let std_listener = std::net::TcpListener::bind(address)?;
        std_listener.set_nonblocking(true)?;
        let local_addr = std_listener.local_addr()?;

        let listener = Listener {
            listener: TcpListener::from_std(std_listener),
            config: Arc::clone(&config),
        };
        let handle = config.runtime().accept_group().next().clone();
        let token = register_source(&handle, Box::new(listener), |_| {})?;

        info!("Listening on {}", local_addr);
        Ok(Self {
            config,
            local_addr,
            handle,
            token,
            closed: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &Arc<ConnectionConfig> {
        &self.config
    }

    pub fn active_sessions(&self) -> usize {
        self.config.active_sessions()
    }

    /// Stop accepting. Established sessions stay open.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let token = self.token;
        let _ = self.handle.submit(PRIORITY_CONTROL, move |multiplexer| {
            multiplexer.deregister(token);
        });
        info!("Listener on {} closed", self.local_addr);
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.close();
    }
}

/// One outbound connection.
pub struct TcpClient {
    session: Arc<IoSession>,
}

impl TcpClient {
    /// Connect to the configured host and port and wait, up to the read
    /// timeout, until the session is established (TLS included).
    pub fn connect(config: Arc<ConnectionConfig>) -> Result<Self> {
        let address = resolve(&config.settings().address())?;
        let stream = Arc::new(TcpStream::connect(address)?);
        let transport = TcpTransport::new(Arc::clone(&stream));
        let session = config.new_session(Box::new(transport), Role::Client);

        if let Err(e) = Self::start(&session, stream) {
            session.close();
            return Err(e);
        }

        let timeout = config.settings().read_timeout();
        if !wait_until(timeout, || session.is_established() || session.is_closed()) {
            session.close();
            return Err(Error::Timeout(timeout));
        }
        if session.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        debug!("Client session {} established to {}", session.id(), address);
        Ok(Self { session })
    }

    fn start(session: &Arc<IoSession>, stream: Arc<TcpStream>) -> Result<()> {
        session.init_tls()?;
        let handle = session.config().runtime().io_group().next().clone();
        let source = TcpSource::new(Arc::clone(session), stream, true);
        let bound = Arc::clone(session);
        let target = handle.clone();
        register_source(&handle, Box::new(source), move |token| {
            bound.bind(target, Some(token));
        })?;
        Ok(())
    }

    pub fn session(&self) -> &Arc<IoSession> {
        &self.session
    }

    pub fn is_open(&self) -> bool {
        self.session.is_open()
    }

    /// Queue `message` on the worker pool.
    pub fn send(&self, message: impl Into<Message>) {
        self.session.send(message);
    }

    pub fn sync_send(&self, message: impl Into<Message>) -> Result<usize> {
        self.session.sync_send(message)
    }

    pub fn sync_read(&self) -> Result<Message> {
        self.session.sync_read()
    }

    /// `sync_send` followed by `sync_read`.
    pub fn request(&self, message: impl Into<Message>) -> Result<Message> {
        self.sync_send(message)?;
        self.sync_read()
    }

    pub fn close(&self) -> bool {
        self.session.close()
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        self.session.close();
    }
}
