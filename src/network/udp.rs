//! UDP server: every datagram becomes a one-shot session that closes after
//! its reply is sent.

use crate::dispatcher;
use crate::error::{Error, Result};
use crate::network::context::ConnectionConfig;
use crate::network::tcp::register_source;
use crate::network::tls::Role;
use crate::network::transport::Transport;
use crate::reactor::{LoopHandle, Readiness, Selectable, Step, PRIORITY_CONTROL};
use mio::net::UdpSocket;
use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};
use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Largest datagram accepted.
const MAX_DATAGRAM: usize = 64 * 1024;

/// Replies go back to the peer a datagram came from.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    open: AtomicBool,
}

impl UdpTransport {
    pub fn new(socket: Arc<UdpSocket>, peer: SocketAddr) -> Self {
        Self {
            socket,
            peer,
            open: AtomicBool::new(true),
        }
    }
}

impl Transport for UdpTransport {
    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        if !self.is_open() {
            return Err(io::Error::from(ErrorKind::NotConnected));
        }
        self.socket.send_to(buf, self.peer)
    }

    // The socket is shared by every peer; only this session's view closes.
    fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }

    fn is_datagram(&self) -> bool {
        true
    }
}

struct UdpSource {
    socket: Arc<UdpSocket>,
    config: Arc<ConnectionConfig>,
    handle: LoopHandle,
    scratch: Vec<u8>,
}

impl Selectable for UdpSource {
    fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        let fd = self.socket.as_raw_fd();
        registry.register(&mut SourceFd(&fd), token, Interest::READABLE)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        let fd = self.socket.as_raw_fd();
        registry.deregister(&mut SourceFd(&fd))
    }

    fn ready(&mut self, _readiness: Readiness) -> Step {
        loop {
            match self.socket.recv_from(&mut self.scratch) {
                Ok((n, peer)) => {
                    debug!("Datagram of {} bytes from {}", n, peer);
                    let transport = UdpTransport::new(Arc::clone(&self.socket), peer);
                    let session = self.config.new_session(Box::new(transport), Role::Server);
                    session.bind(self.handle.clone(), None);

                    if let Err(e) = session.ingest(&self.scratch[..n]) {
                        dispatcher::fail(&session, e);
                        continue;
                    }
                    if session.mark_connected() {
                        dispatcher::fire_connect(&session);
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("Error receiving datagram: {}", e);
                    break;
                }
            }
        }
        Step::Continue
    }
}

/// A bound UDP socket on one I/O loop.
pub struct UdpServer {
    local_addr: SocketAddr,
    handle: LoopHandle,
    token: Token,
    closed: AtomicBool,
}

impl UdpServer {
    pub fn bind(config: Arc<ConnectionConfig>) -> Result<Self> {
        if config.tls_provider().is_some() {
            return Err(Error::Config("TLS is not available over UDP".into()));
        }

        let std_socket = std::net::UdpSocket::bind(config.settings().address())?;
        std_socket.set_nonblocking(true)?;
        let local_addr = std_socket.local_addr()?;

        let handle = config.runtime().io_group().next().clone();
        let source = UdpSource {
            socket: Arc::new(UdpSocket::from_std(std_socket)),
            config,
            handle: handle.clone(),
            scratch: vec![0u8; MAX_DATAGRAM],
        };
        let token = register_source(&handle, Box::new(source), |_| {})?;

        info!("UDP listening on {}", local_addr);
        Ok(Self {
            local_addr,
            handle,
            token,
            closed: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let token = self.token;
        let _ = self.handle.submit(PRIORITY_CONTROL, move |multiplexer| {
            multiplexer.deregister(token);
        });
        info!("UDP socket on {} closed", self.local_addr);
    }
}

impl Drop for UdpServer {
    fn drop(&mut self) {
        self.close();
    }
}
