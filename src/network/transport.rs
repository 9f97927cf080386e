use mio::net::TcpStream;
use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Raw write side of a session's socket.
///
/// Writes are non-blocking; callers retry on `WouldBlock`. The read side is
/// owned by the socket's [`crate::reactor::Selectable`] source.
pub trait Transport: Send + Sync {
    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    fn close(&self);

    fn is_open(&self) -> bool;

    fn local_addr(&self) -> Option<SocketAddr>;

    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Each write is one datagram and the session ends after its reply.
    fn is_datagram(&self) -> bool {
        false
    }
}

/// TCP stream shared between the loop reading it and workers writing to it.
pub struct TcpTransport {
    stream: Arc<TcpStream>,
    open: AtomicBool,
}

impl TcpTransport {
    pub fn new(stream: Arc<TcpStream>) -> Self {
        Self {
            stream,
            open: AtomicBool::new(true),
        }
    }
}

impl Transport for TcpTransport {
    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        if !self.is_open() {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        }
        (&*self.stream).write(buf)
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            // NotConnected here only means the peer went first.
            let _ = self.stream.shutdown(Shutdown::Both);
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.stream.local_addr().ok()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.peer_addr().ok()
    }
}
