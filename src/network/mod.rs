//! Sessions and the sockets under them.

pub mod context;
pub mod handler;
pub mod session;
pub mod tcp;
pub mod tls;
pub mod transport;
pub mod udp;

pub use context::{ConnectionConfig, ConnectionConfigBuilder};
pub use handler::{IoHandler, SynchronousHandler};
pub use session::{IoSession, ReceivePermit, SendPermit, SessionState};
pub use tcp::{TcpClient, TcpServer};
pub use tls::{HandshakeState, Role, RustlsProvider, TlsHandshake, TlsProvider};
pub use transport::{TcpTransport, Transport};
pub use udp::{UdpServer, UdpTransport};
