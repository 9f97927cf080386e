//! TLS on top of the session byte path.
//!
//! Ciphertext read from the socket is fed into a network-side [`ByteChannel`]
//! and unwrapped into the session's application channel. Records produced by
//! the engine are handed back to the caller, which writes them through the
//! same transport primitive used for plaintext.

use crate::config::TlsSettings;
use crate::error::{Error, Result};
use crate::io::ByteChannel;
use parking_lot::Mutex;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, ClientConnection, Connection, RootCertStore, ServerConfig, ServerConnection};
use std::fs::File;
use std::io::{self, BufReader, ErrorKind, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Which side of the connection a session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    NotStarted,
    Handshaking,
    Done,
    Failed,
}

impl HandshakeState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => HandshakeState::NotStarted,
            1 => HandshakeState::Handshaking,
            2 => HandshakeState::Done,
            _ => HandshakeState::Failed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            HandshakeState::NotStarted => 0,
            HandshakeState::Handshaking => 1,
            HandshakeState::Done => 2,
            HandshakeState::Failed => 3,
        }
    }
}

/// Builds a TLS engine for each new session.
pub trait TlsProvider: Send + Sync {
    fn new_connection(&self, role: Role) -> Result<Connection>;
}

/// Output of one [`TlsHandshake::unwrap_into`] pass.
#[derive(Debug, Default)]
pub struct Unwrapped {
    /// Records the engine wants sent to the peer.
    pub outgoing: Vec<u8>,
    /// The handshake completed during this pass.
    pub became_done: bool,
}

/// Per-session TLS engine plus its network-side buffer.
pub struct TlsHandshake {
    conn: Mutex<Connection>,
    network: ByteChannel,
    state: AtomicU8,
}

const PLAINTEXT_CHUNK: usize = 16 * 1024;

impl TlsHandshake {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
            network: ByteChannel::new(),
            state: AtomicU8::new(HandshakeState::NotStarted.as_u8()),
        }
    }

    pub fn state(&self) -> HandshakeState {
        HandshakeState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_done(&self) -> bool {
        self.state() == HandshakeState::Done
    }

    /// Done or failed; nothing more will happen to the handshake.
    pub fn is_settled(&self) -> bool {
        matches!(self.state(), HandshakeState::Done | HandshakeState::Failed)
    }

    fn set_state(&self, state: HandshakeState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    fn start(&self) {
        let _ = self.state.compare_exchange(
            HandshakeState::NotStarted.as_u8(),
            HandshakeState::Handshaking.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Start the handshake and return whatever the engine wants to send first
    /// (the ClientHello for a client, nothing for a server).
    pub fn begin(&self) -> Result<Vec<u8>> {
        self.start();
        let mut conn = self.conn.lock();
        drain_records(&mut conn)
    }

    /// Queue ciphertext read from the socket.
    pub fn feed(&self, bytes: &[u8]) -> Result<()> {
        self.network.write_tail(bytes)?;
        Ok(())
    }

    /// Process buffered ciphertext, appending plaintext to `app`.
    ///
    /// Loops until the network channel is empty or the engine stops making
    /// progress. Plaintext is only released once the handshake is done.
    pub fn unwrap_into(&self, app: &ByteChannel) -> Result<Unwrapped> {
        self.start();
        let was_done = self.is_done();
        let mut conn = self.conn.lock();

        loop {
            let consumed = self.network.with_mut(|view| -> io::Result<usize> {
                let mut unread = view.unread();
                if unread.is_empty() {
                    return Ok(0);
                }
                let n = conn.read_tls(&mut unread)?;
                view.advance(n);
                Ok(n)
            })??;

            if consumed == 0 {
                break;
            }

            if let Err(e) = conn.process_new_packets() {
                self.set_state(HandshakeState::Failed);
                warn!("TLS failure: {}", e);
                return Err(e.into());
            }

            // rustls refuses more records while its plaintext buffer is full.
            if !conn.is_handshaking() {
                drain_plaintext(&mut conn, app)?;
            }
        }

        let outgoing = drain_records(&mut conn)?;

        let became_done = !was_done && !conn.is_handshaking() && !self.is_settled();
        if became_done {
            self.set_state(HandshakeState::Done);
            debug!("TLS handshake complete");
        }

        Ok(Unwrapped {
            outgoing,
            became_done,
        })
    }

    /// Encrypt application bytes into records.
    pub fn wrap(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        if !self.is_done() {
            return Err(Error::Tls("handshake not complete".into()));
        }

        let mut conn = self.conn.lock();
        let mut records = Vec::with_capacity(plaintext.len() + 64);
        // Chunked so the engine's outgoing buffer limit is never reached.
        for piece in plaintext.chunks(PLAINTEXT_CHUNK) {
            conn.writer().write_all(piece)?;
            records.extend_from_slice(&drain_records(&mut conn)?);
        }
        Ok(records)
    }

    /// The close_notify alert, ready to send.
    pub fn close_notify(&self) -> Result<Vec<u8>> {
        let mut conn = self.conn.lock();
        conn.send_close_notify();
        drain_records(&mut conn)
    }

    /// Free the network-side buffer.
    pub fn release(&self) {
        self.network.release();
    }
}

fn drain_plaintext(conn: &mut Connection, app: &ByteChannel) -> Result<()> {
    let mut chunk = [0u8; PLAINTEXT_CHUNK];
    loop {
        match conn.reader().read(&mut chunk) {
            Ok(0) => return Ok(()),
            Ok(n) => {
                app.write_tail(&chunk[..n])?;
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    }
}

fn drain_records(conn: &mut Connection) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    while conn.wants_write() {
        if conn.write_tls(&mut out)? == 0 {
            break;
        }
    }
    Ok(out)
}

impl std::fmt::Debug for TlsHandshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsHandshake")
            .field("state", &self.state())
            .finish()
    }
}

/// [`TlsProvider`] backed by rustls with the ring crypto provider.
#[derive(Clone, Default)]
pub struct RustlsProvider {
    server: Option<Arc<ServerConfig>>,
    client: Option<(Arc<ClientConfig>, ServerName<'static>)>,
}

impl RustlsProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_server_config(mut self, config: Arc<ServerConfig>) -> Self {
        self.server = Some(config);
        self
    }

    pub fn with_client_config(mut self, config: Arc<ClientConfig>, server_name: &str) -> Result<Self> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|e| Error::Config(format!("invalid TLS server name {}: {}", server_name, e)))?;
        self.client = Some((config, name));
        Ok(self)
    }

    /// Server side from `cert_path`/`key_path`, client side from `ca_path`.
    pub fn from_settings(settings: &TlsSettings) -> Result<Self> {
        let mut provider = Self::new();

        if let (Some(cert), Some(key)) = (&settings.cert_path, &settings.key_path) {
            provider = provider.with_server_config(Self::server_config_from_pem(cert, key)?);
        }

        if let Some(ca) = &settings.ca_path {
            let name = settings.server_name.as_deref().unwrap_or("localhost");
            provider = provider.with_client_config(Self::client_config_from_ca(ca)?, name)?;
        }

        if provider.server.is_none() && provider.client.is_none() {
            return Err(Error::Config(
                "TLS needs cert_path and key_path, or ca_path".into(),
            ));
        }
        Ok(provider)
    }

    fn crypto() -> Arc<CryptoProvider> {
        Arc::new(rustls::crypto::ring::default_provider())
    }

    pub fn server_config(
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<Arc<ServerConfig>> {
        let config = ServerConfig::builder_with_provider(Self::crypto())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        Ok(Arc::new(config))
    }

    pub fn client_config(roots: RootCertStore) -> Result<Arc<ClientConfig>> {
        let config = ClientConfig::builder_with_provider(Self::crypto())
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Arc::new(config))
    }

    pub fn server_config_from_pem<P: AsRef<Path>>(cert_path: P, key_path: P) -> Result<Arc<ServerConfig>> {
        let certs = load_certs(cert_path.as_ref())?;
        let mut reader = BufReader::new(File::open(key_path.as_ref())?);
        let key = rustls_pemfile::private_key(&mut reader)?.ok_or_else(|| {
            Error::Config(format!("no private key in {}", key_path.as_ref().display()))
        })?;
        Self::server_config(certs, key)
    }

    pub fn client_config_from_ca<P: AsRef<Path>>(ca_path: P) -> Result<Arc<ClientConfig>> {
        let mut roots = RootCertStore::empty();
        for cert in load_certs(ca_path.as_ref())? {
            roots.add(cert)?;
        }
        Self::client_config(roots)
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader).collect::<io::Result<Vec<_>>>()?;
    if certs.is_empty() {
        return Err(Error::Config(format!("no certificates in {}", path.display())));
    }
    Ok(certs)
}

impl TlsProvider for RustlsProvider {
    fn new_connection(&self, role: Role) -> Result<Connection> {
        match role {
            Role::Server => {
                let config = self
                    .server
                    .as_ref()
                    .ok_or_else(|| Error::Config("no TLS server configuration".into()))?;
                Ok(ServerConnection::new(Arc::clone(config))?.into())
            }
            Role::Client => {
                let (config, name) = self
                    .client
                    .as_ref()
                    .ok_or_else(|| Error::Config("no TLS client configuration".into()))?;
                Ok(ClientConnection::new(Arc::clone(config), name.clone())?.into())
            }
        }
    }
}
