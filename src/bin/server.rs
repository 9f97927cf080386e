use bytes::{BufMut, BytesMut};
use clap::{Parser, ValueEnum};
use sockloop::config::TlsSettings;
use sockloop::filter::ByteFilter;
use sockloop::network::ConnectionConfigBuilder;
use sockloop::protocol::{FixedHeaderSplitter, HttpMessageSplitter, LineSplitter, TransferSplitter};
use sockloop::{Config, ConnectionConfig, IoHandler, IoSession, Message, Runtime, TcpServer, UdpServer};
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Framing {
    /// Newline-terminated lines
    Line,
    /// 0x80 0x80 <u32 length> 0x80 <payload>
    Fixed,
    /// HTTP/1.1 requests
    Http,
    /// Whatever arrives in one read
    Transfer,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 2816)]
    port: u16,

    /// Bind address
    #[arg(short, long, default_value = "127.0.0.1")]
    bind: String,

    /// Number of I/O event loops (0 = number of CPUs)
    #[arg(short = 't', long, default_value_t = 0)]
    threads: usize,

    /// How incoming bytes are split into messages
    #[arg(short, long, value_enum, default_value_t = Framing::Line)]
    framing: Framing,

    /// Also echo datagrams on the same port
    #[arg(long)]
    udp: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Config file path
    #[arg(short, long)]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// PEM certificate chain; enables TLS together with --tls-key
    #[arg(long, requires = "tls_key")]
    tls_cert: Option<String>,

    /// PEM private key
    #[arg(long, requires = "tls_cert")]
    tls_key: Option<String>,
}

/// Sends every message back; HTTP requests get a 200 carrying the request.
struct EchoHandler {
    framing: Framing,
}

impl EchoHandler {
    fn http_response(request: &[u8]) -> Message {
        let mut response = BytesMut::with_capacity(request.len() + 96);
        response.put_slice(b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n");
        response.put_slice(format!("Content-Length: {}\r\n\r\n", request.len()).as_bytes());
        response.put_slice(request);
        Message::Bytes(response.freeze())
    }
}

impl IoHandler for EchoHandler {
    fn on_connect(&self, session: &Arc<IoSession>) -> Option<Message> {
        info!("Session {} connected from {:?}", session.id(), session.peer_addr());
        None
    }

    fn on_disconnect(&self, session: &Arc<IoSession>) {
        info!("Session {} disconnected", session.id());
    }

    fn on_receive(&self, _session: &Arc<IoSession>, message: Message) -> Option<Message> {
        match (self.framing, message.as_bytes()) {
            (Framing::Http, Some(request)) => Some(Self::http_response(request)),
            _ => Some(message),
        }
    }

    fn on_exception(&self, session: &Arc<IoSession>, error: &sockloop::Error) {
        warn!("Session {} error: {}", session.id(), error);
    }

    fn on_idle(&self, session: &Arc<IoSession>) {
        info!("Session {} idle", session.id());
    }
}

fn framed(builder: ConnectionConfigBuilder, framing: Framing) -> ConnectionConfigBuilder {
    match framing {
        Framing::Line => builder.splitter(LineSplitter),
        Framing::Fixed => builder.splitter(FixedHeaderSplitter).filter(ByteFilter),
        Framing::Http => builder.splitter(HttpMessageSplitter),
        Framing::Transfer => builder.splitter(TransferSplitter),
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Create configuration
    let mut config = if let Some(config_path) = &args.config {
        Config::from_file(config_path)?
    } else {
        let mut config = Config::default();
        config.connection.host = args.bind.clone();
        config.connection.port = args.port;
        config.log_level = args.log_level.clone();
        if args.threads > 0 {
            config.runtime.io_threads = args.threads;
        }
        config
    };

    if let (Some(cert), Some(key)) = (&args.tls_cert, &args.tls_key) {
        config.connection.tls = Some(TlsSettings {
            cert_path: Some(cert.clone()),
            key_path: Some(key.clone()),
            ..Default::default()
        });
    }
    config.validate()?;

    // Initialize tracing
    let log_level = if args.verbose {
        "debug"
    } else {
        &config.log_level
    };
    tracing_subscriber::fmt()
        .with_env_filter(format!("sockloop={},sockloop_echo={}", log_level, log_level))
        .init();

    info!(
        "Starting sockloop echo v{} on {} ({:?} framing)",
        env!("CARGO_PKG_VERSION"),
        config.connection.address(),
        args.framing
    );
    info!(
        "Using {} I/O loops and {} worker threads",
        config.runtime.io_threads, config.runtime.worker_threads
    );

    let runtime = Runtime::new(&config.runtime)?;
    let handler = Arc::new(EchoHandler {
        framing: args.framing,
    });

    let tcp_config = framed(
        ConnectionConfig::builder(Arc::clone(&runtime))
            .settings(config.connection.clone())
            .handler(Arc::clone(&handler)),
        args.framing,
    )
    .build()?;
    let server = TcpServer::bind(tcp_config)?;

    let udp = if args.udp {
        let mut settings = config.connection.clone();
        settings.tls = None;
        settings.port = server.local_addr().port();
        let udp_config = framed(
            ConnectionConfig::builder(Arc::clone(&runtime))
                .settings(settings)
                .handler(Arc::clone(&handler)),
            args.framing,
        )
        .build()?;
        Some(UdpServer::bind(udp_config)?)
    } else {
        None
    };

    // Setup signal handlers for graceful shutdown
    let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
    ctrlc::set_handler(move || {
        info!("Received shutdown signal, shutting down gracefully...");
        let _ = stop_tx.try_send(());
    })?;

    if stop_rx.recv().is_err() {
        error!("Signal handler went away");
    }

    server.close();
    if let Some(udp) = &udp {
        udp.close();
    }
    runtime.shutdown();

    info!("Server shutdown complete");
    Ok(())
}
