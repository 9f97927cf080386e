use std::io;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Byte channel is released")]
    Released,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Filter error: {0}")]
    Filter(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Task rejected: {0}")]
    Rejected(String),

    #[error("Priority must be between 1 and 10, got {0}")]
    InvalidPriority(u8),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Runtime shutting down")]
    Shutdown,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether this failure ends the session it happened on.
    ///
    /// Protocol, socket and TLS failures close the session after the handler
    /// has been told; filter errors and timeouts leave the decision to the caller.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Protocol(_) | Error::Tls(_) | Error::ConnectionClosed
        )
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Error::Tls(e.to_string())
    }
}
