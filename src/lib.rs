//! sockloop: event-driven socket I/O engine
//!
//! This crate provides the plumbing protocol servers and clients are built on:
//! growable byte channels, per-connection sessions, framing, filter chains and
//! inline TLS, all driven by mio event loops.
//!
//! # Architecture
//!
//! - Accept and I/O event loops, each owning one mio `Poll`
//! - Priority task queue per loop; a session's events run on its loop in order
//! - Sends run on a bounded worker pool
//! - rustls engines fed through the same byte path as plaintext

/// Configuration management
pub mod config;

/// Event dispatch to the application handler
pub mod dispatcher;

/// Error types and result aliases
pub mod error;

/// Session events
pub mod event;

/// Encode/decode filter chain
pub mod filter;

/// Byte channels
pub mod io;

/// Values passed between filters and handlers
pub mod message;

/// Sessions, transports and TLS
pub mod network;

/// Message framing
pub mod protocol;

/// Event loops, worker pool and timer
pub mod reactor;

#[cfg(test)]
pub(crate) mod testing;

pub use config::Config;
pub use error::{Error, Result};
pub use io::ByteChannel;
pub use message::Message;
pub use network::{ConnectionConfig, IoHandler, IoSession, TcpClient, TcpServer, UdpServer};
pub use reactor::Runtime;
