//! Buffering primitives shared by sessions and the TLS layer.

pub mod byte_channel;

pub use byte_channel::{ByteChannel, ChannelView, Want, DEFAULT_CAPACITY};
