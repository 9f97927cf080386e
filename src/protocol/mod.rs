//! Message framing.
//!
//! A splitter looks at the bytes buffered for a session and decides whether a
//! complete frame sits at the front. It never consumes anything itself: the
//! dispatcher reads `Complete(n)` bytes off the channel and hands them to the
//! filter chain.

pub mod fixed;
pub mod http;
pub mod line;
pub mod websocket;

use crate::network::IoSession;

pub use fixed::FixedHeaderSplitter;
pub use http::HttpMessageSplitter;
pub use line::LineSplitter;

/// Result of asking a splitter about the buffered bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitOutcome {
    /// Not enough bytes yet, try again after the next read.
    NeedMoreData,
    /// The buffered bytes can never form a valid frame.
    Invalid,
    /// A frame of this many bytes starts at offset 0.
    Complete(usize),
}

pub trait MessageSplitter: Send + Sync {
    /// `view` is the whole unread buffer; it is never empty.
    fn can_split(&self, session: &IoSession, view: &[u8]) -> SplitOutcome;
}

/// Treats whatever is buffered as one frame.
#[derive(Debug, Default, Clone, Copy)]
pub struct TransferSplitter;

impl MessageSplitter for TransferSplitter {
    fn can_split(&self, _session: &IoSession, view: &[u8]) -> SplitOutcome {
        if view.is_empty() {
            SplitOutcome::NeedMoreData
        } else {
            SplitOutcome::Complete(view.len())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn transfer_takes_everything() {
        let (_runtime, session) = testing::memory_session(|builder| builder);
        assert_eq!(
            TransferSplitter.can_split(&session, b"anything at all"),
            SplitOutcome::Complete(15)
        );
        assert_eq!(
            TransferSplitter.can_split(&session, b""),
            SplitOutcome::NeedMoreData
        );
    }
}
