use super::{MessageSplitter, SplitOutcome};
use crate::network::IoSession;

/// Newline-delimited framing; each frame keeps its trailing `\n`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LineSplitter;

impl MessageSplitter for LineSplitter {
    fn can_split(&self, _session: &IoSession, view: &[u8]) -> SplitOutcome {
        match memchr::memchr(b'\n', view) {
            Some(index) => SplitOutcome::Complete(index + 1),
            None => SplitOutcome::NeedMoreData,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn splits_after_newline() {
        let (_runtime, session) = testing::memory_session(|builder| builder);
        assert_eq!(
            LineSplitter.can_split(&session, b"PING\r\nPONG"),
            SplitOutcome::Complete(6)
        );
        assert_eq!(LineSplitter.can_split(&session, b"\n"), SplitOutcome::Complete(1));
        assert_eq!(
            LineSplitter.can_split(&session, b"no newline"),
            SplitOutcome::NeedMoreData
        );
    }
}
