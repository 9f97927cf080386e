use super::IoFilter;
use crate::error::{Error, Result};
use crate::message::Message;
use crate::network::IoSession;
use crate::protocol::fixed::{self, HEADER_LEN};
use crate::protocol::SplitOutcome;

/// Codec for fixed-header frames.
///
/// Decode strips the 7-byte header from a complete frame; encode wraps bytes
/// or text in one.
#[derive(Debug, Default, Clone, Copy)]
pub struct ByteFilter;

impl IoFilter for ByteFilter {
    fn decode(&self, _session: &IoSession, message: Message) -> Result<Option<Message>> {
        let frame = match message {
            Message::Bytes(frame) => frame,
            other => return Ok(Some(other)),
        };

        match fixed::frame_len(&frame) {
            SplitOutcome::Complete(len) if len == frame.len() => {
                Ok(Some(Message::Bytes(frame.slice(HEADER_LEN..))))
            }
            _ => Err(Error::Filter(format!(
                "not a fixed-header frame ({} bytes)",
                frame.len()
            ))),
        }
    }

    fn encode(&self, _session: &IoSession, message: Message) -> Result<Option<Message>> {
        match message {
            Message::Bytes(payload) => Ok(Some(Message::Bytes(fixed::encode_frame(&payload)?))),
            Message::Text(text) => Ok(Some(Message::Bytes(fixed::encode_frame(text.as_bytes())?))),
            Message::Object(_) => Err(Error::Filter(
                "fixed-header frames carry bytes or text only".into(),
            )),
        }
    }
}
