use super::IoFilter;
use crate::error::{Error, Result};
use crate::message::Message;
use crate::network::IoSession;
use bytes::Bytes;

/// UTF-8 bytes on the wire, `Message::Text` in the handler.
#[derive(Debug, Default, Clone, Copy)]
pub struct StringFilter;

impl IoFilter for StringFilter {
    fn decode(&self, _session: &IoSession, message: Message) -> Result<Option<Message>> {
        match message {
            Message::Bytes(bytes) => String::from_utf8(bytes.to_vec())
                .map(|text| Some(Message::Text(text)))
                .map_err(|e| Error::Filter(format!("frame is not valid UTF-8: {}", e))),
            other => Ok(Some(other)),
        }
    }

    fn encode(&self, _session: &IoSession, message: Message) -> Result<Option<Message>> {
        match message {
            Message::Text(text) => Ok(Some(Message::Bytes(Bytes::from(text)))),
            other => Ok(Some(other)),
        }
    }
}
