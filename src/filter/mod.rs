//! Payload transformation between wire frames and handler messages.
//!
//! Decoding runs the chain head to tail on every complete frame. Encoding runs
//! it tail to head on every outgoing message and must end with raw bytes.

pub mod byte;
pub mod string;

use crate::error::{Error, Result};
use crate::message::Message;
use crate::network::IoSession;
use bytes::Bytes;
use std::sync::Arc;

pub use byte::ByteFilter;
pub use string::StringFilter;

/// One stage of the filter chain.
///
/// Returning `Ok(None)` stops the traversal: on decode the frame is treated as
/// terminal for the session, on encode the message is dropped.
pub trait IoFilter: Send + Sync {
    fn decode(&self, session: &IoSession, message: Message) -> Result<Option<Message>>;

    fn encode(&self, session: &IoSession, message: Message) -> Result<Option<Message>>;
}

/// Immutable, shared list of filters.
#[derive(Clone)]
pub struct FilterChain {
    filters: Arc<[Arc<dyn IoFilter>]>,
}

impl FilterChain {
    pub fn new(filters: Vec<Arc<dyn IoFilter>>) -> Self {
        Self {
            filters: filters.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn decode(&self, session: &IoSession, message: Message) -> Result<Option<Message>> {
        let mut current = message;
        for filter in self.filters.iter() {
            match filter.decode(session, current)? {
                Some(next) => current = next,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    /// Encode tail to head. The result must be raw bytes, or `None` to drop.
    pub fn encode(&self, session: &IoSession, message: Message) -> Result<Option<Bytes>> {
        let mut current = message;
        for filter in self.filters.iter().rev() {
            match filter.encode(session, current)? {
                Some(next) => current = next,
                None => return Ok(None),
            }
        }

        match current {
            Message::Bytes(bytes) => Ok(Some(bytes)),
            other => Err(Error::Filter(format!(
                "encoded message must be bytes, got {}",
                other.kind()
            ))),
        }
    }
}

impl Default for FilterChain {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl std::fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterChain")
            .field("len", &self.filters.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use parking_lot::Mutex;

    /// Appends its tag on decode and on encode, recording call order.
    struct Tag {
        tag: &'static str,
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl IoFilter for Tag {
        fn decode(&self, _session: &IoSession, message: Message) -> Result<Option<Message>> {
            self.calls.lock().push(format!("decode:{}", self.tag));
            let text = message.as_text().unwrap_or_default().to_string();
            Ok(Some(Message::Text(text + self.tag)))
        }

        fn encode(&self, _session: &IoSession, message: Message) -> Result<Option<Message>> {
            self.calls.lock().push(format!("encode:{}", self.tag));
            match message {
                Message::Text(text) => Ok(Some(Message::Text(text + self.tag))),
                other => Ok(Some(other)),
            }
        }
    }

    struct Swallow;

    impl IoFilter for Swallow {
        fn decode(&self, _session: &IoSession, _message: Message) -> Result<Option<Message>> {
            Ok(None)
        }

        fn encode(&self, _session: &IoSession, _message: Message) -> Result<Option<Message>> {
            Ok(None)
        }
    }

    fn tagged(calls: &Arc<Mutex<Vec<String>>>) -> FilterChain {
        let filters: Vec<Arc<dyn IoFilter>> = vec![
            Arc::new(Tag {
                tag: "a",
                calls: Arc::clone(calls),
            }),
            Arc::new(Tag {
                tag: "b",
                calls: Arc::clone(calls),
            }),
        ];
        FilterChain::new(filters)
    }

    #[test]
    fn decode_runs_head_to_tail_and_encode_tail_to_head() {
        let (_runtime, session) = testing::memory_session(|builder| builder);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let chain = tagged(&calls);

        let decoded = chain.decode(&session, Message::from("")).unwrap().unwrap();
        assert_eq!(decoded.as_text(), Some("ab"));

        let encoded = chain.encode(&session, Message::from(""));
        assert!(matches!(encoded, Err(Error::Filter(_))));

        assert_eq!(
            *calls.lock(),
            vec!["decode:a", "decode:b", "encode:b", "encode:a"]
        );
    }

    #[test]
    fn none_stops_traversal() {
        let (_runtime, session) = testing::memory_session(|builder| builder);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let filters: Vec<Arc<dyn IoFilter>> = vec![
            Arc::new(Swallow),
            Arc::new(Tag {
                tag: "never",
                calls: Arc::clone(&calls),
            }),
        ];
        let chain = FilterChain::new(filters);

        assert!(chain.decode(&session, Message::from("x")).unwrap().is_none());
        assert!(calls.lock().is_empty());
    }

    #[test]
    fn empty_chain_passes_bytes_through() {
        let (_runtime, session) = testing::memory_session(|builder| builder);
        let chain = FilterChain::default();
        let out = chain
            .encode(&session, Message::from(&b"raw"[..]))
            .unwrap()
            .unwrap();
        assert_eq!(&out[..], b"raw");
    }
}
