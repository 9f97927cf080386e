use bytes::Bytes;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Value flowing through the filter chain and the handler callbacks.
///
/// Frames leave the splitter as `Bytes`; filters turn them into whatever the
/// handler works with, and the encode side must end with `Bytes` again.
#[derive(Clone)]
pub enum Message {
    Bytes(Bytes),
    Text(String),
    Object(Arc<dyn Any + Send + Sync>),
}

impl Message {
    pub fn object<T: Any + Send + Sync>(value: T) -> Self {
        Message::Object(Arc::new(value))
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Message::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn into_bytes(self) -> Option<Bytes> {
        match self {
            Message::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Message::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            Message::Object(object) => object.downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Short name of the variant, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Bytes(_) => "bytes",
            Message::Text(_) => "text",
            Message::Object(_) => "object",
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            Message::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Message::Object(_) => f.write_str("Object(..)"),
        }
    }
}

impl From<Bytes> for Message {
    fn from(bytes: Bytes) -> Self {
        Message::Bytes(bytes)
    }
}

impl From<Vec<u8>> for Message {
    fn from(bytes: Vec<u8>) -> Self {
        Message::Bytes(Bytes::from(bytes))
    }
}

impl From<&'static [u8]> for Message {
    fn from(bytes: &'static [u8]) -> Self {
        Message::Bytes(Bytes::from_static(bytes))
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Message::Text(text)
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Message::Text(text.to_string())
    }
}
