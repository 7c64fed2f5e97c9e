use bytes::Bytes;
use serde_json::Value;

/// Header of a message. Key order is irrelevant; it is serialized with sorted keys.
pub type Header = serde_json::Map<String, Value>;

/// Header key naming the producer a message originated from.
pub const MODEL_KEY: &str = "model";

/// Header key marking a control payload that must bypass any processing.
pub const RAW_KEY: &str = "raw";

/// Outcome tag of a receive. Every driver branch is selected by this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flag {
    Success,
    Eof,
    Empty,
    Failure,
}

/// A single message moving through a communicator.
#[derive(Debug, Clone, PartialEq)]
pub struct CommMessage {
    pub flag: Flag,
    pub payload: Bytes,
    pub header: Header,
}

// ========================================================== CommMessage ===|

impl CommMessage {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self { flag: Flag::Success, payload: payload.into(), header: Header::new() }
    }

    pub fn with_header(payload: impl Into<Bytes>, header: Header) -> Self {
        Self { flag: Flag::Success, payload: payload.into(), header }
    }

    pub fn eof() -> Self {
        Self { flag: Flag::Eof, payload: Bytes::new(), header: Header::new() }
    }

    pub fn empty() -> Self {
        Self { flag: Flag::Empty, payload: Bytes::new(), header: Header::new() }
    }

    pub fn failure() -> Self {
        Self { flag: Flag::Failure, payload: Bytes::new(), header: Header::new() }
    }

    /// Sets a header entry, builder style.
    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.header.insert(key.into(), value.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.flag == Flag::Success
    }

    pub fn is_eof(&self) -> bool {
        self.flag == Flag::Eof
    }

    pub fn is_empty(&self) -> bool {
        self.flag == Flag::Empty
    }

    /// Name of the producer, if the header carries one.
    pub fn model(&self) -> Option<&str> {
        self.header.get(MODEL_KEY).and_then(Value::as_str)
    }

    /// Control payloads skip type validation and reply-route creation.
    pub fn is_raw(&self) -> bool {
        self.header.get(RAW_KEY).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn header_str(&self, key: &str) -> Option<&str> {
        self.header.get(key).and_then(Value::as_str)
    }
}

/// Renders a header value as an opaque token. Strings are taken verbatim, anything else uses its
/// JSON representation, so `42` and `"42"` both yield `42`.
pub fn value_token(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
