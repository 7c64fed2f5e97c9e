use std::borrow::Cow;

use thiserror::Error;

/// Coarse classification of every failure the crate reports. Drivers branch on this rather than
/// on individual variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Channel is open, but nothing is available right now. Retry, or treat as an empty receive.
    Temporary,

    /// Channel can't recover. The owning driver moves to `Closing`.
    Fatal,

    /// The single message was rejected. The channel itself stays open.
    TypeMismatch,
}

/// Errors raised while validating, encoding or decoding typed messages.
#[derive(Debug, Error)]
pub enum TypeError {
    #[error("'{typename}' failed schema validation: {reason}")]
    Schema { typename: Cow<'static, str>, reason: String },

    #[error("object is not a valid '{0}'")]
    InvalidObject(Cow<'static, str>),

    #[error("cannot change typename from '{from}' to '{to}'")]
    TypenameChanged { from: String, to: String },

    #[error("metadata is incompatible with the type definition at key '{0}'")]
    Incompatible(String),

    #[error("encoded data is malformed: {0}")]
    MalformedData(Cow<'static, str>),

    #[error("header separator not found in message")]
    MissingSeparator,

    #[error("header is not a valid JSON object: {0}")]
    Header(#[from] serde_json::Error),

    #[error("unknown type '{0}'")]
    UnknownType(String),
}

/// Errors raised by communicators.
#[derive(Debug, Error)]
pub enum CommError {
    #[error("no messages waiting")]
    NoMessages,

    #[error("temporarily unavailable: {0}")]
    Temporary(Cow<'static, str>),

    #[error("comm is closed")]
    Closed,

    #[error("fatal communication error: {0}")]
    Fatal(Cow<'static, str>),

    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    Oversized { size: usize, limit: usize },

    #[error("message rejected: {0}")]
    Type(#[from] TypeError),

    #[error("invalid comm configuration: {0}")]
    Config(Cow<'static, str>),
}

/// Errors raised by connection drivers.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("driver '{0}' was already started")]
    AlreadyStarted(String),

    #[error("no reply route could be resolved for the request")]
    NoReplyRoute,

    #[error("invalid driver configuration: {0}")]
    Config(Cow<'static, str>),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error(transparent)]
    Comm(#[from] CommError),
}

// ========================================================== Impls ===|

impl CommError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoMessages | Self::Temporary(_) => ErrorKind::Temporary,
            Self::Closed | Self::Fatal(_) | Self::Config(_) => ErrorKind::Fatal,
            Self::Oversized { .. } | Self::Type(_) => ErrorKind::TypeMismatch,
        }
    }

    pub fn is_temporary(&self) -> bool {
        self.kind() == ErrorKind::Temporary
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }
}

impl DriverError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Comm(e) => e.kind(),
            _ => ErrorKind::Fatal,
        }
    }
}

impl From<TypeError> for DriverError {
    fn from(value: TypeError) -> Self {
        Self::Comm(value.into())
    }
}
