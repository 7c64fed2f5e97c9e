//! # Communicator
//!
//! A communicator is one endpoint of a typed, directional channel. Transports implement the frame
//! primitives ([`Communicator::send_frame`], [`Communicator::recv_frame`]); everything message
//! shaped (envelopes, EOF, chunking, type checks) is provided on top of them.
//!
//! All methods take `&self`. A comm is shared between a driver's worker thread and whichever
//! thread decides to close it, and `close` must unblock a pending receive.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    envelope,
    error::{CommError, TypeError},
    message::{CommMessage, Flag, Header, MODEL_KEY},
    types::{self, TypeDef, TYPENAME_KEY},
};

pub use self::registry::{
    cleanup_comms, new_comm, new_comm_pair, register_comm_kind, shutdown, CommConstructor,
};

#[cfg(feature = "in-memory-comm")]
pub use self::memory::MemoryComm;

#[cfg(feature = "in-memory-comm")]
pub mod memory;
pub mod registry;

/// Frame size limit used when neither the transport nor the configuration specify one.
pub const DEFAULT_MAX_MSG_SIZE: usize = 64 * 1024;

/// Largest payload a chunked message may announce.
pub const MAX_CHUNKED_SIZE: usize = 1 << 30;

/// Header keys of the first frame of a chunked message.
const SIZE_KEY: &str = "size";
const CHUNKED_KEY: &str = "chunked";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Send,
    Recv,
}

/// Constructor arguments of a comm. Two endpoints agree on a channel by sharing `kind`, `address`
/// and `typedef`, with opposite directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommConfig {
    pub name: String,

    /// Transport tag, sent on the wire as `commtype`.
    #[serde(rename = "commtype")]
    pub kind: String,

    pub direction: Direction,

    /// `None` asks the transport to allocate a fresh address.
    #[serde(default)]
    pub address: Option<String>,

    #[serde(default)]
    pub typedef: Option<TypeDef>,

    #[serde(default)]
    pub max_msg_size: Option<usize>,

    /// Skip opening the comm on construction.
    #[serde(default)]
    pub dont_open: bool,
}

/// One endpoint of a channel.
pub trait Communicator: Send + Sync + 'static {
    fn config(&self) -> &CommConfig;

    /// Resolved address; equals `config().address` when one was given.
    fn address(&self) -> &str;

    fn open(&self) -> Result<(), CommError>;

    /// Closes the endpoint. Idempotent. Unblocks a receive pending on another thread.
    fn close(&self);

    fn is_open(&self) -> bool;

    fn is_closed(&self) -> bool {
        !self.is_open()
    }

    /// Sends one frame. Must complete or fail promptly.
    fn send_frame(&self, frame: Bytes) -> Result<(), CommError>;

    /// Sends frames back to back. Transports shared by several writers override this so frames of
    /// one message never interleave with another writer's.
    fn send_frames(&self, frames: Vec<Bytes>) -> Result<(), CommError> {
        frames.into_iter().try_for_each(|f| self.send_frame(f))
    }

    /// Blocks up to `timeout` for one frame. Fails with [`CommError::NoMessages`] on timeout.
    fn recv_frame(&self, timeout: Duration) -> Result<Bytes, CommError>;

    /// Number of frames waiting to be received.
    fn n_msg(&self) -> usize {
        0
    }

    /// Every frame sent through this endpoint was taken by a receiver.
    fn is_confirmed_send(&self) -> bool {
        true
    }

    /// Nothing sent towards this endpoint is still waiting to be received.
    fn is_confirmed_recv(&self) -> bool {
        true
    }

    // ==== Provided ====

    fn name(&self) -> &str {
        &self.config().name
    }

    fn kind(&self) -> &str {
        &self.config().kind
    }

    fn direction(&self) -> Direction {
        self.config().direction
    }

    fn max_msg_size(&self) -> usize {
        self.config().max_msg_size.unwrap_or(DEFAULT_MAX_MSG_SIZE)
    }

    /// Constructor arguments of the paired endpoint.
    fn opposite_endpoint_config(&self) -> CommConfig {
        let mut out = self.config().opposite();
        out.address = Some(self.address().to_string());
        out
    }

    /// Sends a message as a single frame.
    fn send(&self, msg: &CommMessage) -> Result<(), CommError> {
        let frame = self.encode_frame(msg)?;
        if frame.len() > self.max_msg_size() {
            return Err(CommError::Oversized { size: frame.len(), limit: self.max_msg_size() });
        }

        self.send_frame(frame)
    }

    /// Receives a single-frame message. A timeout yields an `Empty` message.
    fn recv(&self, timeout: Duration) -> Result<CommMessage, CommError> {
        match self.recv_frame(timeout) {
            Ok(frame) => self.decode_frame(&frame),
            Err(CommError::NoMessages) => Ok(CommMessage::empty()),
            Err(e) => Err(e),
        }
    }

    /// Sends a message of any size, splitting it when it exceeds [`Self::max_msg_size`].
    fn send_chunked(&self, msg: &CommMessage) -> Result<(), CommError> {
        let limit = self.max_msg_size();
        let frame = self.encode_frame(msg)?;
        if frame.len() <= limit {
            return self.send_frame(frame);
        }

        let mut header = msg.header.clone();
        header.insert(SIZE_KEY.into(), msg.payload.len().into());
        header.insert(CHUNKED_KEY.into(), true.into());
        self.check_type(msg.flag, &header)?;

        let overhead = envelope::overhead(&header)?;
        if overhead > limit {
            return Err(CommError::Oversized { size: overhead, limit });
        }

        let (first, mut rest) = {
            let split = (limit - overhead).min(msg.payload.len());
            (msg.payload.slice(..split), msg.payload.slice(split..))
        };

        let mut frames = vec![envelope::encode(&header, &first)?];
        while !rest.is_empty() {
            let n = rest.len().min(limit);
            frames.push(rest.split_to(n));
        }

        tracing::debug!(
            comm = %self.name(),
            size = msg.payload.len(),
            n_frames = frames.len(),
            "sending chunked message"
        );
        self.send_frames(frames)
    }

    /// Receives a message of any size, reassembling chunks. Each chunk may take up to `timeout`.
    fn recv_chunked(&self, timeout: Duration) -> Result<CommMessage, CommError> {
        let mut msg = self.recv(timeout)?;
        let Some(size) = chunked_size(&msg.header) else { return Ok(msg) };
        if size > MAX_CHUNKED_SIZE || size < msg.payload.len() {
            return Err(TypeError::MalformedData(
                format!("chunked message announces {size} bytes").into(),
            )
            .into());
        }

        // Grows with the data actually received rather than the announced size.
        let mut payload = BytesMut::with_capacity(size.min(self.max_msg_size()));
        payload.extend_from_slice(&msg.payload);

        while payload.len() < size {
            let chunk = match self.recv_frame(timeout) {
                Ok(chunk) => chunk,
                Err(CommError::NoMessages) => {
                    return Err(CommError::Fatal(
                        format!("chunked message truncated at {} of {size} bytes", payload.len())
                            .into(),
                    ))
                }
                Err(e) => return Err(e),
            };

            payload.extend_from_slice(&chunk);
        }

        if payload.len() != size {
            return Err(CommError::Fatal(
                format!("chunked message overran: {} of {size} bytes", payload.len()).into(),
            ));
        }

        msg.header.remove(SIZE_KEY);
        msg.header.remove(CHUNKED_KEY);
        msg.payload = payload.freeze();
        Ok(msg)
    }

    /// Signs `model` off this channel.
    fn send_eof(&self, model: &str) -> Result<(), CommError> {
        self.send(&CommMessage::eof().set(MODEL_KEY, model))
    }

    #[doc(hidden)]
    fn encode_frame(&self, msg: &CommMessage) -> Result<Bytes, CommError> {
        match msg.flag {
            Flag::Eof => Ok(envelope::encode(&msg.header, envelope::EOF_PAYLOAD)?),
            Flag::Success => {
                self.check_type(msg.flag, &msg.header)?;
                Ok(envelope::encode(&msg.header, &msg.payload)?)
            }
            Flag::Empty | Flag::Failure => {
                Err(CommError::Config(format!("can't send a {:?} message", msg.flag).into()))
            }
        }
    }

    #[doc(hidden)]
    fn decode_frame(&self, frame: &Bytes) -> Result<CommMessage, CommError> {
        if frame.is_empty() {
            return Ok(CommMessage::empty());
        }

        let (header, payload) = envelope::decode(frame)?;
        if payload == envelope::EOF_PAYLOAD {
            return Ok(CommMessage { flag: Flag::Eof, payload: Bytes::new(), header });
        }

        self.check_type(Flag::Success, &header)?;
        Ok(CommMessage::with_header(payload, header))
    }

    /// Validates typed metadata against the configured definition. Control messages, and
    /// messages that don't declare a `typename`, pass through.
    #[doc(hidden)]
    fn check_type(&self, flag: Flag, header: &Header) -> Result<(), CommError> {
        let Some(typedef) = &self.config().typedef else { return Ok(()) };
        let is_raw = header.get(crate::message::RAW_KEY) == Some(&Value::Bool(true));
        if flag != Flag::Success || is_raw {
            return Ok(());
        }
        if !header.contains_key(TYPENAME_KEY) {
            return Ok(());
        }

        let schema = types::validate_typedef(typedef)?;
        schema.verify_encoded(header, Some(typedef))?;
        Ok(())
    }
}

// ========================================================== CommConfig ===|

impl CommConfig {
    pub fn new(name: impl Into<String>, kind: impl Into<String>, direction: Direction) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            direction,
            address: None,
            typedef: None,
            max_msg_size: None,
            dont_open: false,
        }
    }

    pub fn send(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self::new(name, kind, Direction::Send)
    }

    pub fn recv(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self::new(name, kind, Direction::Recv)
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_typedef(mut self, typedef: TypeDef) -> Self {
        self.typedef = Some(typedef);
        self
    }

    pub fn with_max_msg_size(mut self, size: usize) -> Self {
        self.max_msg_size = Some(size);
        self
    }

    pub fn with_dont_open(mut self, dont_open: bool) -> Self {
        self.dont_open = dont_open;
        self
    }

    /// Same channel, other direction.
    pub fn opposite(&self) -> Self {
        Self {
            direction: self.direction.flip(),
            dont_open: false,
            ..self.clone()
        }
    }

    /// Fails when the definition is set but can't be resolved or validated.
    pub fn validate(&self) -> Result<(), CommError> {
        if self.kind.is_empty() {
            return Err(CommError::Config("comm kind must not be empty".into()));
        }
        if let Some(typedef) = &self.typedef {
            types::validate_typedef(typedef)?;
        }
        Ok(())
    }
}

impl Direction {
    pub fn flip(self) -> Self {
        match self {
            Self::Send => Self::Recv,
            Self::Recv => Self::Send,
        }
    }
}

fn chunked_size(header: &Header) -> Option<usize> {
    if header.get(CHUNKED_KEY).and_then(Value::as_bool) != Some(true) {
        return None;
    }
    header.get(SIZE_KEY).and_then(Value::as_u64).map(|x| usize::try_from(x).unwrap_or(usize::MAX))
}
