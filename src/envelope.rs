//! # Envelope
//!
//! Wire representation of one message: `<header JSON><SEPARATOR><payload bytes>`.
//!
//! The separator is framed by `0x1E` (record separator). `serde_json` escapes every control byte
//! inside strings and never emits one between tokens, so the separator can't appear in a
//! serialized header. The payload may contain anything; splitting always happens at the first
//! occurrence.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{error::TypeError, message::Header};

pub const SEPARATOR: &[u8] = b"\x1eRB_HEAD\x1e";

/// Reserved payload of an end-of-file frame.
pub const EOF_PAYLOAD: &[u8] = b"EOF!::!EOF";

/// Serializes `header` with sorted keys, then appends the separator and `payload`.
pub fn encode(header: &Header, payload: &[u8]) -> Result<Bytes, TypeError> {
    let head = canonical_json(header)?;
    let mut buf = BytesMut::with_capacity(head.len() + SEPARATOR.len() + payload.len());

    buf.put_slice(&head);
    buf.put_slice(SEPARATOR);
    buf.put_slice(payload);

    Ok(buf.freeze())
}

/// Splits a frame into header and payload. A zero-length frame decodes to an empty header and
/// an empty payload.
pub fn decode(frame: &Bytes) -> Result<(Header, Bytes), TypeError> {
    if frame.is_empty() {
        return Ok((Header::new(), Bytes::new()));
    }

    let Some(pos) = find(frame, SEPARATOR) else {
        return Err(TypeError::MissingSeparator);
    };

    let header: Header = serde_json::from_slice(&frame[..pos])?;
    let payload = frame.slice(pos + SEPARATOR.len()..);

    Ok((header, payload))
}

/// Number of bytes the envelope adds around a payload for the given header.
pub fn overhead(header: &Header) -> Result<usize, TypeError> {
    Ok(canonical_json(header)?.len() + SEPARATOR.len())
}

fn canonical_json(header: &Header) -> Result<Vec<u8>, TypeError> {
    // `serde_json::Map` is ordered by key unless `preserve_order` is enabled somewhere in the
    // dependency graph; sort explicitly so the output never depends on that.
    let sorted: std::collections::BTreeMap<&String, &serde_json::Value> = header.iter().collect();
    Ok(serde_json::to_vec(&sorted)?)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
