//! # Request/response routing
//!
//! Clients send requests into a [`RequestDriver`], which forwards them to a server over one
//! shared channel. For each request, a short-lived [`ResponseDriver`] is created; the request is
//! rewritten so the server replies to that driver's input, and the response driver carries the
//! single reply back to the client's own reply channel.
//!
//! Clients join and leave the shared server channel individually. The server is told with
//! [`CLIENT_BEGIN`] and [`CLIENT_END`] sentinels, and only receives EOF once the last client is
//! gone.

use serde_json::Value;

use crate::{
    comm::{new_comm, CommConfig},
    error::CommError,
    message::{CommMessage, MODEL_KEY, RAW_KEY},
};

pub use self::{
    request::{RequestDriver, RequestDriverConfig, RequestRelay, ResponseRoutes},
    response::{ResponseDriver, ResponseRelay, RouteKey},
};

mod request;
mod response;

/// Payload announcing that a client attached to the server channel.
pub const CLIENT_BEGIN: &[u8] = b"RB_BEGIN_CLIENT";

/// Payload announcing that a client signed off the server channel.
pub const CLIENT_END: &[u8] = b"RB_END_CLIENT";

/// Header key with the address the server must reply to.
pub const RESPONSE_ADDRESS_KEY: &str = "response_address";

/// Header key correlating a reply with its request.
pub const REQUEST_ID_KEY: &str = "request_id";

/// Header key with the transport kind of the reply address.
pub const COMMTYPE_KEY: &str = "commtype";

/// Builds a client lifecycle sentinel. Sentinels are raw, so typed comms let them through.
pub fn client_sentinel(payload: &'static [u8], model: &str) -> CommMessage {
    CommMessage::new(payload).set(RAW_KEY, true).set(MODEL_KEY, model)
}

pub fn is_client_begin(msg: &CommMessage) -> bool {
    msg.is_raw() && msg.payload == CLIENT_BEGIN
}

pub fn is_client_end(msg: &CommMessage) -> bool {
    msg.is_raw() && msg.payload == CLIENT_END
}

/// Sends `reply` to the route carried by `request`. The request's `request_id` is echoed back.
///
/// Meant for servers: it opens a short-lived comm to the response driver of that request.
pub fn reply_to(request: &CommMessage, mut reply: CommMessage) -> Result<(), CommError> {
    let address = request
        .header_str(RESPONSE_ADDRESS_KEY)
        .ok_or(CommError::Config("request carries no response address".into()))?;
    let kind = request
        .header_str(COMMTYPE_KEY)
        .ok_or(CommError::Config("request carries no reply comm type".into()))?;

    if let Some(id) = request.header.get(REQUEST_ID_KEY) {
        reply.header.insert(REQUEST_ID_KEY.into(), id.clone());
    }
    reply.header.insert(RESPONSE_ADDRESS_KEY.into(), Value::from(address));

    let comm = new_comm(CommConfig::send(format!("reply.{address}"), kind).with_address(address))?;
    let result = comm.send_chunked(&reply);
    comm.close();

    result
}
