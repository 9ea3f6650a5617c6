//! Message framing and argument encoding.
//!
//! Frame format: `[length: u32 LE][message_type: u8][postcard payload]`,
//! where `length` counts the tag and payload but not itself.

use crate::args::RpcArgs;
use crate::error::RpcError;
use crate::protocol::RpcMessage;
use serde::de::DeserializeOwned;
use serde::Serialize;

const HEADER_LEN: usize = 5;

/// Encode a call's argument tuple.
pub fn encode_args<A: RpcArgs>(args: &A) -> Result<Vec<u8>, RpcError> {
    encode_value(args)
}

/// Decode a payload into an argument tuple or return value.
pub fn decode_args<T: DeserializeOwned>(payload: &[u8]) -> Result<T, RpcError> {
    Ok(postcard::from_bytes(payload)?)
}

pub(crate) fn encode_value<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, RpcError> {
    Ok(postcard::to_allocvec(value)?)
}

/// Encode a message with its length prefix.
pub fn encode_message(msg: &RpcMessage) -> Result<Vec<u8>, RpcError> {
    let payload = postcard::to_allocvec(msg)?;

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    let length = u32::try_from(1 + payload.len())
        .map_err(|_| RpcError::Codec(format!("Frame too large: {} bytes", payload.len())))?;
    frame.extend_from_slice(&length.to_le_bytes());
    frame.push(message_type_tag(msg));
    frame.extend_from_slice(&payload);

    Ok(frame)
}

/// Decode a message from frame data.
///
/// Never panics on malformed input.
pub fn decode_message(data: &[u8]) -> Result<RpcMessage, RpcError> {
    if data.len() < HEADER_LEN {
        return Err(RpcError::Codec(format!(
            "Frame too short: {} bytes (minimum {HEADER_LEN})",
            data.len()
        )));
    }

    let length = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if length == 0 {
        return Err(RpcError::Codec("Frame length excludes the type tag".into()));
    }
    if data.len() - 4 < length {
        return Err(RpcError::Codec(format!(
            "Incomplete frame: expected {} bytes, got {}",
            4 + length,
            data.len()
        )));
    }

    let tag = data[4];
    let msg: RpcMessage = postcard::from_bytes(&data[HEADER_LEN..4 + length])?;
    if message_type_tag(&msg) != tag {
        return Err(RpcError::Codec(format!(
            "Frame tag {tag} does not match {} payload",
            msg.kind()
        )));
    }

    Ok(msg)
}

/// Message type tag carried in the frame header.
pub fn message_type_tag(msg: &RpcMessage) -> u8 {
    match msg {
        RpcMessage::Invoke(_) => 0,
        RpcMessage::Routed(_) => 1,
        RpcMessage::Response(_) => 2,
        RpcMessage::DeliveryReport(_) => 3,
    }
}
