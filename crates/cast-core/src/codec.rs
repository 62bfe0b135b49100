//! Length-prefixed protobuf framing for the control channel.
//!
//! Wire format: `[4-byte big-endian length][CastMessage protobuf]`

use prost::Message;

use crate::envelope::CastMessage;
use crate::error::{CastError, CastResult};

/// Receivers reject anything larger than 64 KiB.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Encode an envelope into a length-prefixed frame.
pub fn frame_encode(message: &CastMessage) -> CastResult<Vec<u8>> {
    let len = message.encoded_len();
    if len > MAX_FRAME_LEN {
        return Err(CastError::Serialization(format!(
            "message of {len} bytes exceeds frame limit of {MAX_FRAME_LEN}"
        )));
    }

    let mut frame = Vec::with_capacity(4 + len);
    frame.extend_from_slice(&(len as u32).to_be_bytes());
    message.encode(&mut frame)?;
    Ok(frame)
}

/// Read the body length out of a frame header.
///
/// Zero is a valid length (a keepalive artifact) and is returned as-is.
pub fn frame_len(header: [u8; 4]) -> CastResult<usize> {
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(CastError::InvalidMessage(format!(
            "frame length {len} exceeds limit of {MAX_FRAME_LEN}"
        )));
    }
    Ok(len)
}

/// Decode a frame body (without length prefix) into an envelope.
pub fn message_decode(data: &[u8]) -> CastResult<CastMessage> {
    Ok(CastMessage::decode(data)?)
}
