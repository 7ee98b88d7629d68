//! Message encoding and decoding for network transport.
//!
//! # Wire Format
//!
//! ```text
//! [version: u8][payload: bincode-encoded ConsensusMessage]
//! ```
//!
//! The payload is the tagged union itself, so dispatch is total: decoding
//! yields exactly one protocol message variant or an error. Framing
//! (length-delimiting on a stream) is the transport's concern.

use crate::ConsensusMessage;
use thiserror::Error;

/// Current wire format version.
pub const WIRE_VERSION: u8 = 1;

/// Errors that can occur during message encoding/decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Version byte did not match [`WIRE_VERSION`].
    #[error("unknown wire version: {0}")]
    UnknownVersion(u8),

    /// Input shorter than the version prefix.
    #[error("message too short")]
    MessageTooShort,

    /// Payload failed to decode.
    #[error("decode error: {0}")]
    Decode(String),

    /// Payload failed to encode.
    #[error("encode error: {0}")]
    Encode(String),
}

/// Encode a message to wire format.
pub fn encode_message(message: &ConsensusMessage) -> Result<Vec<u8>, CodecError> {
    let payload = bincode::serialize(message).map_err(|e| CodecError::Encode(e.to_string()))?;

    let mut bytes = Vec::with_capacity(1 + payload.len());
    bytes.push(WIRE_VERSION);
    bytes.extend(payload);
    Ok(bytes)
}

/// Decode a message from wire format.
pub fn decode_message(data: &[u8]) -> Result<ConsensusMessage, CodecError> {
    if data.is_empty() {
        return Err(CodecError::MessageTooShort);
    }

    let version = data[0];
    if version != WIRE_VERSION {
        return Err(CodecError::UnknownVersion(version));
    }

    bincode::deserialize(&data[1..]).map_err(|e| CodecError::Decode(e.to_string()))
}
