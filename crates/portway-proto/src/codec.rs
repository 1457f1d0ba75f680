//! Frame codec
//!
//! Stateless mapping between a [`TunnelMessage`] and the opaque frames the
//! transport carries. Both tunnel endpoints must use the same codec.

use crate::{TunnelMessage, MAX_FRAME_SIZE};
use bytes::Bytes;
use thiserror::Error;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Serialization failed: {0}")]
    Serialize(String),
}

/// Bincode-backed tunnel message codec
pub struct TunnelCodec;

impl TunnelCodec {
    /// Encode a message into one transport frame
    pub fn encode(msg: &TunnelMessage) -> Result<Bytes, CodecError> {
        let buf = bincode::serialize(msg).map_err(|e| CodecError::Serialize(e.to_string()))?;
        if buf.len() > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(buf.len()));
        }
        Ok(Bytes::from(buf))
    }

    /// Decode one transport frame
    ///
    /// Fails without partial state when the frame is not a valid message.
    pub fn decode(frame: &[u8]) -> Result<TunnelMessage, CodecError> {
        if frame.len() > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(frame.len()));
        }
        bincode::deserialize(frame).map_err(|e| CodecError::MalformedFrame(e.to_string()))
    }
}
