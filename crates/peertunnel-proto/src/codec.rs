//! Codec for encoding/decoding tunnel messages

use crate::messages::TunnelMessage;
use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Tunnel message codec
pub struct TunnelCodec;

impl TunnelCodec {
    /// Maximum message size
    pub const MAX_MESSAGE_SIZE: usize = crate::MAX_FRAME_SIZE as usize;

    /// Length prefix size
    pub const HEADER_SIZE: usize = 4;

    /// Encode a tunnel message to bytes
    ///
    /// Format: [length: u32][payload: bincode serialized message]
    pub fn encode(msg: &TunnelMessage) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::new();
        Self::encode_into(msg, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Append an encoded message to `buf`
    pub fn encode_into(msg: &TunnelMessage, buf: &mut BytesMut) -> Result<(), CodecError> {
        let payload = bincode::serialize(msg)?;

        if payload.len() > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(payload.len()));
        }

        buf.reserve(Self::HEADER_SIZE + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&payload);

        Ok(())
    }

    /// Decode a tunnel message from bytes
    ///
    /// Returns Ok(Some(message)) if a complete message was decoded,
    /// Ok(None) if more data is needed,
    /// Err on error
    pub fn decode(buf: &mut BytesMut) -> Result<Option<TunnelMessage>, CodecError> {
        if buf.len() < Self::HEADER_SIZE {
            return Ok(None);
        }

        let mut length_bytes = [0u8; Self::HEADER_SIZE];
        length_bytes.copy_from_slice(&buf[..Self::HEADER_SIZE]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(length));
        }

        if buf.len() < Self::HEADER_SIZE + length {
            buf.reserve(Self::HEADER_SIZE + length - buf.len());
            return Ok(None);
        }

        let _ = buf.split_to(Self::HEADER_SIZE);
        let msg_bytes = buf.split_to(length);

        let msg: TunnelMessage = bincode::deserialize(&msg_bytes)?;

        Ok(Some(msg))
    }

    /// Try to decode multiple messages from buffer
    pub fn decode_all(buf: &mut BytesMut) -> Result<Vec<TunnelMessage>, CodecError> {
        let mut messages = Vec::new();

        while let Some(msg) = Self::decode(buf)? {
            messages.push(msg);
        }

        Ok(messages)
    }
}
