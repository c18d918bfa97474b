//! Wire messages: a fixed header plus a serialized value payload.

use crate::serialize::{deserialize_bytes, serialize_to_bytes, CodecError};
use crate::Value;

use super::framing::FramingError;

/// Size of the encoded header in bytes.
pub const HEADER_LEN: usize = 16;

/// Fixed message header, big-endian on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub object_id: u32,
    pub command_id: u32,
    pub cookie: i32,
    pub payload_len: u32,
}

impl Header {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&self.object_id.to_be_bytes());
        out[4..8].copy_from_slice(&self.command_id.to_be_bytes());
        out[8..12].copy_from_slice(&self.cookie.to_be_bytes());
        out[12..16].copy_from_slice(&self.payload_len.to_be_bytes());
        out
    }

    pub fn decode(raw: &[u8; HEADER_LEN]) -> Self {
        let word = |at: usize| [raw[at], raw[at + 1], raw[at + 2], raw[at + 3]];
        Self {
            object_id: u32::from_be_bytes(word(0)),
            command_id: u32::from_be_bytes(word(4)),
            cookie: i32::from_be_bytes(word(8)),
            payload_len: u32::from_be_bytes(word(12)),
        }
    }
}

/// A complete message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub object_id: u32,
    pub command_id: u32,
    pub cookie: i32,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(object_id: u32, command_id: u32, cookie: i32, payload: Vec<u8>) -> Self {
        Self {
            object_id,
            command_id,
            cookie,
            payload,
        }
    }

    /// A message whose payload is `value` serialized.
    pub fn with_value(object_id: u32, command_id: u32, cookie: i32, value: &Value) -> Result<Self, CodecError> {
        Ok(Self::new(object_id, command_id, cookie, serialize_to_bytes(value)?))
    }

    /// Decode the payload.
    pub fn value(&self) -> Result<Value, CodecError> {
        deserialize_bytes(&self.payload)
    }

    /// Header describing this message.
    ///
    /// # Errors
    ///
    /// Returns `FramingError::PayloadTooLarge` if the payload exceeds
    /// `max_payload`.
    pub fn header(&self, max_payload: u32) -> Result<Header, FramingError> {
        let len = self.payload.len();
        match u32::try_from(len) {
            Ok(payload_len) if payload_len <= max_payload => Ok(Header {
                object_id: self.object_id,
                command_id: self.command_id,
                cookie: self.cookie,
                payload_len,
            }),
            _ => Err(FramingError::PayloadTooLarge {
                len: len as u64,
                max: max_payload,
            }),
        }
    }

    /// Header and payload as one contiguous buffer.
    pub fn to_bytes(&self, max_payload: u32) -> Result<Vec<u8>, FramingError> {
        let header = self.header(max_payload)?;
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.extend_from_slice(&header.encode());
        out.extend_from_slice(&self.payload);
        Ok(out)
    }
}
