//! Wire encoding of values.
//!
//! Every value is a one-byte [`ValueType`] tag followed by its payload. All
//! multi-byte fields are big-endian and every field is byte aligned.
//!
//! | type      | payload                                                          |
//! |-----------|------------------------------------------------------------------|
//! | none      | nothing                                                          |
//! | error     | `u32` length, message bytes                                      |
//! | int64     | `i64`                                                            |
//! | float     | IEEE-754 single as `u32`                                         |
//! | string    | `u32` length, bytes (no terminator)                              |
//! | binary    | `u32` length, bytes                                              |
//! | list      | restrict tag `u8` (`0` = none), `u32` count, tagged entries      |
//! | dict      | `u32` count, then per entry `u32` key length, key, tagged value  |
//! | coll      | `u32` type, attributes as a dict payload, `u32` id count, `i64` ids, `u32` operand count, tagged operands |
//! | bitbuffer | `u32` length in bits, `ceil(bits / 8)` bytes                     |
//!
//! Decoding never reads past the input: declared lengths and counts are
//! checked against the remaining bytes before anything is allocated, and
//! nesting is capped at [`MAX_DEPTH`].

use indexmap::IndexMap;
use thiserror::Error;

use crate::value::{BitBuffer, BitBufferError, Coll, CollType, Dict, Node, Value, ValueType};

/// Deepest container nesting accepted in either direction.
pub const MAX_DEPTH: usize = 128;

/// Failures while encoding or decoding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("truncated input: needed {needed} bits, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("unknown type tag {0}")]
    UnknownTag(u8),

    #[error("unknown collection type {0}")]
    UnknownCollType(u32),

    #[error("declared count {count} exceeds the {remaining} bytes remaining")]
    CountTooLarge { count: usize, remaining: usize },

    #[error("nesting deeper than {MAX_DEPTH}")]
    TooDeep,

    #[error("payload of {0} bytes does not fit a 32-bit length")]
    TooLong(usize),

    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),

    #[error("cannot deserialize a {0} value")]
    NotSerialized(ValueType),

    #[error("malformed payload: {0}")]
    Malformed(String),
}

impl From<BitBufferError> for CodecError {
    fn from(err: BitBufferError) -> Self {
        match err {
            BitBufferError::Underflow {
                requested,
                available,
            } => CodecError::Truncated {
                needed: requested,
                available,
            },
            other => CodecError::Malformed(other.to_string()),
        }
    }
}

/// Encode `value` into a fresh bitbuffer value.
pub fn serialize(value: &Value) -> Result<Value, CodecError> {
    let mut bb = BitBuffer::new();
    encode(&mut bb, value, 0)?;
    Ok(Value::from_bitbuffer(bb))
}

/// Encode `value` straight to bytes.
pub fn serialize_to_bytes(value: &Value) -> Result<Vec<u8>, CodecError> {
    let mut bb = BitBuffer::new();
    encode(&mut bb, value, 0)?;
    Ok(bb.into_bytes())
}

/// Decode a value previously produced by [`serialize`].
///
/// Accepts a bitbuffer or binary value; decoding always starts at the first
/// byte regardless of the bitbuffer cursor.
pub fn deserialize(value: &Value) -> Result<Value, CodecError> {
    let bytes = match value.get_type() {
        ValueType::BitBuffer => value.get_bitbuffer(),
        ValueType::Binary => value.get_binary(),
        other => return Err(CodecError::NotSerialized(other)),
    }
    .ok_or(CodecError::NotSerialized(value.get_type()))?;
    deserialize_bytes(&bytes)
}

/// Decode exactly one value from `bytes`.
pub fn deserialize_bytes(bytes: &[u8]) -> Result<Value, CodecError> {
    let mut dec = Decoder {
        bb: BitBuffer::from_bytes_ro(bytes),
    };
    let value = decode(&mut dec, 0)?;
    match dec.remaining_bytes() {
        0 => Ok(value),
        n => Err(CodecError::TrailingBytes(n)),
    }
}

fn put_u32(bb: &mut BitBuffer, v: u32) -> Result<(), CodecError> {
    Ok(bb.put_bits(32, i64::from(v))?)
}

fn put_len(bb: &mut BitBuffer, len: usize) -> Result<(), CodecError> {
    let len32 = u32::try_from(len).map_err(|_| CodecError::TooLong(len))?;
    put_u32(bb, len32)
}

fn put_bytes(bb: &mut BitBuffer, bytes: &[u8]) -> Result<(), CodecError> {
    put_len(bb, bytes.len())?;
    Ok(bb.put_data(bytes)?)
}

fn encode_entries<'a, I>(bb: &mut BitBuffer, count: usize, entries: I, depth: usize) -> Result<(), CodecError>
where
    I: Iterator<Item = (&'a String, &'a Value)>,
{
    put_len(bb, count)?;
    for (key, value) in entries {
        put_bytes(bb, key.as_bytes())?;
        encode(bb, value, depth + 1)?;
    }
    Ok(())
}

fn encode(bb: &mut BitBuffer, value: &Value, depth: usize) -> Result<(), CodecError> {
    if depth > MAX_DEPTH {
        return Err(CodecError::TooDeep);
    }
    bb.put_bits(8, i64::from(value.get_type().tag()))?;

    match value.node() {
        Node::None => {}
        Node::Error(message) => put_bytes(bb, message.as_bytes())?,
        Node::Int64(i) => bb.put_bits(64, *i)?,
        Node::Float(f) => put_u32(bb, f.to_bits())?,
        Node::String(bytes) | Node::Binary(bytes) => put_bytes(bb, bytes)?,
        Node::List(list) => {
            let list = list.read_recursive();
            let restrict = list.restrict().map_or(0, ValueType::tag);
            bb.put_bits(8, i64::from(restrict))?;
            put_len(bb, list.items().len())?;
            for item in list.items() {
                encode(bb, item, depth + 1)?;
            }
        }
        Node::Dict(dict) => {
            let dict = dict.read_recursive();
            encode_entries(bb, dict.len(), dict.iter(), depth)?;
        }
        Node::Coll(coll) => {
            let coll = coll.read_recursive();
            put_u32(bb, coll.kind().as_u32())?;
            encode_entries(bb, coll.attributes().len(), coll.attributes().iter(), depth)?;
            put_len(bb, coll.idlist().len())?;
            for id in coll.idlist() {
                bb.put_bits(64, *id)?;
            }
            put_len(bb, coll.operands().len())?;
            for operand in coll.operands() {
                encode(bb, operand, depth + 1)?;
            }
        }
        Node::BitBuffer(inner) => {
            let inner = inner.lock();
            put_len(bb, inner.len())?;
            bb.put_data(inner.as_bytes())?;
        }
    }
    Ok(())
}

struct Decoder {
    bb: BitBuffer,
}

impl Decoder {
    fn remaining_bytes(&self) -> usize {
        self.bb.remaining() / 8
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.bb.get_bits(8)? as u8)
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        Ok(self.bb.get_bits(32)? as u32)
    }

    fn i64(&mut self) -> Result<i64, CodecError> {
        Ok(self.bb.get_bits(64)?)
    }

    /// A `u32` count of items each at least `min_size` bytes long.
    fn count(&mut self, min_size: usize) -> Result<usize, CodecError> {
        let count = self.u32()? as usize;
        let remaining = self.remaining_bytes();
        if count.saturating_mul(min_size) > remaining {
            return Err(CodecError::CountTooLarge { count, remaining });
        }
        Ok(count)
    }

    /// A `u32` length followed by that many bytes.
    fn bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.u32()? as usize;
        Ok(self.bb.get_data(len)?)
    }

    fn string_key(&mut self) -> Result<String, CodecError> {
        String::from_utf8(self.bytes()?).map_err(|_| CodecError::Malformed("key is not valid UTF-8".into()))
    }

    fn entries(&mut self, depth: usize) -> Result<IndexMap<String, Value>, CodecError> {
        // Shortest entry: empty key (4 bytes) and a bare tag.
        let count = self.count(5)?;
        let mut entries = IndexMap::with_capacity(count);
        for _ in 0..count {
            let key = self.string_key()?;
            let value = decode(self, depth + 1)?;
            if entries.insert(key, value).is_some() {
                return Err(CodecError::Malformed("duplicate key".into()));
            }
        }
        Ok(entries)
    }
}

fn decode(dec: &mut Decoder, depth: usize) -> Result<Value, CodecError> {
    if depth > MAX_DEPTH {
        return Err(CodecError::TooDeep);
    }
    let tag = dec.u8()?;
    let kind = ValueType::from_tag(tag).ok_or(CodecError::UnknownTag(tag))?;

    let value = match kind {
        ValueType::None => Value::new_none(),
        ValueType::Error => Value::new_error(String::from_utf8_lossy(&dec.bytes()?)),
        ValueType::Int64 => Value::new_int(dec.i64()?),
        ValueType::Float => Value::new_float(f32::from_bits(dec.u32()?)),
        ValueType::String => Value::new_string_bytes(dec.bytes()?),
        ValueType::Binary => Value::new_binary(dec.bytes()?),
        ValueType::List => {
            let restrict = match dec.u8()? {
                0 => None,
                raw => Some(ValueType::from_tag(raw).ok_or(CodecError::UnknownTag(raw))?),
            };
            let count = dec.count(1)?;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                let item = decode(dec, depth + 1)?;
                if let Some(restricted) = restrict {
                    if !item.is_type(restricted) {
                        return Err(CodecError::Malformed(format!(
                            "{} entry in list restricted to {restricted}",
                            item.get_type()
                        )));
                    }
                }
                items.push(item);
            }
            Value::from_list(items, restrict)
        }
        ValueType::Dict => Value::from_dict(Dict::from_entries(dec.entries(depth)?)),
        ValueType::Coll => decode_coll(dec, depth)?,
        ValueType::BitBuffer => {
            let bits = dec.u32()? as usize;
            let data = dec.bb.get_data(bits.div_ceil(8))?;
            let mut bb = BitBuffer::new();
            bb.put_data(&data[..bits / 8])?;
            let tail = bits % 8;
            if tail != 0 {
                let last = data[bits / 8];
                bb.put_bits(tail as u32, i64::from(last >> (8 - tail)))?;
            }
            bb.rewind();
            Value::from_bitbuffer(bb)
        }
    };
    Ok(value)
}

fn decode_coll(dec: &mut Decoder, depth: usize) -> Result<Value, CodecError> {
    let raw = dec.u32()?;
    let kind = CollType::from_u32(raw).ok_or(CodecError::UnknownCollType(raw))?;

    let attributes = dec.entries(depth)?;
    if let Some((key, _)) = attributes
        .iter()
        .find(|(_, v)| !matches!(v.get_type(), ValueType::String | ValueType::Int64))
    {
        return Err(CodecError::Malformed(format!("attribute {key} is not a string or int")));
    }

    let id_count = dec.count(8)?;
    let mut idlist = Vec::with_capacity(id_count);
    for _ in 0..id_count {
        idlist.push(dec.i64()?);
    }

    let operand_count = dec.count(1)?;
    if operand_count > 0 && !kind.accepts_operands() {
        return Err(CodecError::Malformed(format!("{kind:?} collection with operands")));
    }
    let mut operands = Vec::with_capacity(operand_count);
    for _ in 0..operand_count {
        let operand = decode(dec, depth + 1)?;
        if !operand.is_type(ValueType::Coll) {
            return Err(CodecError::Malformed(format!(
                "{} operand in collection",
                operand.get_type()
            )));
        }
        operands.push(operand);
    }

    Ok(Value::from_coll(Coll::from_parts(kind, attributes, idlist, operands)))
}
