//! The `xmmsv` value: a reference-counted, tagged variant.
//!
//! A [`Value`] is a cheap handle onto shared, immutable-typed storage. Cloning
//! the handle is the `ref` operation and dropping it is `unref`; the payload
//! is torn down (children released recursively) when the last handle goes.
//!
//! # Ownership convention
//!
//! Container setters (`list_append`, `dict_set`, `coll_add_operand`, ...)
//! take `&Value` and store a new reference. The caller keeps its own handle
//! and drops it when it no longer needs it:
//!
//! ```
//! use xmmsv_ipc::Value;
//!
//! let list = Value::new_list();
//! let entry = Value::new_int(42);
//! list.list_append(&entry).unwrap();
//! assert_eq!(entry.ref_count(), 2);
//! drop(entry);
//! assert_eq!(list.list_get(0).unwrap().get_int(), Some(42));
//! ```
//!
//! # Threads
//!
//! Reference counts are atomic and container payloads sit behind
//! `parking_lot` locks, so values may be shared between threads. A value can
//! never contain itself: inserting a container into its own subtree fails
//! with [`ValueError::Cycle`].

mod bitbuffer;
mod coll;
mod dict;
mod json;
mod list;
mod util;

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use thiserror::Error;

pub use bitbuffer::{BitBuffer, BitBufferError, MAX_FIELD_BITS};
pub use coll::CollType;
pub use util::{decode_url, utf8_validate, DEFAULT_SOURCE_PREFERENCE};

pub(crate) use coll::Coll;
pub(crate) use dict::Dict;
pub(crate) use list::List;

/// Kind tag of a [`Value`]. The discriminants are the wire tag bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValueType {
    None = 0,
    Error = 1,
    Int64 = 2,
    String = 3,
    Coll = 4,
    Binary = 5,
    List = 6,
    Dict = 7,
    BitBuffer = 8,
    Float = 9,
}

impl ValueType {
    /// Wire tag byte.
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Map a wire tag byte back to a type.
    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => ValueType::None,
            1 => ValueType::Error,
            2 => ValueType::Int64,
            3 => ValueType::String,
            4 => ValueType::Coll,
            5 => ValueType::Binary,
            6 => ValueType::List,
            7 => ValueType::Dict,
            8 => ValueType::BitBuffer,
            9 => ValueType::Float,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ValueType::None => "none",
            ValueType::Error => "error",
            ValueType::Int64 => "int64",
            ValueType::String => "string",
            ValueType::Coll => "coll",
            ValueType::Binary => "binary",
            ValueType::List => "list",
            ValueType::Dict => "dict",
            ValueType::BitBuffer => "bitbuffer",
            ValueType::Float => "float",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures of value accessors and mutators.
///
/// These are local and recoverable; none of them invalidates the value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValueError {
    /// Operation requires a different kind of value.
    #[error("expected {expected} value, found {found}")]
    TypeMismatch { expected: ValueType, found: ValueType },

    /// List is restricted to another element type.
    #[error("list is restricted to {restricted} entries, got {found}")]
    Restricted { restricted: ValueType, found: ValueType },

    /// Position outside the container.
    #[error("index {index} out of range for length {len}")]
    IndexOutOfRange { index: isize, len: usize },

    /// Dict or attribute key not present.
    #[error("no such key: {0}")]
    MissingKey(String),

    /// Insertion would make a value reachable from itself.
    #[error("insertion would create a reference cycle")]
    Cycle,

    /// Collection operand rules violated.
    #[error("invalid collection operand: {0}")]
    InvalidOperand(String),

    #[error(transparent)]
    BitBuffer(#[from] BitBufferError),
}

pub(crate) enum Node {
    None,
    Error(String),
    Int64(i64),
    Float(f32),
    String(Vec<u8>),
    Binary(Vec<u8>),
    List(RwLock<List>),
    Dict(RwLock<Dict>),
    Coll(RwLock<Coll>),
    BitBuffer(Mutex<BitBuffer>),
}

/// A shared handle onto a tagged value.
#[derive(Clone)]
pub struct Value(Arc<Node>);

/// A non-owning handle; does not keep the payload alive.
#[derive(Clone)]
pub struct WeakValue(Weak<Node>);

impl WeakValue {
    /// Recover a strong handle if the value is still alive.
    pub fn upgrade(&self) -> Option<Value> {
        self.0.upgrade().map(Value)
    }
}

impl Value {
    pub(crate) fn from_node(node: Node) -> Self {
        Value(Arc::new(node))
    }

    pub(crate) fn node(&self) -> &Node {
        &self.0
    }

    pub fn new_none() -> Self {
        Self::from_node(Node::None)
    }

    /// An error value carrying a message.
    pub fn new_error(message: impl Into<String>) -> Self {
        Self::from_node(Node::Error(message.into()))
    }

    pub fn new_int(value: i64) -> Self {
        Self::from_node(Node::Int64(value))
    }

    pub fn new_float(value: f32) -> Self {
        Self::from_node(Node::Float(value))
    }

    pub fn new_string(value: impl Into<String>) -> Self {
        Self::from_node(Node::String(value.into().into_bytes()))
    }

    /// A string from raw bytes. UTF-8 is not checked here; see [`utf8_validate`].
    pub fn new_string_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self::from_node(Node::String(bytes.into()))
    }

    pub fn new_binary(bytes: impl Into<Vec<u8>>) -> Self {
        Self::from_node(Node::Binary(bytes.into()))
    }

    /// An empty, writable bitbuffer.
    pub fn new_bitbuffer() -> Self {
        Self::from_bitbuffer(BitBuffer::new())
    }

    /// A read-only bitbuffer over a copy of `bytes`.
    pub fn new_bitbuffer_ro(bytes: impl Into<Vec<u8>>) -> Self {
        Self::from_bitbuffer(BitBuffer::from_bytes_ro(bytes))
    }

    pub fn from_bitbuffer(bb: BitBuffer) -> Self {
        Self::from_node(Node::BitBuffer(Mutex::new(bb)))
    }

    pub fn get_type(&self) -> ValueType {
        match self.node() {
            Node::None => ValueType::None,
            Node::Error(_) => ValueType::Error,
            Node::Int64(_) => ValueType::Int64,
            Node::Float(_) => ValueType::Float,
            Node::String(_) => ValueType::String,
            Node::Binary(_) => ValueType::Binary,
            Node::List(_) => ValueType::List,
            Node::Dict(_) => ValueType::Dict,
            Node::Coll(_) => ValueType::Coll,
            Node::BitBuffer(_) => ValueType::BitBuffer,
        }
    }

    pub fn is_type(&self, kind: ValueType) -> bool {
        self.get_type() == kind
    }

    pub fn is_error(&self) -> bool {
        matches!(self.node(), Node::Error(_))
    }

    /// Message of an error value.
    pub fn get_error(&self) -> Option<String> {
        match self.node() {
            Node::Error(message) => Some(message.clone()),
            _ => None,
        }
    }

    pub fn get_int(&self) -> Option<i64> {
        match self.node() {
            Node::Int64(i) => Some(*i),
            _ => None,
        }
    }

    pub fn get_float(&self) -> Option<f32> {
        match self.node() {
            Node::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// String contents; invalid UTF-8 sequences are replaced.
    pub fn get_string(&self) -> Option<String> {
        match self.node() {
            Node::String(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
            _ => None,
        }
    }

    /// String contents as stored.
    pub fn get_string_bytes(&self) -> Option<Vec<u8>> {
        match self.node() {
            Node::String(bytes) => Some(bytes.clone()),
            _ => None,
        }
    }

    pub fn get_binary(&self) -> Option<Vec<u8>> {
        match self.node() {
            Node::Binary(bytes) => Some(bytes.clone()),
            _ => None,
        }
    }

    /// Number of live handles to this value.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    pub fn downgrade(&self) -> WeakValue {
        WeakValue(Arc::downgrade(&self.0))
    }

    /// Whether both handles refer to the same storage.
    pub fn ptr_eq(&self, other: &Value) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn mismatch(&self, expected: ValueType) -> ValueError {
        ValueError::TypeMismatch {
            expected,
            found: self.get_type(),
        }
    }

    /// Whether `target` is `self` or appears anywhere below it.
    pub(crate) fn reaches(&self, target: &Value) -> bool {
        if self.ptr_eq(target) {
            return true;
        }
        match self.node() {
            Node::List(list) => list.read_recursive().items().iter().any(|v| v.reaches(target)),
            Node::Dict(dict) => dict.read_recursive().values().any(|v| v.reaches(target)),
            Node::Coll(coll) => {
                let coll = coll.read_recursive();
                coll.operands().iter().any(|v| v.reaches(target))
                    || coll.attributes().values().any(|v| v.reaches(target))
            }
            _ => false,
        }
    }

    /// Reject `child` if storing it in `self` would close a loop.
    pub(crate) fn check_acyclic(&self, child: &Value) -> Result<(), ValueError> {
        if child.reaches(self) {
            Err(ValueError::Cycle)
        } else {
            Ok(())
        }
    }

    fn bitbuffer(&self) -> Result<&Mutex<BitBuffer>, ValueError> {
        match self.node() {
            Node::BitBuffer(bb) => Ok(bb),
            _ => Err(self.mismatch(ValueType::BitBuffer)),
        }
    }

    /// Run `f` against the bitbuffer payload.
    pub fn with_bitbuffer<R>(&self, f: impl FnOnce(&mut BitBuffer) -> R) -> Result<R, ValueError> {
        let bb = self.bitbuffer()?;
        let mut guard = bb.lock();
        Ok(f(&mut guard))
    }

    pub fn bitbuffer_put_bits(&self, bits: u32, value: i64) -> Result<(), ValueError> {
        Ok(self.bitbuffer()?.lock().put_bits(bits, value)?)
    }

    pub fn bitbuffer_get_bits(&self, bits: u32) -> Result<i64, ValueError> {
        Ok(self.bitbuffer()?.lock().get_bits(bits)?)
    }

    pub fn bitbuffer_put_data(&self, data: &[u8]) -> Result<(), ValueError> {
        Ok(self.bitbuffer()?.lock().put_data(data)?)
    }

    pub fn bitbuffer_get_data(&self, len: usize) -> Result<Vec<u8>, ValueError> {
        Ok(self.bitbuffer()?.lock().get_data(len)?)
    }

    pub fn bitbuffer_align(&self) -> Result<(), ValueError> {
        Ok(self.bitbuffer()?.lock().align()?)
    }

    pub fn bitbuffer_goto(&self, pos: usize) -> Result<(), ValueError> {
        Ok(self.bitbuffer()?.lock().goto(pos)?)
    }

    pub fn bitbuffer_rewind(&self) -> Result<(), ValueError> {
        self.with_bitbuffer(|bb| bb.rewind())
    }

    pub fn bitbuffer_end(&self) -> Result<(), ValueError> {
        self.with_bitbuffer(|bb| bb.end())
    }

    pub fn bitbuffer_pos(&self) -> Option<usize> {
        self.with_bitbuffer(|bb| bb.pos()).ok()
    }

    pub fn bitbuffer_len(&self) -> Option<usize> {
        self.with_bitbuffer(|bb| bb.len()).ok()
    }

    /// Copy of the written bytes of a bitbuffer.
    pub fn get_bitbuffer(&self) -> Option<Vec<u8>> {
        self.with_bitbuffer(|bb| bb.as_bytes().to_vec()).ok()
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::new_none()
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        if self.ptr_eq(other) {
            return true;
        }
        match (self.node(), other.node()) {
            (Node::None, Node::None) => true,
            (Node::Error(a), Node::Error(b)) => a == b,
            (Node::Int64(a), Node::Int64(b)) => a == b,
            (Node::Float(a), Node::Float(b)) => a.to_bits() == b.to_bits(),
            (Node::String(a), Node::String(b)) => a == b,
            (Node::Binary(a), Node::Binary(b)) => a == b,
            (Node::List(a), Node::List(b)) => *a.read_recursive() == *b.read_recursive(),
            (Node::Dict(a), Node::Dict(b)) => *a.read_recursive() == *b.read_recursive(),
            (Node::Coll(a), Node::Coll(b)) => *a.read_recursive() == *b.read_recursive(),
            (Node::BitBuffer(a), Node::BitBuffer(b)) => *a.lock() == *b.lock(),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.node() {
            Node::None => f.write_str("None"),
            Node::Error(message) => f.debug_tuple("Error").field(message).finish(),
            Node::Int64(i) => f.debug_tuple("Int64").field(i).finish(),
            Node::Float(x) => f.debug_tuple("Float").field(x).finish(),
            Node::String(bytes) => f
                .debug_tuple("String")
                .field(&String::from_utf8_lossy(bytes))
                .finish(),
            Node::Binary(bytes) => f.debug_tuple("Binary").field(bytes).finish(),
            Node::List(list) => f.debug_list().entries(list.read_recursive().items()).finish(),
            Node::Dict(dict) => f.debug_map().entries(dict.read_recursive().iter()).finish(),
            Node::Coll(coll) => fmt::Debug::fmt(&*coll.read_recursive(), f),
            Node::BitBuffer(bb) => fmt::Debug::fmt(&*bb.lock(), f),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::new_int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::new_int(i64::from(value))
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::new_int(i64::from(value))
    }
}

impl From<f32> for Value {
    fn from(value: f32) -> Self {
        Value::new_float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::new_string(value)
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::new_string(value)
    }
}

impl From<&[u8]> for Value {
    fn from(value: &[u8]) -> Self {
        Value::new_binary(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_tags_round_trip() {
        for tag in 0..=9u8 {
            let kind = ValueType::from_tag(tag).expect("known tag");
            assert_eq!(kind.tag(), tag);
        }
        assert_eq!(ValueType::from_tag(10), None);
        assert_eq!(ValueType::from_tag(0xff), None);
    }

    #[test]
    fn test_typed_getters_check_tag() {
        let v = Value::new_int(-7);
        assert_eq!(v.get_int(), Some(-7));
        assert_eq!(v.get_string(), None);
        assert_eq!(v.get_float(), None);
        assert!(v.is_type(ValueType::Int64));

        let s = Value::new_string("héllo");
        assert_eq!(s.get_string().as_deref(), Some("héllo"));
        assert_eq!(s.get_int(), None);

        let e = Value::new_error("no such entry");
        assert!(e.is_error());
        assert_eq!(e.get_error().as_deref(), Some("no such entry"));
    }

    #[test]
    fn test_string_bytes_are_not_validated() {
        let v = Value::new_string_bytes(vec![0x66, 0xff, 0x6f]);
        assert_eq!(v.get_string_bytes(), Some(vec![0x66, 0xff, 0x6f]));
        assert_eq!(v.get_string().as_deref(), Some("f\u{fffd}o"));
    }

    #[test]
    fn test_clone_is_ref_drop_is_unref() {
        let v = Value::new_binary(vec![1, 2, 3]);
        let weak = v.downgrade();
        let extra = v.clone();
        assert_eq!(v.ref_count(), 2);
        drop(extra);
        assert_eq!(v.ref_count(), 1);
        drop(v);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_bitbuffer_value_wrappers() {
        let v = Value::new_bitbuffer();
        v.bitbuffer_put_bits(12, 0xabc).unwrap();
        v.bitbuffer_align().unwrap();
        assert_eq!(v.bitbuffer_len(), Some(16));
        v.bitbuffer_rewind().unwrap();
        assert_eq!(v.bitbuffer_get_bits(12).unwrap(), 0xabc);

        let ro = Value::new_bitbuffer_ro(vec![0]);
        assert_eq!(
            ro.bitbuffer_put_bits(1, 1),
            Err(ValueError::BitBuffer(BitBufferError::ReadOnly))
        );
        assert_eq!(Value::new_int(1).bitbuffer_pos(), None);
    }

    #[test]
    fn test_structural_equality() {
        assert_eq!(Value::new_int(3), Value::from(3i64));
        assert_ne!(Value::new_int(3), Value::new_float(3.0));
        assert_eq!(Value::new_float(f32::NAN), Value::new_float(f32::NAN));
        assert_ne!(Value::new_string("a"), Value::new_binary(b"a".to_vec()));
    }
}
