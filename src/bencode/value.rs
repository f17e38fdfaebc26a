use bytes::Bytes;
use std::collections::BTreeMap;

/// A decoded bencode value.
///
/// Dictionaries keep their keys in a `BTreeMap` so re-encoding always
/// produces the canonical sorted form. This matters for the info
/// dictionary: its SHA-1 is taken over the canonical encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Signed 64-bit integer (`i...e`).
    Int(i64),
    /// Byte string (`<len>:<bytes>`), not necessarily UTF-8.
    Bytes(Bytes),
    /// Ordered list (`l...e`).
    List(Vec<Value>),
    /// Dictionary with byte-string keys (`d...e`).
    Dict(BTreeMap<Bytes, Value>),
}

impl Value {
    /// Builds a byte-string value from a UTF-8 string.
    pub fn str(s: &str) -> Self {
        Value::Bytes(Bytes::copy_from_slice(s.as_bytes()))
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the value as `&str` when it is a valid UTF-8 byte string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Bytes, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Looks up `key` when the value is a dictionary.
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        match self {
            Value::Dict(d) => d.get(key),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::str(s)
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::Bytes(b)
    }
}
