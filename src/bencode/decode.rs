use std::collections::BTreeMap;

use bytes::Bytes;

use super::error::BencodeError;
use super::value::Value;

const MAX_DEPTH: usize = 32;

/// Decodes exactly one bencode value spanning the whole input.
///
/// # Errors
///
/// Fails on truncated or malformed input, on nesting deeper than 32
/// levels, and on trailing bytes after the value.
pub fn decode(data: &[u8]) -> Result<Value, BencodeError> {
    let mut cur = Cursor { data, pos: 0 };
    let value = cur.value(0)?;
    if cur.pos != data.len() {
        return Err(BencodeError::TrailingData);
    }
    Ok(value)
}

/// Decodes one bencode value from the front of the input.
///
/// Returns the value and the number of bytes it consumed. Used where a
/// bencoded dictionary is followed by raw payload bytes, as in the
/// `ut_metadata` data message.
pub fn decode_prefix(data: &[u8]) -> Result<(Value, usize), BencodeError> {
    let mut cur = Cursor { data, pos: 0 };
    let value = cur.value(0)?;
    Ok((value, cur.pos))
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn peek(&self) -> Result<u8, BencodeError> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEof)
    }

    fn value(&mut self, depth: usize) -> Result<Value, BencodeError> {
        if depth > MAX_DEPTH {
            return Err(BencodeError::TooDeep);
        }
        match self.peek()? {
            b'i' => self.integer(),
            b'l' => self.list(depth),
            b'd' => self.dict(depth),
            b'0'..=b'9' => self.bytes().map(Value::Bytes),
            c => Err(BencodeError::UnexpectedByte(c, self.pos)),
        }
    }

    fn integer(&mut self) -> Result<Value, BencodeError> {
        self.pos += 1;
        let start = self.pos;
        while self.peek()? != b'e' {
            self.pos += 1;
        }
        let digits = &self.data[start..self.pos];
        self.pos += 1;

        let s = std::str::from_utf8(digits).map_err(|_| BencodeError::InvalidInteger)?;
        if s.is_empty() || s == "-" {
            return Err(BencodeError::InvalidInteger);
        }
        // "i-0e" and leading zeros are not canonical bencode.
        if s.starts_with("-0") || (s.len() > 1 && s.starts_with('0')) {
            return Err(BencodeError::InvalidInteger);
        }
        s.parse().map(Value::Int).map_err(|_| BencodeError::InvalidInteger)
    }

    fn bytes(&mut self) -> Result<Bytes, BencodeError> {
        let start = self.pos;
        while self.peek()? != b':' {
            if !self.data[self.pos].is_ascii_digit() {
                return Err(BencodeError::InvalidLength);
            }
            self.pos += 1;
        }
        let len: usize = std::str::from_utf8(&self.data[start..self.pos])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(BencodeError::InvalidLength)?;
        self.pos += 1;

        let end = self.pos.checked_add(len).ok_or(BencodeError::InvalidLength)?;
        if end > self.data.len() {
            return Err(BencodeError::UnexpectedEof);
        }
        let bytes = Bytes::copy_from_slice(&self.data[self.pos..end]);
        self.pos = end;
        Ok(bytes)
    }

    fn list(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.pos += 1;
        let mut items = Vec::new();
        while self.peek()? != b'e' {
            items.push(self.value(depth + 1)?);
        }
        self.pos += 1;
        Ok(Value::List(items))
    }

    fn dict(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.pos += 1;
        let mut map = BTreeMap::new();
        while self.peek()? != b'e' {
            if !self.data[self.pos].is_ascii_digit() {
                return Err(BencodeError::InvalidKey);
            }
            let key = self.bytes()?;
            let value = self.value(depth + 1)?;
            map.insert(key, value);
        }
        self.pos += 1;
        Ok(Value::Dict(map))
    }
}
