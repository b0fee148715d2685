// ABOUTME: The BLIP property block codec — an ordered set of string key/value pairs
// ABOUTME: NUL-terminated ISO-8859-1 strings with single-byte dictionary compression

use crate::dictionary;
use crate::error::BlipError;
use bytes::{Buf, BufMut, BytesMut};
use std::io::Cursor;

/// A BLIP message's property set.
///
/// Order of insertion has no semantic meaning, but is
/// preserved for deterministic wire encoding. Duplicate keys are rejected.
#[derive(Debug, Clone, Default)]
pub struct Properties(Vec<(String, String)>);

impl Properties {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Set `key` to `value`, overwriting any existing entry for `key`.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let pos = self.0.iter().position(|(k, _)| k == key)?;
        Some(self.0.remove(pos).1)
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// Insert a key/value pair while decoding, rejecting duplicate keys.
    fn insert_unique(&mut self, key: String, value: String) -> Result<(), BlipError> {
        if self.contains_key(&key) {
            return Err(BlipError::BadProperties("duplicate property key"));
        }
        self.0.push((key, value));
        Ok(())
    }
}

impl PartialEq for Properties {
    fn eq(&self, other: &Self) -> bool {
        self.0.len() == other.0.len()
            && self.0.iter().all(|(k, v)| other.get(k) == Some(v.as_str()))
    }
}

impl Eq for Properties {}

impl FromIterator<(String, String)> for Properties {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        let mut props = Properties::new();
        for (k, v) in iter {
            props.set(k, v);
        }
        props
    }
}

/// A string is wire-safe if it contains no NUL byte and every character is
/// representable in a single ISO-8859-1 byte.
pub fn is_wire_safe(s: &str) -> bool {
    s.chars().all(|c| c != '\0' && (c as u32) <= 0xFF)
}

fn push_latin1(buf: &mut BytesMut, s: &str) {
    for c in s.chars() {
        buf.put_u8(c as u32 as u8);
    }
}

fn latin1_to_string(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

fn encode_cstring(buf: &mut BytesMut, s: &str) {
    match dictionary::index_of(s) {
        Some(index) => {
            buf.put_u8(index);
            buf.put_u8(0);
        }
        None => {
            push_latin1(buf, s);
            buf.put_u8(0);
        }
    }
}

fn decode_cstring(buf: &mut Cursor<&[u8]>) -> Result<String, BlipError> {
    if !buf.has_remaining() {
        return Err(BlipError::BadProperties("expected string, found end of block"));
    }

    let chunk = buf.chunk();
    let first = chunk[0];
    if dictionary::is_index_byte(first) && chunk.len() >= 2 && chunk[1] == 0 {
        buf.advance(2);
        return Ok(dictionary::lookup(first)
            .expect("is_index_byte guarantees a valid dictionary entry")
            .to_string());
    }

    match chunk.iter().position(|&b| b == 0) {
        Some(nul_pos) => {
            let s = latin1_to_string(&chunk[..nul_pos]);
            buf.advance(nul_pos + 1);
            Ok(s)
        }
        None => Err(BlipError::BadProperties("string is missing its NUL terminator")),
    }
}

/// Encode the raw property block (no length prefix): alternating
/// NUL-terminated key/value strings. An empty set encodes to zero bytes.
pub fn encode_block(props: &Properties) -> BytesMut {
    let mut buf = BytesMut::new();
    for (k, v) in props.iter() {
        encode_cstring(&mut buf, k);
        encode_cstring(&mut buf, v);
    }
    buf
}

/// The number of bytes `encode_block` would produce for `props`.
pub fn encoded_block_len(props: &Properties) -> usize {
    fn cstring_len(s: &str) -> usize {
        if dictionary::index_of(s).is_some() {
            2
        } else {
            s.chars().count() + 1
        }
    }
    props
        .iter()
        .map(|(k, v)| cstring_len(k) + cstring_len(v))
        .sum()
}

/// Decode a raw property block (the bytes after the `propertiesLength`
/// varint, not including it). Fails if the block does not
/// end in NUL, ends mid-pair, or contains a malformed string.
pub fn decode_block(bytes: &[u8]) -> Result<Properties, BlipError> {
    if bytes.is_empty() {
        return Ok(Properties::new());
    }
    if *bytes.last().expect("checked non-empty") != 0 {
        return Err(BlipError::BadProperties("block does not end with NUL"));
    }

    let mut cursor = Cursor::new(bytes);
    let mut props = Properties::new();
    while cursor.has_remaining() {
        let key = decode_cstring(&mut cursor)?;
        if !cursor.has_remaining() {
            return Err(BlipError::BadProperties("property block ends mid-pair"));
        }
        let value = decode_cstring(&mut cursor)?;
        props.insert_unique(key, value)?;
    }
    Ok(props)
}
