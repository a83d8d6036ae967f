//! Ordered name/typed-value lists.
//!
//! Wire form of one entry: `[name: varint length + bytes][typed value]`.
//! Entries are kept in wire order; duplicate names are preserved.

use bytes::BufMut;

use crate::error::{FrameError, Result};
use crate::value::TypedData;
use crate::varint::{decode_string, encode_bytes, varint_len};

/// Ordered key/value container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Kv {
    entries: Vec<(String, TypedData)>,
}

impl Kv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Append an entry, keeping any earlier entry with the same name.
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<TypedData>) {
        self.entries.push((name.into(), value.into()));
    }

    /// First value stored under `name`.
    pub fn get(&self, name: &str) -> Option<&TypedData> {
        self.entries
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    /// Entry at `index` in wire order.
    pub fn get_index(&self, index: usize) -> Option<(&str, &TypedData)> {
        self.entries
            .get(index)
            .map(|(key, value)| (key.as_str(), value))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &TypedData)> {
        self.entries.iter().map(|(key, value)| (key.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop all entries, keeping the allocation for reuse.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        self.entries
            .iter()
            .map(|(key, value)| varint_len(key.len() as u64) + key.len() + value.encoded_len())
            .sum()
    }

    /// Append every entry in order.
    pub fn encode(&self, dst: &mut impl BufMut) {
        for (key, value) in &self.entries {
            encode_bytes(key.as_bytes(), dst);
            value.encode(dst);
        }
    }

    /// Decode entries until `buf` is exhausted, appending to `self`.
    ///
    /// Returns the number of bytes consumed (always `buf.len()` on success).
    pub fn decode_into(&mut self, buf: &[u8]) -> Result<usize> {
        let mut offset = 0;
        while offset < buf.len() {
            offset += self.decode_entry(&buf[offset..])?;
        }
        Ok(offset)
    }

    /// Decode exactly `count` entries from the start of `buf`, appending to `self`.
    pub fn decode_n_into(&mut self, buf: &[u8], count: usize) -> Result<usize> {
        let mut offset = 0;
        for _ in 0..count {
            if offset >= buf.len() {
                return Err(FrameError::TruncatedPayload {
                    needed: 1,
                    remaining: 0,
                });
            }
            offset += self.decode_entry(&buf[offset..])?;
        }
        Ok(offset)
    }

    fn decode_entry(&mut self, buf: &[u8]) -> Result<usize> {
        let (name, name_len) = decode_string(buf)?;
        let (value, value_len) = TypedData::decode(&buf[name_len..])?;
        self.entries.push((name.to_owned(), value));
        Ok(name_len + value_len)
    }
}

impl<K: Into<String>, V: Into<TypedData>> FromIterator<(K, V)> for Kv {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }
}

/// Decode a whole KV list, returning `(container, consumed)`.
pub fn decode_kv(buf: &[u8]) -> Result<(Kv, usize)> {
    let mut kv = Kv::new();
    let consumed = kv.decode_into(buf)?;
    Ok((kv, consumed))
}

/// Decode exactly `count` entries, returning `(container, consumed)`.
pub fn decode_kv_n(buf: &[u8], count: usize) -> Result<(Kv, usize)> {
    let mut kv = Kv::with_capacity(count);
    let consumed = kv.decode_n_into(buf, count)?;
    Ok((kv, consumed))
}

/// Encode a KV list.
pub fn encode_kv(kv: &Kv, dst: &mut impl BufMut) {
    kv.encode(dst);
}
