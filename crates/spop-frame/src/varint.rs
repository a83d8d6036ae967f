//! SPOP variable-length integers and length-prefixed byte strings.
//!
//! Values below 240 take a single byte. Larger values set the four high bits
//! of the first byte and continue in 7-bit groups:
//!
//! ```text
//! v < 240      : [v]
//! otherwise    : [v | 0xF0] then v = (v - 240) >> 4
//!                while v >= 128 { [v | 0x80]; v = (v - 128) >> 7 }
//!                [v]
//! ```
//!
//! A `u64` never needs more than [`MAX_VARINT_LEN`] bytes.

use bytes::BufMut;

use crate::error::{FrameError, Result};

/// Longest valid encoding of a `u64`.
pub const MAX_VARINT_LEN: usize = 10;

/// Append the varint encoding of `value` to `dst`.
pub fn encode_varint(mut value: u64, dst: &mut impl BufMut) {
    if value < 240 {
        dst.put_u8(value as u8);
        return;
    }

    dst.put_u8((value as u8) | 0xF0);
    value = (value - 240) >> 4;
    while value >= 128 {
        dst.put_u8((value as u8) | 0x80);
        value = (value - 128) >> 7;
    }
    dst.put_u8(value as u8);
}

/// Number of bytes `encode_varint` writes for `value`.
pub fn varint_len(mut value: u64) -> usize {
    if value < 240 {
        return 1;
    }
    let mut len = 2;
    value = (value - 240) >> 4;
    while value >= 128 {
        len += 1;
        value = (value - 128) >> 7;
    }
    len
}

/// Decode a varint from the start of `buf`, returning `(value, consumed)`.
pub fn decode_varint(buf: &[u8]) -> Result<(u64, usize)> {
    let first = *buf.first().ok_or(FrameError::MalformedInteger)?;
    if first < 240 {
        return Ok((u64::from(first), 1));
    }

    // Accumulate wide so a hostile chain cannot wrap silently.
    let mut value = u128::from(first);
    let mut shift = 4u32;
    let mut idx = 1usize;
    loop {
        if idx >= MAX_VARINT_LEN {
            return Err(FrameError::MalformedInteger);
        }
        let byte = *buf.get(idx).ok_or(FrameError::MalformedInteger)?;
        value += u128::from(byte) << shift;
        idx += 1;
        if byte < 128 {
            break;
        }
        shift += 7;
    }

    let value = u64::try_from(value).map_err(|_| FrameError::MalformedInteger)?;
    Ok((value, idx))
}

/// Append a varint length prefix followed by `data`.
pub fn encode_bytes(data: &[u8], dst: &mut impl BufMut) {
    encode_varint(data.len() as u64, dst);
    dst.put_slice(data);
}

/// Decode a length-prefixed byte string, returning `(bytes, consumed)`.
pub fn decode_bytes(buf: &[u8]) -> Result<(&[u8], usize)> {
    let (len, prefix) = decode_varint(buf)?;
    let remaining = buf.len() - prefix;
    let len = usize::try_from(len).map_err(|_| FrameError::MalformedInteger)?;
    if len > remaining {
        return Err(FrameError::TruncatedPayload {
            needed: len,
            remaining,
        });
    }
    Ok((&buf[prefix..prefix + len], prefix + len))
}

/// Decode a length-prefixed UTF-8 string, returning `(str, consumed)`.
pub fn decode_string(buf: &[u8]) -> Result<(&str, usize)> {
    let (raw, consumed) = decode_bytes(buf)?;
    let text = std::str::from_utf8(raw).map_err(|_| FrameError::InvalidUtf8)?;
    Ok((text, consumed))
}
