//! Typed scalar values carried in KV lists and SET-VAR actions.
//!
//! Each value starts with a one-byte tag: the low nibble is the data type,
//! the high nibble carries type flags. Booleans live entirely in the tag.
//!
//! | type    | id | body                         |
//! |---------|----|------------------------------|
//! | NULL    | 0  | none                         |
//! | BOOL    | 1  | none (flag `0x10` = true)    |
//! | INT32   | 2  | varint                       |
//! | UINT32  | 3  | varint                       |
//! | INT64   | 4  | varint                       |
//! | UINT64  | 5  | varint                       |
//! | IPV4    | 6  | 4 bytes, network order       |
//! | IPV6    | 7  | 16 bytes, network order      |
//! | STRING  | 8  | varint length + UTF-8 bytes  |
//! | BINARY  | 9  | varint length + bytes        |
//!
//! Signed integers travel as the varint of their two's-complement bits.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{BufMut, Bytes};

use crate::error::{FrameError, Result};
use crate::varint::{decode_bytes, decode_string, decode_varint, encode_bytes, encode_varint};

pub const TYPE_NULL: u8 = 0;
pub const TYPE_BOOL: u8 = 1;
pub const TYPE_INT32: u8 = 2;
pub const TYPE_UINT32: u8 = 3;
pub const TYPE_INT64: u8 = 4;
pub const TYPE_UINT64: u8 = 5;
pub const TYPE_IPV4: u8 = 6;
pub const TYPE_IPV6: u8 = 7;
pub const TYPE_STRING: u8 = 8;
pub const TYPE_BINARY: u8 = 9;

/// Tag flag marking a boolean as true.
pub const FLAG_TRUE: u8 = 0x10;

const TYPE_MASK: u8 = 0x0F;

/// A typed protocol value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypedData {
    Null,
    Bool(bool),
    Int32(i32),
    Uint32(u32),
    Int64(i64),
    Uint64(u64),
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    String(String),
    Binary(Bytes),
}

impl TypedData {
    /// The type id (low nibble of the tag).
    pub fn type_id(&self) -> u8 {
        match self {
            Self::Null => TYPE_NULL,
            Self::Bool(_) => TYPE_BOOL,
            Self::Int32(_) => TYPE_INT32,
            Self::Uint32(_) => TYPE_UINT32,
            Self::Int64(_) => TYPE_INT64,
            Self::Uint64(_) => TYPE_UINT64,
            Self::Ipv4(_) => TYPE_IPV4,
            Self::Ipv6(_) => TYPE_IPV6,
            Self::String(_) => TYPE_STRING,
            Self::Binary(_) => TYPE_BINARY,
        }
    }

    /// Human-readable type name.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int32(_) => "int32",
            Self::Uint32(_) => "uint32",
            Self::Int64(_) => "int64",
            Self::Uint64(_) => "uint64",
            Self::Ipv4(_) => "ipv4",
            Self::Ipv6(_) => "ipv6",
            Self::String(_) => "string",
            Self::Binary(_) => "binary",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Any integer variant that fits in a `u64`.
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Self::Int32(v) => u64::try_from(v).ok(),
            Self::Uint32(v) => Some(u64::from(v)),
            Self::Int64(v) => u64::try_from(v).ok(),
            Self::Uint64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_ip(&self) -> Option<IpAddr> {
        match *self {
            Self::Ipv4(addr) => Some(IpAddr::V4(addr)),
            Self::Ipv6(addr) => Some(IpAddr::V6(addr)),
            _ => None,
        }
    }

    /// Encoded size in bytes, tag included.
    pub fn encoded_len(&self) -> usize {
        use crate::varint::varint_len;
        1 + match self {
            Self::Null | Self::Bool(_) => 0,
            Self::Int32(v) => varint_len(*v as i64 as u64),
            Self::Uint32(v) => varint_len(u64::from(*v)),
            Self::Int64(v) => varint_len(*v as u64),
            Self::Uint64(v) => varint_len(*v),
            Self::Ipv4(_) => 4,
            Self::Ipv6(_) => 16,
            Self::String(s) => varint_len(s.len() as u64) + s.len(),
            Self::Binary(b) => varint_len(b.len() as u64) + b.len(),
        }
    }

    /// Append the tagged encoding of this value.
    pub fn encode(&self, dst: &mut impl BufMut) {
        match self {
            Self::Null => dst.put_u8(TYPE_NULL),
            Self::Bool(true) => dst.put_u8(TYPE_BOOL | FLAG_TRUE),
            Self::Bool(false) => dst.put_u8(TYPE_BOOL),
            Self::Int32(v) => {
                dst.put_u8(TYPE_INT32);
                encode_varint(*v as i64 as u64, dst);
            }
            Self::Uint32(v) => {
                dst.put_u8(TYPE_UINT32);
                encode_varint(u64::from(*v), dst);
            }
            Self::Int64(v) => {
                dst.put_u8(TYPE_INT64);
                encode_varint(*v as u64, dst);
            }
            Self::Uint64(v) => {
                dst.put_u8(TYPE_UINT64);
                encode_varint(*v, dst);
            }
            Self::Ipv4(addr) => {
                dst.put_u8(TYPE_IPV4);
                dst.put_slice(&addr.octets());
            }
            Self::Ipv6(addr) => {
                dst.put_u8(TYPE_IPV6);
                dst.put_slice(&addr.octets());
            }
            Self::String(s) => {
                dst.put_u8(TYPE_STRING);
                encode_bytes(s.as_bytes(), dst);
            }
            Self::Binary(b) => {
                dst.put_u8(TYPE_BINARY);
                encode_bytes(b, dst);
            }
        }
    }

    /// Decode one tagged value, returning `(value, consumed)`.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let tag = *buf.first().ok_or(FrameError::TruncatedPayload {
            needed: 1,
            remaining: 0,
        })?;
        let body = &buf[1..];

        let (value, used) = match tag & TYPE_MASK {
            TYPE_NULL => (Self::Null, 0),
            TYPE_BOOL => (Self::Bool(tag & FLAG_TRUE != 0), 0),
            TYPE_INT32 => {
                let (v, n) = decode_varint(body)?;
                (Self::Int32(v as i64 as i32), n)
            }
            TYPE_UINT32 => {
                let (v, n) = decode_varint(body)?;
                (Self::Uint32(v as u32), n)
            }
            TYPE_INT64 => {
                let (v, n) = decode_varint(body)?;
                (Self::Int64(v as i64), n)
            }
            TYPE_UINT64 => {
                let (v, n) = decode_varint(body)?;
                (Self::Uint64(v), n)
            }
            TYPE_IPV4 => {
                let octets: [u8; 4] = fixed(body)?;
                (Self::Ipv4(Ipv4Addr::from(octets)), 4)
            }
            TYPE_IPV6 => {
                let octets: [u8; 16] = fixed(body)?;
                (Self::Ipv6(Ipv6Addr::from(octets)), 16)
            }
            TYPE_STRING => {
                let (s, n) = decode_string(body)?;
                (Self::String(s.to_owned()), n)
            }
            TYPE_BINARY => {
                let (b, n) = decode_bytes(body)?;
                (Self::Binary(Bytes::copy_from_slice(b)), n)
            }
            _ => return Err(FrameError::UnsupportedType(tag)),
        };

        Ok((value, 1 + used))
    }
}

fn fixed<const N: usize>(body: &[u8]) -> Result<[u8; N]> {
    body.get(..N)
        .and_then(|raw| raw.try_into().ok())
        .ok_or(FrameError::TruncatedPayload {
            needed: N,
            remaining: body.len(),
        })
}

impl fmt::Display for TypedData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int32(v) => write!(f, "{v}"),
            Self::Uint32(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::Uint64(v) => write!(f, "{v}"),
            Self::Ipv4(v) => write!(f, "{v}"),
            Self::Ipv6(v) => write!(f, "{v}"),
            Self::String(v) => f.write_str(v),
            Self::Binary(v) => write!(f, "<binary {} bytes>", v.len()),
        }
    }
}

impl From<bool> for TypedData {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for TypedData {
    fn from(v: i32) -> Self {
        Self::Int32(v)
    }
}

impl From<u32> for TypedData {
    fn from(v: u32) -> Self {
        Self::Uint32(v)
    }
}

impl From<i64> for TypedData {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<u64> for TypedData {
    fn from(v: u64) -> Self {
        Self::Uint64(v)
    }
}

impl From<Ipv4Addr> for TypedData {
    fn from(v: Ipv4Addr) -> Self {
        Self::Ipv4(v)
    }
}

impl From<Ipv6Addr> for TypedData {
    fn from(v: Ipv6Addr) -> Self {
        Self::Ipv6(v)
    }
}

impl From<IpAddr> for TypedData {
    fn from(v: IpAddr) -> Self {
        match v {
            IpAddr::V4(addr) => Self::Ipv4(addr),
            IpAddr::V6(addr) => Self::Ipv6(addr),
        }
    }
}

impl From<String> for TypedData {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for TypedData {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl From<Bytes> for TypedData {
    fn from(v: Bytes) -> Self {
        Self::Binary(v)
    }
}

impl From<Vec<u8>> for TypedData {
    fn from(v: Vec<u8>) -> Self {
        Self::Binary(Bytes::from(v))
    }
}
