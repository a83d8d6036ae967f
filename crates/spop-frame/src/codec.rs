use std::fmt;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::action::Actions;
use crate::error::{FrameError, Result};
use crate::kv::Kv;
use crate::message::{encode_messages, Message};
use crate::varint::{decode_varint, encode_varint, varint_len};

/// Length prefix size (4 bytes, big-endian).
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Smallest possible frame body: type (1) + flags (4) + two one-byte varints.
pub const MIN_FRAME_SIZE: usize = 7;

/// Protocol ceiling for a frame body (16 KiB minus the length prefix).
pub const MAX_FRAME_SIZE: usize = 16380;

/// Frame types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Continuation fragment of a previously started frame.
    Unset = 0,
    HaproxyHello = 1,
    HaproxyDisconnect = 2,
    Notify = 3,
    AgentHello = 101,
    AgentDisconnect = 102,
    Ack = 103,
}

impl FrameType {
    pub fn name(self) -> &'static str {
        match self {
            Self::Unset => "UNSET",
            Self::HaproxyHello => "HAPROXY-HELLO",
            Self::HaproxyDisconnect => "HAPROXY-DISCONNECT",
            Self::Notify => "NOTIFY",
            Self::AgentHello => "AGENT-HELLO",
            Self::AgentDisconnect => "AGENT-DISCONNECT",
            Self::Ack => "ACK",
        }
    }
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Unset),
            1 => Ok(Self::HaproxyHello),
            2 => Ok(Self::HaproxyDisconnect),
            3 => Ok(Self::Notify),
            101 => Ok(Self::AgentHello),
            102 => Ok(Self::AgentDisconnect),
            103 => Ok(Self::Ack),
            other => Err(FrameError::UnknownFrameType(other)),
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Frame flag bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u32);

impl FrameFlags {
    /// Frame is complete (not followed by more fragments).
    pub const FIN: Self = Self(0x0000_0001);
    /// Processing of this frame must stop.
    pub const ABORT: Self = Self(0x0000_0002);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_fin(self) -> bool {
        self.contains(Self::FIN)
    }

    pub fn is_abort(self) -> bool {
        self.contains(Self::ABORT)
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for FrameFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Decoded fixed part of a frame body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub frame_type: FrameType,
    pub flags: FrameFlags,
    pub stream_id: u64,
    pub frame_id: u64,
    /// Bytes taken by the header; the type-specific body follows.
    pub len: usize,
}

/// One physical SPOP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub flags: FrameFlags,
    pub stream_id: u64,
    pub frame_id: u64,
    /// Type-specific body, still encoded.
    pub payload: Bytes,
}

impl Frame {
    /// Create an unfragmented frame.
    pub fn new(
        frame_type: FrameType,
        stream_id: u64,
        frame_id: u64,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            frame_type,
            flags: FrameFlags::FIN,
            stream_id,
            frame_id,
            payload: payload.into(),
        }
    }

    /// Connection-level frame carrying a KV list (HELLO and DISCONNECT variants).
    pub fn with_kv(frame_type: FrameType, kv: &Kv) -> Self {
        let mut body = BytesMut::with_capacity(kv.encoded_len());
        kv.encode(&mut body);
        Self::new(frame_type, 0, 0, body.freeze())
    }

    pub fn notify(stream_id: u64, frame_id: u64, messages: &[Message]) -> Result<Self> {
        let mut body = BytesMut::new();
        encode_messages(messages, &mut body)?;
        Ok(Self::new(FrameType::Notify, stream_id, frame_id, body.freeze()))
    }

    pub fn ack(stream_id: u64, frame_id: u64, actions: &Actions) -> Self {
        let mut body = BytesMut::with_capacity(actions.encoded_len());
        actions.encode(&mut body);
        Self::new(FrameType::Ack, stream_id, frame_id, body.freeze())
    }

    /// Length of the frame body (everything after the length prefix).
    pub fn frame_len(&self) -> usize {
        header_len(self.stream_id, self.frame_id) + self.payload.len()
    }

    /// The total wire size of this frame (prefix + body).
    pub fn wire_size(&self) -> usize {
        LENGTH_PREFIX_SIZE + self.frame_len()
    }

    pub fn is_fin(&self) -> bool {
        self.flags.is_fin()
    }

    pub fn is_abort(&self) -> bool {
        self.flags.is_abort()
    }
}

fn header_len(stream_id: u64, frame_id: u64) -> usize {
    1 + 4 + varint_len(stream_id) + varint_len(frame_id)
}

/// Decode the fixed header at the start of a frame body.
pub fn decode_frame_header(buf: &[u8]) -> Result<FrameHeader> {
    if buf.len() < MIN_FRAME_SIZE {
        return Err(FrameError::TruncatedPayload {
            needed: MIN_FRAME_SIZE,
            remaining: buf.len(),
        });
    }

    let frame_type = FrameType::try_from(buf[0])?;
    let flags = FrameFlags::from_bits(u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]));
    let (stream_id, sid_len) = decode_varint(&buf[5..])?;
    let (frame_id, fid_len) = decode_varint(&buf[5 + sid_len..])?;

    Ok(FrameHeader {
        frame_type,
        flags,
        stream_id,
        frame_id,
        len: 5 + sid_len + fid_len,
    })
}

/// Encode a frame into the wire format.
///
/// Wire format:
/// ```text
/// ┌────────────┬──────────┬───────────┬───────────┬──────────┬─────────────┐
/// │ Length     │ Type     │ Flags     │ Stream ID │ Frame ID │ Payload     │
/// │ (4B BE)    │ (1B)     │ (4B BE)   │ (varint)  │ (varint) │             │
/// └────────────┴──────────┴───────────┴───────────┴──────────┴─────────────┘
/// ```
///
/// The body is written first and the length prefix patched in afterwards.
/// Nothing is left in `dst` when the frame exceeds `max_frame_size`.
pub fn encode_frame(frame: &Frame, dst: &mut BytesMut, max_frame_size: usize) -> Result<()> {
    let body_len = frame.frame_len();
    if body_len > max_frame_size {
        return Err(FrameError::FrameTooLarge {
            size: body_len,
            max: max_frame_size,
        });
    }

    dst.reserve(LENGTH_PREFIX_SIZE + body_len);
    let start = dst.len();
    dst.put_u32(0);
    dst.put_u8(frame.frame_type as u8);
    dst.put_u32(frame.flags.bits());
    encode_varint(frame.stream_id, dst);
    encode_varint(frame.frame_id, dst);
    dst.put_slice(&frame.payload);

    let written = dst.len() - start - LENGTH_PREFIX_SIZE;
    dst[start..start + LENGTH_PREFIX_SIZE].copy_from_slice(&(written as u32).to_be_bytes());
    Ok(())
}

/// Decode a frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes from the buffer. A declared length
/// above `max_frame_size` is rejected before any body byte is awaited.
pub fn decode_frame(src: &mut BytesMut, max_frame_size: usize) -> Result<Option<Frame>> {
    if src.len() < LENGTH_PREFIX_SIZE {
        return Ok(None); // Need more data
    }

    let frame_len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
    if frame_len > max_frame_size {
        return Err(FrameError::FrameTooLarge {
            size: frame_len,
            max: max_frame_size,
        });
    }

    let total = LENGTH_PREFIX_SIZE + frame_len;
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None); // Need more data
    }

    let header = decode_frame_header(&src[LENGTH_PREFIX_SIZE..total])?;

    src.advance(LENGTH_PREFIX_SIZE + header.len);
    let payload = src.split_to(frame_len - header.len).freeze();

    Ok(Some(Frame {
        frame_type: header.frame_type,
        flags: header.flags,
        stream_id: header.stream_id,
        frame_id: header.frame_id,
        payload,
    }))
}

/// Split a frame whose body exceeds `max_frame_size` into fragments.
///
/// All fragments share the stream and frame ids. The first keeps the frame
/// type, later ones are `UNSET`; only the last carries FIN.
pub fn fragment_frame(frame: Frame, max_frame_size: usize) -> Result<Vec<Frame>> {
    if frame.frame_len() <= max_frame_size {
        return Ok(vec![frame]);
    }

    let header = header_len(frame.stream_id, frame.frame_id);
    let chunk = max_frame_size.saturating_sub(header);
    if chunk == 0 {
        return Err(FrameError::FrameTooLarge {
            size: frame.frame_len(),
            max: max_frame_size,
        });
    }

    let mut flags = frame.flags;
    flags.remove(FrameFlags::FIN);

    let mut payload = frame.payload;
    let mut fragments = Vec::with_capacity(payload.len().div_ceil(chunk));
    let mut frame_type = frame.frame_type;
    while !payload.is_empty() {
        let take = chunk.min(payload.len());
        let mut fragment_flags = flags;
        if take == payload.len() {
            fragment_flags.insert(FrameFlags::FIN);
        }
        fragments.push(Frame {
            frame_type,
            flags: fragment_flags,
            stream_id: frame.stream_id,
            frame_id: frame.frame_id,
            payload: payload.split_to(take),
        });
        frame_type = FrameType::Unset;
    }
    Ok(fragments)
}

/// Configuration for the frame codec.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum frame body size in bytes. Default: 16380.
    pub max_frame_size: usize,
    /// Time allowed to finish a frame once its first byte arrived.
    pub read_timeout: Option<Duration>,
    /// Time allowed to write one frame.
    pub write_timeout: Option<Duration>,
    /// Time allowed between frames.
    pub idle_timeout: Option<Duration>,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
            read_timeout: None,
            write_timeout: None,
            idle_timeout: None,
        }
    }
}

/// `tokio_util` codec over [`encode_frame`] / [`decode_frame`].
#[derive(Debug, Clone)]
pub struct SpopCodec {
    max_frame_size: usize,
}

impl SpopCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    pub fn set_max_frame_size(&mut self, max_frame_size: usize) {
        self.max_frame_size = max_frame_size;
    }
}

impl Default for SpopCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

impl Decoder for SpopCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        decode_frame(src, self.max_frame_size)
    }
}

impl Encoder<Frame> for SpopCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        encode_frame(&frame, dst, self.max_frame_size)
    }
}

impl Encoder<&Frame> for SpopCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: &Frame, dst: &mut BytesMut) -> Result<()> {
        encode_frame(frame, dst, self.max_frame_size)
    }
}
