//! Wire codec for the Stream Processing Offload Protocol (SPOP).
//!
//! Every frame on the wire is:
//! - A 4-byte big-endian length (not counting itself)
//! - A 1-byte frame type and 4-byte big-endian flags
//! - Varint stream and frame ids
//! - A type-specific payload: KV list, messages or actions
//!
//! [`FrameReader`] and [`FrameWriter`] move whole frames over any tokio
//! stream; [`SpopCodec`] plugs the same codec into `tokio_util` framing.

pub mod action;
pub mod codec;
pub mod error;
pub mod kv;
pub mod message;
pub mod payload;
pub mod reader;
pub mod value;
pub mod varint;
pub mod writer;

pub use action::{Action, Actions, Scope};
pub use codec::{
    decode_frame, decode_frame_header, encode_frame, fragment_frame, Frame, FrameConfig,
    FrameFlags, FrameHeader, FrameType, SpopCodec, LENGTH_PREFIX_SIZE, MAX_FRAME_SIZE,
    MIN_FRAME_SIZE,
};
pub use error::{FrameError, Result};
pub use kv::{decode_kv, decode_kv_n, encode_kv, Kv};
pub use message::{decode_messages, decode_messages_with, encode_messages, Message};
pub use payload::{AgentHello, Disconnect, Hello, StatusCode};
pub use reader::FrameReader;
pub use value::TypedData;
pub use writer::FrameWriter;
