//! NOTIFY payloads: an ordered list of named messages.
//!
//! ```text
//! ┌──────────────┬─────────────┬──────────────────────────┐
//! │ name         │ nb-args (1B)│ nb-args KV entries       │ ... repeated
//! └──────────────┴─────────────┴──────────────────────────┘
//! ```

use bytes::BufMut;

use crate::error::{FrameError, Result};
use crate::kv::Kv;
use crate::value::TypedData;
use crate::varint::{decode_string, encode_bytes, varint_len};

/// One named event inside a NOTIFY frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub name: String,
    pub args: Kv,
}

impl Message {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Kv::new(),
        }
    }

    /// Builder-style argument append.
    pub fn with_arg(mut self, name: impl Into<String>, value: impl Into<TypedData>) -> Self {
        self.args.push(name, value);
        self
    }

    /// Clear name and arguments, keeping allocations.
    pub fn clear(&mut self) {
        self.name.clear();
        self.args.clear();
    }

    pub fn encoded_len(&self) -> usize {
        varint_len(self.name.len() as u64) + self.name.len() + 1 + self.args.encoded_len()
    }

    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        let count = u8::try_from(self.args.len())
            .map_err(|_| FrameError::TooManyArguments(self.args.len()))?;
        encode_bytes(self.name.as_bytes(), dst);
        dst.put_u8(count);
        self.args.encode(dst);
        Ok(())
    }

    /// Decode one message from the start of `buf` into `self`.
    ///
    /// `self` is cleared first; its buffers are reused. Returns bytes consumed.
    pub fn decode_into(&mut self, buf: &[u8]) -> Result<usize> {
        self.clear();
        let (name, name_len) = decode_string(buf)?;
        self.name.push_str(name);

        let count = *buf.get(name_len).ok_or(FrameError::TruncatedPayload {
            needed: 1,
            remaining: 0,
        })?;
        let offset = name_len + 1;
        let used = self.args.decode_n_into(&buf[offset..], usize::from(count))?;
        Ok(offset + used)
    }
}

/// Encode a NOTIFY payload.
pub fn encode_messages(messages: &[Message], dst: &mut impl BufMut) -> Result<()> {
    for message in messages {
        message.encode(dst)?;
    }
    Ok(())
}

/// Decode a NOTIFY payload, drawing message instances from `acquire`.
///
/// Messages decoded before an error are left in `out` so the caller can
/// hand them back to wherever `acquire` took them from.
pub fn decode_messages_with(
    buf: &[u8],
    out: &mut Vec<Message>,
    mut acquire: impl FnMut() -> Message,
) -> Result<usize> {
    let mut offset = 0;
    while offset < buf.len() {
        let mut message = acquire();
        let used = message.decode_into(&buf[offset..]);
        out.push(message);
        offset += used?;
    }
    Ok(offset)
}

/// Decode a NOTIFY payload into freshly allocated messages.
pub fn decode_messages(buf: &[u8]) -> Result<Vec<Message>> {
    let mut out = Vec::new();
    decode_messages_with(buf, &mut out, Message::default)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use bytes::BytesMut;

    use super::*;

    #[test]
    fn round_trip_many_messages() {
        let messages = vec![
            Message::new("check").with_arg("ip", Ipv4Addr::new(10, 0, 0, 1)),
            Message::new("empty"),
            Message::new("headers")
                .with_arg("host", "example.com")
                .with_arg("len", 42u32),
        ];

        let mut buf = BytesMut::new();
        encode_messages(&messages, &mut buf).unwrap();
        assert_eq!(
            buf.len(),
            messages.iter().map(Message::encoded_len).sum::<usize>()
        );

        assert_eq!(decode_messages(&buf).unwrap(), messages);
    }

    #[test]
    fn decode_into_reuses_and_clears_previous_contents() {
        let mut buf = BytesMut::new();
        Message::new("b").encode(&mut buf).unwrap();

        let mut reused = Message::new("a-long-previous-name").with_arg("stale", 1u32);
        let used = reused.decode_into(&buf).unwrap();

        assert_eq!(used, buf.len());
        assert_eq!(reused.name, "b");
        assert!(reused.args.is_empty());
    }

    #[test]
    fn missing_argument_count_is_truncated() {
        let mut buf = BytesMut::new();
        encode_bytes(b"check", &mut buf);
        assert!(matches!(
            decode_messages(&buf),
            Err(FrameError::TruncatedPayload { .. })
        ));
    }

    #[test]
    fn argument_count_beyond_payload_is_truncated() {
        let mut buf = BytesMut::new();
        encode_bytes(b"check", &mut buf);
        buf.put_u8(3);
        assert!(decode_messages(&buf).is_err());
    }

    #[test]
    fn too_many_arguments_rejected_on_encode() {
        let mut message = Message::new("wide");
        for i in 0..256u32 {
            message.args.push(format!("a{i}"), i);
        }
        let mut buf = BytesMut::new();
        assert!(matches!(
            message.encode(&mut buf),
            Err(FrameError::TooManyArguments(256))
        ));
    }

    #[test]
    fn partial_decode_hands_back_acquired_messages() {
        let mut buf = BytesMut::new();
        Message::new("ok").encode(&mut buf).unwrap();
        encode_bytes(b"broken", &mut buf);

        let mut out = Vec::new();
        let mut acquired = 0;
        let result = decode_messages_with(&buf, &mut out, || {
            acquired += 1;
            Message::default()
        });

        assert!(result.is_err());
        assert_eq!(acquired, 2);
        assert_eq!(out.len(), 2);
    }
}
