/// Errors that can occur during SPOP encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// A varint continuation chain is longer than 64 bits or runs past the buffer.
    #[error("malformed varint")]
    MalformedInteger,

    /// A length-prefixed field announces more bytes than remain in the buffer.
    #[error("truncated payload ({needed} bytes needed, {remaining} remaining)")]
    TruncatedPayload { needed: usize, remaining: usize },

    /// A typed value carries a type tag this codec does not know.
    #[error("unsupported data type tag 0x{0:02x}")]
    UnsupportedType(u8),

    /// A string field is not valid UTF-8.
    #[error("invalid UTF-8 in string field")]
    InvalidUtf8,

    /// The frame header names an unknown frame type.
    #[error("unknown frame type {0}")]
    UnknownFrameType(u8),

    /// An ACK payload names an unknown action type.
    #[error("unknown action type {0}")]
    UnknownActionType(u8),

    /// An action names an unknown variable scope.
    #[error("unknown variable scope {0}")]
    UnknownScope(u8),

    /// An action carries an unexpected number of arguments.
    #[error("invalid argument count {count} for action type {action}")]
    InvalidActionArgs { action: u8, count: u8 },

    /// A message carries more arguments than fit in its argument count byte.
    #[error("too many arguments in message ({0}, max 255)")]
    TooManyArguments(usize),

    /// The frame exceeds the negotiated maximum size.
    #[error("frame too large ({size} bytes, max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A read or write did not finish before its deadline.
    #[error("frame {op} timed out after {timeout:?}")]
    Timeout {
        op: &'static str,
        timeout: std::time::Duration,
    },

    /// The connection was closed before a complete frame was received.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, FrameError>;
