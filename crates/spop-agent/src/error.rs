use spop_frame::{FrameError, StatusCode};

/// Errors that can occur while serving or driving an SPOP connection.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Socket-level error outside frame I/O (bind, accept, connect).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer sent a frame that is not allowed in the current state.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// HELLO negotiation failed.
    #[error("handshake failed: {reason}")]
    HandshakeFailed { status: StatusCode, reason: String },

    /// No protocol version in common with the proxy.
    #[error("no common protocol version (offered {offered:?})")]
    VersionMismatch { offered: Vec<String> },

    /// A second HELLO on the same connection carried another engine id.
    #[error("engine id changed on connection {conn_id} ('{previous}' -> '{current}')")]
    EngineChanged {
        conn_id: u64,
        previous: String,
        current: String,
    },

    /// The engine reached its active stream ceiling.
    #[error("stream limit reached for engine '{engine_id}' ({limit} active)")]
    CapacityExceeded { engine_id: String, limit: usize },

    /// A fragmented frame arrived without the fragmentation capability.
    #[error("fragmented frame on stream {stream_id} but fragmentation was not negotiated")]
    FragmentationNotSupported { stream_id: u64 },

    /// Too many partially received frames, or fragments mixed up.
    #[error("interlaced frames: {0}")]
    InterlacedFrames(String),

    /// A continuation fragment names no pending frame.
    #[error("no pending frame for stream {stream_id} frame {frame_id}")]
    FrameIdNotFound { stream_id: u64, frame_id: u64 },

    /// A reassembled frame outgrew the reassembly ceiling.
    #[error("reassembled frame too large ({size} bytes, max {max})")]
    ReassemblyTooLarge { size: usize, max: usize },

    /// The peer closed the conversation with a DISCONNECT frame.
    #[error("peer disconnected with status {status_code}: {message}")]
    Disconnected { status_code: u32, message: String },

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl AgentError {
    /// DISCONNECT status code reported to the peer for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Frame(FrameError::FrameTooLarge { .. }) => StatusCode::TooBig,
            Self::Frame(FrameError::Timeout { .. }) => StatusCode::Timeout,
            Self::Frame(FrameError::Io(_) | FrameError::ConnectionClosed) | Self::Io(_) => {
                StatusCode::Io
            }
            Self::Frame(_) | Self::ProtocolViolation(_) | Self::EngineChanged { .. } => {
                StatusCode::Invalid
            }
            Self::HandshakeFailed { status, .. } => *status,
            Self::VersionMismatch { .. } => StatusCode::BadVersion,
            Self::CapacityExceeded { .. } => StatusCode::Resource,
            Self::FragmentationNotSupported { .. } => StatusCode::FragmentationNotSupported,
            Self::InterlacedFrames(_) => StatusCode::InterlacedFrames,
            Self::FrameIdNotFound { .. } => StatusCode::FrameIdNotFound,
            Self::ReassemblyTooLarge { .. } => StatusCode::TooBig,
            Self::Disconnected { status_code, .. } => StatusCode::from_code(*status_code),
            Self::Config(_) => StatusCode::Unknown,
        }
    }

    /// Whether the connection is gone, so no DISCONNECT can be delivered.
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            Self::Frame(FrameError::Io(_) | FrameError::ConnectionClosed) | Self::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
