use std::fmt;
use std::io;

use spop_agent::AgentError;
use spop_frame::FrameError;

// Process exit codes. USAGE is sysexits EX_USAGE; TIMEOUT matches timeout(1).
pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const HEALTH_CHECK_FAILED: i32 = 30;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::AddrInUse
        | io::ErrorKind::AddrNotAvailable => TRANSPORT_ERROR,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn frame_error(context: &str, err: FrameError) -> CliError {
    match err {
        FrameError::Io(source) => io_error(context, source),
        FrameError::Timeout { .. } => CliError::new(TIMEOUT, format!("{context}: {err}")),
        FrameError::ConnectionClosed => CliError::new(FAILURE, format!("{context}: {err}")),
        other => CliError::new(DATA_INVALID, format!("{context}: {other}")),
    }
}

pub fn agent_error(context: &str, err: AgentError) -> CliError {
    match err {
        AgentError::Frame(err) => frame_error(context, err),
        AgentError::Io(source) => io_error(context, source),
        AgentError::Config(_) => CliError::new(USAGE, format!("{context}: {err}")),
        AgentError::HandshakeFailed { .. }
        | AgentError::VersionMismatch { .. }
        | AgentError::Disconnected { .. } => {
            CliError::new(HEALTH_CHECK_FAILED, format!("{context}: {err}"))
        }
        other => CliError::new(FAILURE, format!("{context}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn refused_connection_is_transport_error() {
        let err = agent_error(
            "connect failed",
            AgentError::Io(io::Error::from(io::ErrorKind::ConnectionRefused)),
        );
        assert_eq!(err.code, TRANSPORT_ERROR);
        assert!(err.message.starts_with("connect failed: "));
    }

    #[test]
    fn frame_timeout_maps_to_timeout() {
        let err = agent_error(
            "notify failed",
            AgentError::Frame(FrameError::Timeout {
                op: "notify",
                timeout: Duration::from_secs(1),
            }),
        );
        assert_eq!(err.code, TIMEOUT);
    }

    #[test]
    fn rejected_handshake_maps_to_health_check_failed() {
        let err = agent_error(
            "probe failed",
            AgentError::Disconnected {
                status_code: 8,
                message: "bad version".to_string(),
            },
        );
        assert_eq!(err.code, HEALTH_CHECK_FAILED);
    }
}
