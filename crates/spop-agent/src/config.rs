use std::time::Duration;

use spop_frame::payload::{CAP_ASYNC, CAP_FRAGMENTATION, CAP_PIPELINING};
use spop_frame::{FrameConfig, MAX_FRAME_SIZE};

use crate::error::{AgentError, Result};
use crate::handshake::{MIN_NEGOTIATED_FRAME_SIZE, SPOP_VERSION};

/// Runtime configuration for an SPOP agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Time allowed to finish reading a frame once its first byte arrived.
    pub read_timeout: Option<Duration>,
    /// Time allowed to write one frame (or one run of fragments).
    pub write_timeout: Option<Duration>,
    /// Time a connection may sit without a new frame before it is closed.
    pub idle_timeout: Option<Duration>,
    /// Concurrent connection ceiling. `None` = unlimited.
    pub max_connections: Option<usize>,
    /// Largest frame the agent accepts; negotiation never goes above this.
    pub max_frame_size: usize,
    /// Protocol versions the agent speaks.
    pub supported_versions: Vec<String>,
    /// Capabilities offered in AGENT-HELLO (intersected with the proxy's).
    pub capabilities: Vec<String>,
    /// In-flight NOTIFY ceiling per engine. `None` = unbounded.
    pub max_streams_per_engine: Option<usize>,
    /// Maximum number of frames being reassembled at once per connection.
    pub max_pending_frames: usize,
    /// Maximum size of one reassembled frame payload.
    pub max_reassembly_size: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            read_timeout: Some(Duration::from_secs(1)),
            write_timeout: Some(Duration::from_secs(1)),
            idle_timeout: Some(Duration::from_secs(30)),
            max_connections: None,
            max_frame_size: MAX_FRAME_SIZE,
            supported_versions: vec![SPOP_VERSION.to_string()],
            capabilities: vec![
                CAP_PIPELINING.to_string(),
                CAP_ASYNC.to_string(),
                CAP_FRAGMENTATION.to_string(),
            ],
            max_streams_per_engine: None,
            max_pending_frames: 64,
            max_reassembly_size: 1024 * 1024,
        }
    }
}

impl AgentConfig {
    /// Check value ranges before the agent starts accepting.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_NEGOTIATED_FRAME_SIZE..=MAX_FRAME_SIZE).contains(&self.max_frame_size) {
            return Err(AgentError::Config(format!(
                "max_frame_size {} outside {}..={}",
                self.max_frame_size, MIN_NEGOTIATED_FRAME_SIZE, MAX_FRAME_SIZE
            )));
        }
        if self.supported_versions.is_empty() {
            return Err(AgentError::Config(
                "at least one supported version is required".to_string(),
            ));
        }
        if self.max_connections == Some(0) {
            return Err(AgentError::Config(
                "max_connections must be positive when set".to_string(),
            ));
        }
        if self.max_pending_frames == 0 {
            return Err(AgentError::Config(
                "max_pending_frames must be positive".to_string(),
            ));
        }
        if self.max_reassembly_size < self.max_frame_size {
            return Err(AgentError::Config(format!(
                "max_reassembly_size {} is below max_frame_size {}",
                self.max_reassembly_size, self.max_frame_size
            )));
        }
        Ok(())
    }

    /// Frame reader/writer settings for a connection. Until the handshake
    /// completes the agent's own ceiling applies.
    pub fn frame_config(&self) -> FrameConfig {
        FrameConfig {
            max_frame_size: self.max_frame_size,
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
            idle_timeout: self.idle_timeout,
        }
    }
}
