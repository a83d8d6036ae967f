use std::io::ErrorKind;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::Instant;
use tokio_util::codec::Decoder;

use crate::codec::{Frame, FrameConfig, SpopCodec};
use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 16 * 1024;

/// Reads complete frames from any `AsyncRead` stream.
///
/// Handles partial reads internally; callers always get complete frames.
/// While the buffer is empty the idle timeout applies; once part of a frame
/// has arrived the rest must come within the read timeout.
///
/// Both deadlines are fixed when their phase starts and kept across calls,
/// so dropping a pending `read_frame` future (e.g. in `select!`) and calling
/// it again does not extend them.
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
    codec: SpopCodec,
    config: FrameConfig,
    deadline: Option<Deadline>,
}

#[derive(Debug, Clone, Copy)]
struct Deadline {
    op: &'static str,
    at: Instant,
    timeout: Duration,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Create a new frame reader with default configuration.
    pub fn new(inner: R) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame reader with explicit configuration.
    pub fn with_config(inner: R, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            codec: SpopCodec::new(config.max_frame_size),
            config,
            deadline: None,
        }
    }

    /// Read the next complete frame.
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` when EOF is reached.
    pub async fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.buf)? {
                self.deadline = None;
                return Ok(frame);
            }

            let deadline = if self.buf.is_empty() {
                self.arm("idle", self.config.idle_timeout)
            } else {
                self.arm("read", self.config.read_timeout)
            };

            let read = match read_until(&mut self.inner, &mut self.buf, deadline).await? {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            };

            if read == 0 {
                return Err(FrameError::ConnectionClosed);
            }
        }
    }

    /// Deadline of the current phase, armed on first use.
    fn arm(&mut self, op: &'static str, limit: Option<Duration>) -> Option<Deadline> {
        let Some(timeout) = limit else {
            self.deadline = None;
            return None;
        };
        match self.deadline {
            Some(deadline) if deadline.op == op => Some(deadline),
            _ => {
                let deadline = Deadline {
                    op,
                    at: Instant::now() + timeout,
                    timeout,
                };
                self.deadline = Some(deadline);
                Some(deadline)
            }
        }
    }

    /// Whether part of a frame is buffered.
    pub fn has_partial_frame(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Update maximum frame size for subsequent frame decoding.
    pub fn set_max_frame_size(&mut self, max_frame_size: usize) {
        self.config.max_frame_size = max_frame_size;
        self.codec.set_max_frame_size(max_frame_size);
    }

    /// Current frame reader configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

async fn read_until<R: AsyncRead + Unpin>(
    inner: &mut R,
    buf: &mut BytesMut,
    deadline: Option<Deadline>,
) -> Result<std::io::Result<usize>> {
    match deadline {
        Some(Deadline { op, at, timeout }) => tokio::time::timeout_at(at, inner.read_buf(buf))
            .await
            .map_err(|_| FrameError::Timeout { op, timeout }),
        None => Ok(inner.read_buf(buf).await),
    }
}
