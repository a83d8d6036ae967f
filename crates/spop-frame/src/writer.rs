use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::codec::{encode_frame, Frame, FrameConfig};
use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 16 * 1024;

/// Writes complete frames to any `AsyncWrite` stream.
pub struct FrameWriter<W> {
    inner: W,
    buf: BytesMut,
    config: FrameConfig,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Create a new frame writer with default configuration.
    pub fn new(inner: W) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame writer with explicit configuration.
    pub fn with_config(inner: W, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Write one complete frame and flush.
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.write_frames(std::slice::from_ref(frame)).await
    }

    /// Write a run of frames (typically fragments of one logical frame)
    /// with a single flush. Either every frame encodes or nothing is sent.
    pub async fn write_frames(&mut self, frames: &[Frame]) -> Result<()> {
        self.buf.clear();
        for frame in frames {
            encode_frame(frame, &mut self.buf, self.config.max_frame_size)?;
        }

        tracing::trace!(frames = frames.len(), bytes = self.buf.len(), "writing frames");

        let Self { inner, buf, config } = self;
        with_deadline("write", config.write_timeout, async {
            inner.write_all(&buf[..]).await?;
            inner.flush().await
        })
        .await
    }

    /// Shut down the write half of the stream.
    pub async fn shutdown(&mut self) -> Result<()> {
        with_deadline("shutdown", self.config.write_timeout, self.inner.shutdown()).await
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> W {
        self.inner
    }

    /// Update maximum frame size for subsequent frame encoding.
    pub fn set_max_frame_size(&mut self, max_frame_size: usize) {
        self.config.max_frame_size = max_frame_size;
    }

    /// Current frame writer configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

async fn with_deadline(
    op: &'static str,
    limit: Option<Duration>,
    fut: impl std::future::Future<Output = std::io::Result<()>>,
) -> Result<()> {
    let outcome = match limit {
        Some(timeout) => tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| FrameError::Timeout { op, timeout })?,
        None => fut.await,
    };
    outcome.map_err(|err| match err.kind() {
        std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::WriteZero => {
            FrameError::ConnectionClosed
        }
        _ => FrameError::Io(err),
    })
}
