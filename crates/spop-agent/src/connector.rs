//! Proxy side of a connection, for probes, tooling and tests.

use std::collections::HashMap;
use std::time::Duration;

use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use spop_frame::payload::{CAP_ASYNC, CAP_FRAGMENTATION, CAP_PIPELINING};
use spop_frame::{
    decode_kv, Actions, AgentHello, Disconnect, Frame, FrameError, FrameType, Hello, Message,
    SpopCodec, StatusCode, MAX_FRAME_SIZE,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_util::codec::Framed;

use crate::error::{AgentError, Result};
use crate::handshake::SPOP_VERSION;

/// What the client announces in HELLO.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub supported_versions: Vec<String>,
    pub max_frame_size: usize,
    pub capabilities: Vec<String>,
    pub engine_id: Option<String>,
    pub healthcheck: bool,
    /// Deadline for each exchange (handshake, one NOTIFY, disconnect).
    pub timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            supported_versions: vec![SPOP_VERSION.to_string()],
            max_frame_size: MAX_FRAME_SIZE,
            capabilities: vec![
                CAP_PIPELINING.to_string(),
                CAP_ASYNC.to_string(),
                CAP_FRAGMENTATION.to_string(),
            ],
            engine_id: None,
            healthcheck: false,
            timeout: Some(Duration::from_secs(5)),
        }
    }
}

impl ClientConfig {
    fn hello(&self) -> Hello {
        Hello {
            supported_versions: Some(self.supported_versions.clone()),
            max_frame_size: Some(self.max_frame_size as u64),
            capabilities: Some(self.capabilities.clone()),
            healthcheck: self.healthcheck,
            engine_id: self.engine_id.clone(),
        }
    }
}

/// A connection to an agent after a successful handshake.
pub struct Client<S = TcpStream> {
    framed: Framed<S, SpopCodec>,
    negotiated: AgentHello,
    timeout: Option<Duration>,
    next_stream_id: u64,
    /// ACK fragments being reassembled, keyed by (stream id, frame id).
    partial_acks: HashMap<(u64, u64), BytesMut>,
}

/// Connect with the default HELLO.
pub async fn connect(addr: impl ToSocketAddrs) -> Result<Client> {
    Client::connect(addr).await
}

impl Client {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        Self::connect_with_config(addr, ClientConfig::default()).await
    }

    pub async fn connect_with_config(
        addr: impl ToSocketAddrs,
        config: ClientConfig,
    ) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Self::handshake(stream, config).await
    }

    /// Send a health-check HELLO and return the agent's answer. The agent
    /// closes the connection right after.
    pub async fn healthcheck(addr: impl ToSocketAddrs) -> Result<AgentHello> {
        let config = ClientConfig {
            healthcheck: true,
            ..ClientConfig::default()
        };
        let client = Self::connect_with_config(addr, config).await?;
        Ok(client.negotiated)
    }
}

impl<S> Client<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Run the HELLO exchange over an established stream.
    pub async fn handshake(stream: S, config: ClientConfig) -> Result<Self> {
        let mut framed = Framed::new(stream, SpopCodec::new(config.max_frame_size));
        let timeout = config.timeout;

        let negotiated = with_timeout(timeout, "handshake", async {
            framed.send(config.hello().to_frame()).await?;
            let frame = next_frame(&mut framed).await?;
            match frame.frame_type {
                FrameType::AgentHello => {
                    let (kv, _) = decode_kv(&frame.payload)?;
                    AgentHello::from_kv(&kv).ok_or_else(|| AgentError::HandshakeFailed {
                        status: StatusCode::Invalid,
                        reason: "AGENT-HELLO without version or max-frame-size".to_string(),
                    })
                }
                FrameType::AgentDisconnect => Err(disconnected(&frame)),
                other => Err(AgentError::ProtocolViolation(format!(
                    "expected AGENT-HELLO, got {other}"
                ))),
            }
        })
        .await?;

        framed
            .codec_mut()
            .set_max_frame_size(negotiated.max_frame_size as usize);
        tracing::debug!(
            version = %negotiated.version,
            max_frame_size = negotiated.max_frame_size,
            capabilities = ?negotiated.capabilities,
            "connected to agent"
        );

        Ok(Self {
            framed,
            negotiated,
            timeout,
            next_stream_id: 1,
            partial_acks: HashMap::new(),
        })
    }

    /// Values the agent answered with in AGENT-HELLO.
    pub fn negotiated(&self) -> &AgentHello {
        &self.negotiated
    }

    pub fn max_frame_size(&self) -> usize {
        self.negotiated.max_frame_size as usize
    }

    /// Send one NOTIFY on a fresh stream and wait for its ACK.
    pub async fn notify(&mut self, messages: &[Message]) -> Result<Actions> {
        let stream_id = self.next_stream_id;
        self.next_stream_id += 1;
        self.notify_on(stream_id, 1, messages).await
    }

    /// Send one NOTIFY with explicit ids and wait for the matching ACK.
    ///
    /// ACKs for other frames arriving first are a protocol violation here;
    /// use [`send_frame`](Self::send_frame) and [`recv_ack`](Self::recv_ack)
    /// to drive several frames at once.
    pub async fn notify_on(
        &mut self,
        stream_id: u64,
        frame_id: u64,
        messages: &[Message],
    ) -> Result<Actions> {
        let frame = Frame::notify(stream_id, frame_id, messages)?;
        with_timeout(self.timeout, "notify", async {
            self.framed.send(frame).await?;
            let (sid, fid, actions) = self.read_ack().await?;
            if (sid, fid) != (stream_id, frame_id) {
                return Err(AgentError::ProtocolViolation(format!(
                    "ACK for stream {sid} frame {fid} while waiting for stream {stream_id} frame {frame_id}"
                )));
            }
            Ok(actions)
        })
        .await
    }

    /// Send a raw frame (fragments, ABORT, malformed sequences).
    pub async fn send_frame(&mut self, frame: Frame) -> Result<()> {
        with_timeout(self.timeout, "send", async {
            self.framed.send(frame).await?;
            Ok(())
        })
        .await
    }

    /// Wait for the next complete ACK, whatever frame it answers.
    pub async fn recv_ack(&mut self) -> Result<(u64, u64, Actions)> {
        with_timeout(self.timeout, "ack", self.read_ack()).await
    }

    /// Wait for the next frame as it arrives on the wire.
    pub async fn recv_frame(&mut self) -> Result<Frame> {
        with_timeout(self.timeout, "recv", next_frame(&mut self.framed)).await
    }

    /// Send DISCONNECT and wait for AGENT-DISCONNECT. ACKs still in flight
    /// are read and dropped.
    pub async fn disconnect(mut self) -> Result<Disconnect> {
        let bye = Disconnect::with_message(StatusCode::Normal, "client closing");
        with_timeout(self.timeout, "disconnect", async {
            self.framed
                .send(bye.to_frame(FrameType::HaproxyDisconnect))
                .await?;
            loop {
                let frame = next_frame(&mut self.framed).await?;
                match frame.frame_type {
                    FrameType::AgentDisconnect => {
                        let (kv, _) = decode_kv(&frame.payload)?;
                        return Ok(Disconnect::from_kv(&kv));
                    }
                    FrameType::Ack | FrameType::Unset => continue,
                    other => {
                        return Err(AgentError::ProtocolViolation(format!(
                            "unexpected {other} frame while disconnecting"
                        )))
                    }
                }
            }
        })
        .await
    }

    async fn read_ack(&mut self) -> Result<(u64, u64, Actions)> {
        loop {
            let frame = next_frame(&mut self.framed).await?;
            let key = (frame.stream_id, frame.frame_id);
            match frame.frame_type {
                FrameType::Ack | FrameType::Unset => {}
                FrameType::AgentDisconnect => return Err(disconnected(&frame)),
                other => {
                    return Err(AgentError::ProtocolViolation(format!(
                        "expected ACK, got {other}"
                    )))
                }
            }

            let payload = match self.partial_acks.remove(&key) {
                Some(mut pending) => {
                    pending.extend_from_slice(&frame.payload);
                    pending.freeze()
                }
                None if frame.frame_type == FrameType::Unset => {
                    return Err(AgentError::FrameIdNotFound {
                        stream_id: key.0,
                        frame_id: key.1,
                    })
                }
                None => frame.payload.clone(),
            };
            if !frame.is_fin() {
                self.partial_acks.insert(key, BytesMut::from(&payload[..]));
                continue;
            }
            return Ok((key.0, key.1, Actions::decode(&payload)?));
        }
    }
}

async fn next_frame<S>(framed: &mut Framed<S, SpopCodec>) -> Result<Frame>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match framed.next().await {
        Some(frame) => Ok(frame?),
        None => Err(FrameError::ConnectionClosed.into()),
    }
}

fn disconnected(frame: &Frame) -> AgentError {
    let bye = decode_kv(&frame.payload)
        .map(|(kv, _)| Disconnect::from_kv(&kv))
        .unwrap_or_else(|_| Disconnect::new(StatusCode::Unknown));
    AgentError::Disconnected {
        status_code: bye.status_code,
        message: bye.message,
    }
}

async fn with_timeout<T>(
    limit: Option<Duration>,
    op: &'static str,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match limit {
        Some(timeout) => tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| AgentError::Frame(FrameError::Timeout { op, timeout }))?,
        None => fut.await,
    }
}
