//! One proxy connection, from HELLO to close.
//!
//! ```text
//! HANDSHAKING ──► ACTIVE ──► DRAINING ──► CLOSED
//!      │            │                       ▲
//!      └────────────┴── error / EOF ────────┘
//! ```
//!
//! The read loop reassembles NOTIFY fragments and hands each complete
//! request to the worker of its stream. Workers run the handler on the
//! blocking pool and queue the ACK on the connection's writer task, which
//! is the only code that touches the socket's write half.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use spop_frame::{
    decode_kv, decode_messages_with, fragment_frame, Actions, Disconnect, Frame, FrameError,
    FrameReader, FrameType, FrameWriter, Hello, StatusCode,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::handler::{Handler, Messages};
use crate::handshake::{handshake_server, Negotiated};
use crate::pool::Pools;
use crate::registry::{EngineKey, EngineRegistry};
use crate::request::Request;

/// Queued writes per connection before workers wait on the writer.
const OUTBOUND_QUEUE: usize = 256;

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Handshaking,
    Active,
    Draining,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Handshaking => "handshaking",
            Self::Active => "active",
            Self::Draining => "draining",
            Self::Closed => "closed",
        })
    }
}

/// Everything a session borrows from its agent.
pub struct SessionContext {
    pub config: AgentConfig,
    pub handler: Arc<dyn Handler>,
    pub pools: Arc<Pools>,
    pub registry: Arc<EngineRegistry>,
}

impl SessionContext {
    pub fn new(config: AgentConfig, handler: impl Handler) -> Self {
        let registry = EngineRegistry::new(config.max_streams_per_engine);
        Self {
            config,
            handler: Arc::new(handler),
            pools: Arc::new(Pools::new()),
            registry: Arc::new(registry),
        }
    }
}

/// Serve one connection until it closes.
///
/// Cancelling `shutdown` drains the session: no new frames are read,
/// in-flight requests are answered, then AGENT-DISCONNECT is sent.
pub async fn serve_connection<S>(
    ctx: Arc<SessionContext>,
    conn_id: u64,
    stream: S,
    shutdown: CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let span = tracing::info_span!("conn", conn_id);
    run_session(ctx, conn_id, stream, shutdown)
        .instrument(span)
        .await
}

async fn run_session<S>(
    ctx: Arc<SessionContext>,
    conn_id: u64,
    stream: S,
    shutdown: CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let frame_config = ctx.config.frame_config();
    let mut reader = FrameReader::with_config(read_half, frame_config.clone());
    let mut writer = FrameWriter::with_config(write_half, frame_config);

    debug!(state = %SessionState::Handshaking, "session started");
    let negotiated = match handshake_server(&mut reader, &mut writer, &ctx.config).await {
        Ok(negotiated) => negotiated,
        Err(err) => {
            let _ = writer.shutdown().await;
            debug!(state = %SessionState::Closed, error = %err, "handshake failed");
            return Err(err);
        }
    };

    if negotiated.healthcheck {
        let _ = writer.shutdown().await;
        debug!(state = %SessionState::Closed, "health check answered");
        return Ok(());
    }

    ctx.registry.register(EngineKey {
        max_frame_size: negotiated.max_frame_size,
        engine_id: negotiated.engine_id.clone(),
        conn_id,
    })?;

    let lost = CancellationToken::new();
    let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
    let writer_task =
        tokio::spawn(run_writer(writer, outbound_rx, lost.clone()).in_current_span());
    let (done_tx, done_rx) = mpsc::unbounded_channel();

    let mut session = ActiveSession {
        reassembly: Reassembly::new(
            ctx.config.max_pending_frames,
            ctx.config.max_reassembly_size,
            negotiated.fragmentation(),
        ),
        shared: WorkerShared {
            ctx: Arc::clone(&ctx),
            outbound,
            done: done_tx,
            max_frame_size: negotiated.max_frame_size,
            fragmentation: negotiated.fragmentation(),
        },
        ctx: Arc::clone(&ctx),
        conn_id,
        negotiated,
        streams: HashMap::new(),
        in_flight: 0,
        done_rx,
        lost,
    };

    debug!(state = %SessionState::Active, "session active");
    let exit = session.read_loop(&mut reader, &shutdown).await;

    let (last_frame, result) = match exit {
        LoopExit::Drain { reason } => {
            debug!(
                state = %SessionState::Draining,
                reason = %reason,
                in_flight = session.in_flight,
                "draining"
            );
            session.drain().await;
            let bye = Disconnect::with_message(StatusCode::Normal, reason);
            (Some(bye.to_frame(FrameType::AgentDisconnect)), Ok(()))
        }
        LoopExit::PeerClosed { partial } => {
            if partial {
                warn!("peer closed the connection in the middle of a frame");
            } else {
                debug!("peer closed the connection");
            }
            (None, Ok(()))
        }
        LoopExit::WriterGone => (None, Err(AgentError::Frame(FrameError::ConnectionClosed))),
        LoopExit::Failed(err) => {
            let status = err.status_code();
            if err.is_connection_lost() {
                warn!(error = %err, "connection lost");
                (None, Err(err))
            } else {
                warn!(error = %err, status = status.code(), "closing connection");
                let bye = Disconnect::with_message(status, err.to_string());
                (Some(bye.to_frame(FrameType::AgentDisconnect)), Err(err))
            }
        }
    };

    session.close(last_frame, writer_task).await;
    debug!(state = %SessionState::Closed, pools = ?ctx.pools.stats(), "session closed");
    result
}

enum LoopExit {
    /// Peer DISCONNECT or agent shutdown.
    Drain { reason: String },
    PeerClosed { partial: bool },
    WriterGone,
    Failed(AgentError),
}

enum Outbound {
    Frames(Vec<Frame>),
    /// Write the optional final frame, then shut the socket down.
    Close(Option<Frame>),
}

enum Job {
    Handle {
        request: Request,
        token: CancellationToken,
    },
    /// Refused at the engine ceiling; answered with an empty ACK in stream order.
    Refuse {
        frame_id: u64,
        token: CancellationToken,
    },
}

struct Completion {
    stream_id: u64,
    /// Whether the job held a registry stream count.
    counted: bool,
}

struct StreamSlot {
    jobs: mpsc::UnboundedSender<Job>,
    token: CancellationToken,
    in_flight: usize,
}

#[derive(Clone)]
struct WorkerShared {
    ctx: Arc<SessionContext>,
    outbound: mpsc::Sender<Outbound>,
    done: mpsc::UnboundedSender<Completion>,
    max_frame_size: usize,
    fragmentation: bool,
}

struct ActiveSession {
    ctx: Arc<SessionContext>,
    conn_id: u64,
    negotiated: Negotiated,
    reassembly: Reassembly,
    streams: HashMap<u64, StreamSlot>,
    in_flight: usize,
    shared: WorkerShared,
    done_rx: mpsc::UnboundedReceiver<Completion>,
    /// Cancelled when the connection dies; parent of every stream token.
    lost: CancellationToken,
}

impl ActiveSession {
    async fn read_loop<R>(
        &mut self,
        reader: &mut FrameReader<R>,
        shutdown: &CancellationToken,
    ) -> LoopExit
    where
        R: AsyncRead + Unpin,
    {
        loop {
            tokio::select! {
                biased;
                _ = self.lost.cancelled() => return LoopExit::WriterGone,
                _ = shutdown.cancelled() => {
                    return LoopExit::Drain { reason: "agent shutting down".to_string() };
                }
                Some(done) = self.done_rx.recv() => self.complete(done),
                read = reader.read_frame() => match read {
                    Ok(frame) => match self.on_frame(frame).await {
                        Ok(None) => {}
                        Ok(Some(exit)) => return exit,
                        Err(err) => return LoopExit::Failed(err),
                    },
                    Err(FrameError::ConnectionClosed) => {
                        return LoopExit::PeerClosed { partial: reader.has_partial_frame() };
                    }
                    Err(err) => return LoopExit::Failed(err.into()),
                },
            }
        }
    }

    async fn on_frame(&mut self, frame: Frame) -> Result<Option<LoopExit>> {
        match frame.frame_type {
            FrameType::Notify | FrameType::Unset => {
                self.on_notify(frame).await?;
                Ok(None)
            }
            FrameType::HaproxyDisconnect => {
                let peer = decode_kv(&frame.payload)
                    .map(|(kv, _)| Disconnect::from_kv(&kv))
                    .unwrap_or_else(|_| Disconnect::new(StatusCode::Unknown));
                info!(
                    status = peer.status_code,
                    message = %peer.message,
                    "peer disconnected"
                );
                Ok(Some(LoopExit::Drain {
                    reason: "peer disconnected".to_string(),
                }))
            }
            FrameType::HaproxyHello => {
                let (kv, _) = decode_kv(&frame.payload)?;
                let hello = Hello::from_kv(&kv);
                self.ctx.registry.register(EngineKey {
                    max_frame_size: self.negotiated.max_frame_size,
                    engine_id: hello.engine_id.unwrap_or_default(),
                    conn_id: self.conn_id,
                })?;
                Err(AgentError::ProtocolViolation(
                    "HAPROXY-HELLO after handshake".to_string(),
                ))
            }
            other => Err(AgentError::ProtocolViolation(format!(
                "unexpected {other} frame from proxy"
            ))),
        }
    }

    async fn on_notify(&mut self, frame: Frame) -> Result<()> {
        let (stream_id, frame_id) = (frame.stream_id, frame.frame_id);
        if frame.is_abort() {
            self.abort_stream(stream_id, frame_id);
            return Ok(());
        }

        match self.reassembly.push(frame)? {
            Some(payload) => self.dispatch(stream_id, frame_id, payload).await,
            None => Ok(()),
        }
    }

    fn abort_stream(&mut self, stream_id: u64, frame_id: u64) {
        let discarded = self.reassembly.discard_stream(stream_id);
        if let Some(slot) = self.streams.get_mut(&stream_id) {
            slot.token.cancel();
            slot.token = self.lost.child_token();
        }
        debug!(stream_id, frame_id, discarded, "stream aborted");
    }

    async fn dispatch(&mut self, stream_id: u64, frame_id: u64, payload: Bytes) -> Result<()> {
        match self.ctx.registry.begin_stream(self.conn_id) {
            Ok(()) => {}
            Err(err @ AgentError::CapacityExceeded { .. }) => {
                warn!(stream_id, frame_id, error = %err, "stream refused");
                self.refuse(stream_id, frame_id).await;
                return Ok(());
            }
            Err(err) => return Err(err),
        }

        let pools = &self.ctx.pools;
        let mut request = pools.acquire_request();
        request.engine_id.push_str(&self.negotiated.engine_id);
        request.stream_id = stream_id;
        request.frame_id = frame_id;
        if let Err(err) =
            decode_messages_with(&payload, &mut request.messages, || pools.acquire_message())
        {
            pools.release_request(request);
            self.ctx.registry.end_stream(self.conn_id);
            return Err(err.into());
        }

        let slot = stream_slot(&mut self.streams, stream_id, &self.shared, &self.lost);
        let job = Job::Handle {
            request,
            token: slot.token.clone(),
        };
        if let Err(mpsc::error::SendError(job)) = slot.jobs.send(job) {
            error!(stream_id, "stream worker stopped unexpectedly");
            self.streams.remove(&stream_id);
            if let Job::Handle { request, .. } = job {
                self.ctx.pools.release_request(request);
            }
            self.ctx.registry.end_stream(self.conn_id);
            return Ok(());
        }
        slot.in_flight += 1;
        self.in_flight += 1;
        Ok(())
    }

    /// Queue an empty ACK behind the frames already pending on the stream.
    async fn refuse(&mut self, stream_id: u64, frame_id: u64) {
        let slot = stream_slot(&mut self.streams, stream_id, &self.shared, &self.lost);
        let job = Job::Refuse {
            frame_id,
            token: slot.token.clone(),
        };
        if slot.jobs.send(job).is_ok() {
            slot.in_flight += 1;
            self.in_flight += 1;
            return;
        }

        error!(stream_id, "stream worker stopped unexpectedly");
        self.streams.remove(&stream_id);
        let empty = Frame::ack(stream_id, frame_id, &Actions::new());
        if self.shared.outbound.send(Outbound::Frames(vec![empty])).await.is_err() {
            debug!("writer gone while refusing stream");
        }
    }

    fn complete(&mut self, done: Completion) {
        if done.counted {
            self.ctx.registry.end_stream(self.conn_id);
        }
        self.in_flight = self.in_flight.saturating_sub(1);
        if let Entry::Occupied(mut entry) = self.streams.entry(done.stream_id) {
            let slot = entry.get_mut();
            slot.in_flight = slot.in_flight.saturating_sub(1);
            if slot.in_flight == 0 {
                entry.remove();
            }
        }
    }

    /// Wait for every dispatched request to be answered or discarded.
    async fn drain(&mut self) {
        while self.in_flight > 0 {
            tokio::select! {
                biased;
                _ = self.lost.cancelled() => break,
                done = self.done_rx.recv() => match done {
                    Some(done) => self.complete(done),
                    None => break,
                },
            }
        }
    }

    async fn close(
        mut self,
        last_frame: Option<Frame>,
        writer_task: tokio::task::JoinHandle<()>,
    ) {
        if self.in_flight > 0 {
            debug!(in_flight = self.in_flight, "cancelling in-flight requests");
        }
        self.lost.cancel();
        self.streams.clear();

        if self
            .shared
            .outbound
            .send(Outbound::Close(last_frame))
            .await
            .is_err()
        {
            debug!("writer already stopped");
        }
        drop(self.shared);

        if let Err(err) = writer_task.await {
            error!(error = %err, "writer task failed");
        }
        let leftover = self.ctx.registry.unregister(self.conn_id);
        if leftover > 0 {
            debug!(leftover, "released stream counters of closed connection");
        }
    }
}

async fn run_writer<W>(
    mut writer: FrameWriter<W>,
    mut rx: mpsc::Receiver<Outbound>,
    lost: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(command) = rx.recv().await {
        match command {
            Outbound::Frames(frames) => {
                if let Err(err) = writer.write_frames(&frames).await {
                    warn!(error = %err, "write failed");
                    lost.cancel();
                    return;
                }
            }
            Outbound::Close(last) => {
                if let Some(frame) = last {
                    if let Err(err) = writer.write_frame(&frame).await {
                        debug!(error = %err, "could not deliver AGENT-DISCONNECT");
                    }
                }
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
}

fn stream_slot<'a>(
    streams: &'a mut HashMap<u64, StreamSlot>,
    stream_id: u64,
    shared: &WorkerShared,
    lost: &CancellationToken,
) -> &'a mut StreamSlot {
    match streams.entry(stream_id) {
        Entry::Occupied(entry) => entry.into_mut(),
        Entry::Vacant(entry) => {
            let (jobs, jobs_rx) = mpsc::unbounded_channel();
            tokio::spawn(run_stream_worker(stream_id, jobs_rx, shared.clone()).in_current_span());
            entry.insert(StreamSlot {
                jobs,
                token: lost.child_token(),
                in_flight: 0,
            })
        }
    }
}

async fn run_stream_worker(
    stream_id: u64,
    mut jobs: mpsc::UnboundedReceiver<Job>,
    shared: WorkerShared,
) {
    while let Some(job) = jobs.recv().await {
        let counted = match job {
            Job::Handle { request, token } => {
                process_request(request, token, &shared).await;
                true
            }
            Job::Refuse { frame_id, token } => {
                if token.is_cancelled() {
                    debug!(stream_id, frame_id, "discarding refusal of aborted request");
                } else {
                    let empty = Frame::ack(stream_id, frame_id, &Actions::new());
                    let _ = shared.outbound.send(Outbound::Frames(vec![empty])).await;
                }
                false
            }
        };
        let _ = shared.done.send(Completion { stream_id, counted });
    }
}

async fn process_request(mut request: Request, token: CancellationToken, shared: &WorkerShared) {
    let (stream_id, frame_id) = (request.stream_id, request.frame_id);
    if token.is_cancelled() {
        debug!(stream_id, frame_id, "discarding aborted request");
        shared.ctx.pools.release_request(request);
        return;
    }

    let handler = Arc::clone(&shared.ctx.handler);
    let joined = tokio::task::spawn_blocking(move || {
        let outcome = {
            let Request {
                engine_id,
                stream_id,
                frame_id,
                messages,
                actions,
            } = &mut request;
            panic::catch_unwind(AssertUnwindSafe(|| {
                handler.handle(
                    Messages::new(engine_id, *stream_id, *frame_id, messages),
                    actions,
                )
            }))
        };
        (request, outcome)
    })
    .await;

    let request = match joined {
        Ok((request, Ok(Ok(())))) => request,
        Ok((mut request, Ok(Err(err)))) => {
            warn!(stream_id, frame_id, error = %err, "handler failed, sending empty ACK");
            request.actions.clear();
            request
        }
        Ok((mut request, Err(payload))) => {
            error!(
                stream_id,
                frame_id,
                panic = panic_message(payload.as_ref()),
                "handler panicked, sending empty ACK"
            );
            request.actions.clear();
            request
        }
        Err(err) => {
            error!(stream_id, frame_id, error = %err, "handler task failed");
            if !token.is_cancelled() {
                let empty = Frame::ack(stream_id, frame_id, &Actions::new());
                let _ = shared.outbound.send(Outbound::Frames(vec![empty])).await;
            }
            return;
        }
    };

    if token.is_cancelled() {
        debug!(stream_id, frame_id, "discarding result of cancelled request");
        shared.ctx.pools.release_request(request);
        return;
    }

    let frames = build_ack(
        stream_id,
        frame_id,
        &request.actions,
        shared.max_frame_size,
        shared.fragmentation,
    );
    shared.ctx.pools.release_request(request);
    if shared.outbound.send(Outbound::Frames(frames)).await.is_err() {
        debug!(stream_id, frame_id, "connection closed before ACK could be queued");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

/// ACK frames for one request. An ACK above the frame ceiling is split when
/// fragmentation was negotiated, otherwise replaced by an empty ACK.
fn build_ack(
    stream_id: u64,
    frame_id: u64,
    actions: &Actions,
    max_frame_size: usize,
    fragmentation: bool,
) -> Vec<Frame> {
    let ack = Frame::ack(stream_id, frame_id, actions);
    let size = ack.frame_len();
    if size <= max_frame_size {
        return vec![ack];
    }
    if fragmentation {
        match fragment_frame(ack, max_frame_size) {
            Ok(fragments) => return fragments,
            Err(err) => warn!(stream_id, frame_id, error = %err, "cannot fragment ACK"),
        }
    }
    warn!(
        stream_id,
        frame_id,
        size,
        max_frame_size,
        actions = actions.len(),
        "ACK exceeds max-frame-size, sending empty ACK"
    );
    vec![Frame::ack(stream_id, frame_id, &Actions::new())]
}

/// Buffers NOTIFY fragments keyed by (stream id, frame id) until FIN.
struct Reassembly {
    pending: HashMap<(u64, u64), BytesMut>,
    max_pending: usize,
    max_size: usize,
    fragmentation: bool,
}

impl Reassembly {
    fn new(max_pending: usize, max_size: usize, fragmentation: bool) -> Self {
        Self {
            pending: HashMap::new(),
            max_pending,
            max_size,
            fragmentation,
        }
    }

    /// Feed one NOTIFY or continuation frame. Returns the whole payload once
    /// the frame carrying FIN arrives.
    fn push(&mut self, frame: Frame) -> Result<Option<Bytes>> {
        let key = (frame.stream_id, frame.frame_id);

        if let Some(buf) = self.pending.get_mut(&key) {
            let size = buf.len() + frame.payload.len();
            if size > self.max_size {
                self.pending.remove(&key);
                return Err(AgentError::ReassemblyTooLarge {
                    size,
                    max: self.max_size,
                });
            }
            buf.extend_from_slice(&frame.payload);
            if !frame.is_fin() {
                return Ok(None);
            }
            return Ok(self.pending.remove(&key).map(BytesMut::freeze));
        }

        if frame.frame_type == FrameType::Unset {
            return Err(AgentError::FrameIdNotFound {
                stream_id: frame.stream_id,
                frame_id: frame.frame_id,
            });
        }
        if frame.is_fin() {
            return Ok(Some(frame.payload));
        }

        if !self.fragmentation {
            return Err(AgentError::FragmentationNotSupported {
                stream_id: frame.stream_id,
            });
        }
        if self.pending.len() >= self.max_pending {
            return Err(AgentError::InterlacedFrames(format!(
                "{} frames already being reassembled",
                self.pending.len()
            )));
        }
        if frame.payload.len() > self.max_size {
            return Err(AgentError::ReassemblyTooLarge {
                size: frame.payload.len(),
                max: self.max_size,
            });
        }
        self.pending.insert(key, BytesMut::from(&frame.payload[..]));
        Ok(None)
    }

    /// Drop every partial frame of a stream. Returns how many were dropped.
    fn discard_stream(&mut self, stream_id: u64) -> usize {
        let before = self.pending.len();
        self.pending.retain(|(sid, _), _| *sid != stream_id);
        before - self.pending.len()
    }
}
