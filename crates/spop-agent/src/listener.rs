use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::error::Result;
use crate::handler::Handler;
use crate::pool::Pools;
use crate::registry::EngineRegistry;
use crate::session::{serve_connection, SessionContext};

/// Pause after an accept error that is not tied to a single connection
/// (descriptor exhaustion and the like).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Accepts proxy connections and runs one session per connection.
///
/// ```no_run
/// use spop_agent::{Actions, Agent, HandlerError, Messages, Scope};
///
/// # async fn run() -> spop_agent::Result<()> {
/// let agent = Agent::new(|messages: Messages<'_>, actions: &mut Actions| -> Result<(), HandlerError> {
///     for message in messages {
///         actions.set_var(Scope::Transaction, message.name.clone(), true);
///     }
///     Ok(())
/// });
/// agent.listen_and_serve("127.0.0.1:12345").await
/// # }
/// ```
pub struct Agent {
    ctx: Arc<SessionContext>,
    shutdown: CancellationToken,
    next_conn_id: AtomicU64,
    connection_limit: Option<Arc<Semaphore>>,
}

impl Agent {
    /// Agent with the default configuration.
    pub fn new(handler: impl Handler) -> Self {
        Self::build(AgentConfig::default(), handler)
    }

    /// Agent with an explicit configuration, validated up front.
    pub fn with_config(config: AgentConfig, handler: impl Handler) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config, handler))
    }

    fn build(config: AgentConfig, handler: impl Handler) -> Self {
        let connection_limit = config
            .max_connections
            .map(|limit| Arc::new(Semaphore::new(limit)));
        Self {
            ctx: Arc::new(SessionContext::new(config, handler)),
            shutdown: CancellationToken::new(),
            next_conn_id: AtomicU64::new(1),
            connection_limit,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.ctx.config
    }

    /// Engine registry shared by all sessions of this agent.
    pub fn registry(&self) -> &Arc<EngineRegistry> {
        &self.ctx.registry
    }

    pub fn pools(&self) -> &Arc<Pools> {
        &self.ctx.pools
    }

    /// Token that stops the accept loop and drains every session when
    /// cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Bind `addr` and serve until shutdown.
    pub async fn listen_and_serve(&self, addr: impl ToSocketAddrs) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener until shutdown.
    ///
    /// With `max_connections` set, the loop stops accepting while the
    /// ceiling is reached. On shutdown it waits for every session to drain.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        info!(%local_addr, max_connections = ?self.ctx.config.max_connections, "agent listening");

        let mut sessions = JoinSet::new();
        loop {
            let permit = match &self.connection_limit {
                Some(limit) => {
                    let limit = Arc::clone(limit);
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        permit = limit.acquire_owned() => match permit {
                            Ok(permit) => Some(permit),
                            Err(_) => break,
                        },
                    }
                }
                None => None,
            };

            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(err) if is_connection_error(&err) => {
                    debug!(error = %err, "accept aborted by peer");
                    continue;
                }
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };
            if let Err(err) = stream.set_nodelay(true) {
                debug!(error = %err, "failed to set TCP_NODELAY");
            }

            let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
            let ctx = Arc::clone(&self.ctx);
            let shutdown = self.shutdown.child_token();
            sessions.spawn(async move {
                let _permit = permit;
                run_logged(ctx, conn_id, Some(peer), stream, shutdown).await;
            });

            while let Some(joined) = sessions.try_join_next() {
                if let Err(err) = joined {
                    warn!(error = %err, "session task failed");
                }
            }
        }

        info!(active = sessions.len(), "agent stopping");
        while let Some(joined) = sessions.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "session task failed");
            }
        }
        Ok(())
    }

    /// Run one session over an arbitrary byte stream (in-memory pipes, TLS
    /// wrappers terminated elsewhere).
    pub async fn serve_stream<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        serve_connection(
            Arc::clone(&self.ctx),
            conn_id,
            stream,
            self.shutdown.child_token(),
        )
        .await
    }
}

async fn run_logged<S>(
    ctx: Arc<SessionContext>,
    conn_id: u64,
    peer: Option<SocketAddr>,
    stream: S,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    debug!(conn_id, peer = ?peer, "connection accepted");
    match serve_connection(ctx, conn_id, stream, shutdown).await {
        Ok(()) => debug!(conn_id, "connection finished"),
        Err(err) => debug!(conn_id, error = %err, "connection ended with error"),
    }
}

fn is_connection_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}
