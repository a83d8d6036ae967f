//! SPOP agent runtime.
//!
//! Accepts connections from HAProxy, negotiates HELLO, reassembles NOTIFY
//! frames and answers each one with an ACK built by a user [`Handler`].
//! Frames of one stream are handled in order on a per-stream worker;
//! different streams run concurrently and their ACKs may go out in any
//! order.

pub mod config;
pub mod connector;
pub mod error;
pub mod handler;
pub mod handshake;
pub mod listener;
pub mod pool;
pub mod registry;
pub mod request;
pub mod session;

pub use config::AgentConfig;
pub use connector::{connect, Client, ClientConfig};
pub use error::{AgentError, Result};
pub use handler::{Handler, HandlerError, Messages};
pub use handshake::{handshake_server, negotiate, Negotiated, MIN_NEGOTIATED_FRAME_SIZE, SPOP_VERSION};
pub use listener::Agent;
pub use pool::{Pool, PoolStats, Pools, PoolsStats, Recycle};
pub use registry::{EngineKey, EngineRegistry};
pub use request::Request;
pub use session::{serve_connection, SessionContext, SessionState};
pub use spop_frame::{Action, Actions, Message, Scope, StatusCode, TypedData};
