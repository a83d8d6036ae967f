//! HAProxy Stream Processing Offload Protocol (SPOP) agent.
//!
//! # Crate Structure
//!
//! - [`frame`]: wire format (varints, typed values, KV lists, frames, codec)
//! - [`agent`]: agent runtime (handshake, sessions, worker dispatch, pools,
//!   engine registry) and a proxy-side client
//!
//! The most used types are re-exported at the crate root.

/// Re-export frame types.
pub mod frame {
    pub use spop_frame::*;
}

/// Re-export agent types.
pub mod agent {
    pub use spop_agent::*;
}

pub use spop_agent::{
    Action, Actions, Agent, AgentConfig, AgentError, Client, ClientConfig, Handler, HandlerError,
    Message, Messages, Scope, StatusCode, TypedData,
};
