//! In-guest RPC agent for virtual machines.
//!
//! Exposes filesystem, network, and system management over a mutually
//! authenticated gRPC surface reachable via VM sockets, virtio serial, or
//! IPv6 link-local TCP, plus an embedded SSH endpoint for interactive
//! sessions.

pub mod config;
pub mod error;
pub mod freeze;
pub mod netinit;
pub mod server;
pub mod services;
pub mod ssh;
pub mod telemetry;
pub mod tls;
pub mod transport;

pub use error::{Error, Result};

pub mod prelude {
    pub use crate::config::AgentConfig;
    pub use crate::error::{Error, Result};
    pub use crate::server::ServerState;
}
