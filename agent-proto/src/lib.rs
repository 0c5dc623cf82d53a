//! Generated gRPC types and service traits shared by `guest-agent` and `agentctl`.

pub mod agent {
    tonic::include_proto!("agent.v1");
}

pub use agent::*;
