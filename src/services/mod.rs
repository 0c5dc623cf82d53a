//! gRPC service implementations. Each service holds an `Arc<ServerState>`
//! handed to it during registration: the shared state is built first, then
//! each service is constructed against it, avoiding a cyclic dependency
//! between the server and its services.

pub mod agent;
pub mod filesystem;
pub mod network;
pub mod secure_shell;
