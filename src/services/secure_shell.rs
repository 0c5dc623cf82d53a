//! SSH credential handoff: the one RPC that lets an authenticated client
//! bootstrap into the embedded SSH endpoint.

use std::sync::Arc;

use tonic::{Request, Response, Status};

use agent_proto::secure_shell_server::SecureShell;
use agent_proto::UserKeyResponse;

use crate::config::SSH_PORT;
use crate::error::Error;
use crate::server::ServerState;

pub struct SecureShellService {
    state: Arc<ServerState>,
}

impl SecureShellService {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }
}

#[tonic::async_trait]
impl SecureShell for SecureShellService {
    async fn get_user_key(&self, _request: Request<()>) -> Result<Response<UserKeyResponse>, Status> {
        let key = self
            .state
            .ssh_user_key
            .as_ref()
            .ok_or_else(|| Error::NotFound("ssh endpoint disabled".to_string()))?;
        let private_key_pem = key.private_key_pem()?;
        Ok(Response::new(UserKeyResponse {
            private_key_pem,
            port: SSH_PORT,
        }))
    }
}
