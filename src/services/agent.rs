//! System/agent service: version, session id, lock state, telemetry
//! passthrough, and graceful shutdown.

use std::pin::Pin;
use std::sync::Arc;

use tokio_stream::Stream;
use tonic::{Request, Response, Status};

use agent_proto::agent_server::Agent;
use agent_proto::{AgentInfo, GuestInfo, TelemetrySample};

use crate::config::SHUTDOWN_GRACE;
use crate::server::ServerState;

pub struct AgentService {
    state: Arc<ServerState>,
}

impl AgentService {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }
}

#[tonic::async_trait]
impl Agent for AgentService {
    async fn get_agent_info(
        &self,
        _request: Request<()>,
    ) -> Result<Response<AgentInfo>, Status> {
        Ok(Response::new(AgentInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
            legacy_mode: self.state.features.legacy_mode,
            serial_port: self.state.features.serial_port,
            without_ssh: self.state.features.without_ssh,
            without_tcp: self.state.features.without_tcp,
            session_id: self.state.session_id.to_string(),
        }))
    }

    async fn get_guest_info(
        &self,
        _request: Request<()>,
    ) -> Result<Response<GuestInfo>, Status> {
        match self.state.telemetry.latest() {
            Some(sample) => Ok(Response::new(GuestInfo {
                not_ready: false,
                sample: Some(sample),
            })),
            None => Err(crate::error::Error::NotReady.into()),
        }
    }

    async fn shutdown_agent(&self, _request: Request<()>) -> Result<Response<()>, Status> {
        let shutdown = self.state.shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(SHUTDOWN_GRACE).await;
            shutdown.cancel();
        });
        Ok(Response::new(()))
    }

    type SubscribeTelemetryStream =
        Pin<Box<dyn Stream<Item = Result<TelemetrySample, Status>> + Send + 'static>>;

    async fn subscribe_telemetry(
        &self,
        _request: Request<()>,
    ) -> Result<Response<Self::SubscribeTelemetryStream>, Status> {
        let mut rx = self.state.telemetry.subscribe();
        let stream = async_stream::stream! {
            loop {
                if rx.changed().await.is_err() {
                    break;
                }
                if let Some(sample) = rx.borrow().clone() {
                    yield Ok(sample);
                }
            }
        };
        Ok(Response::new(Box::pin(stream)))
    }
}
