//! The RPC server core: shared state, service registration, the interceptor
//! chain, and graceful shutdown.

pub mod interceptors;
pub mod io;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use uuid::Uuid;

use crate::config::{AgentConfig, SHUTDOWN_GRACE};
use crate::error::Result;
use crate::freeze::FreezeState;
use crate::ssh::SshUserKey;
use crate::telemetry::TelemetryHandle;
use crate::transport::{self, TransportListener};
use agent_proto::agent_server::AgentServer;
use agent_proto::filesystem_server::FilesystemServer;
use agent_proto::network_server::NetworkServer;
use agent_proto::secure_shell_server::SecureShellServer;

/// Feature flags the process was started with, echoed by `GetAgentInfo`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AgentFeatures {
    pub legacy_mode: bool,
    pub serial_port: bool,
    pub without_ssh: bool,
    pub without_tcp: bool,
}

/// Central state shared by every service and by the admission layer.
/// Built once at startup; services hold an `Arc` back-reference, never the
/// reverse, so there is no construction cycle.
pub struct ServerState {
    pub session_id: Uuid,
    pub freeze: FreezeState,
    pub telemetry: TelemetryHandle,
    pub features: AgentFeatures,
    pub ssh_user_key: Option<Arc<SshUserKey>>,
    pub shutdown: CancellationToken,
}

impl ServerState {
    pub fn is_locked(&self) -> bool {
        self.freeze.is_locked()
    }
}

/// Runs the agent's `serve` command: builds the transport matrix, the
/// shared state, registers services behind the admission layer, and drives
/// every listener until the shutdown token fires.
pub async fn serve(config: AgentConfig, ssh_user_key: Option<Arc<SshUserKey>>) -> Result<()> {
    let shutdown = CancellationToken::new();

    let matrix = transport::build(&config, shutdown.clone()).await?;

    let features = AgentFeatures {
        legacy_mode: config.legacy_mode,
        serial_port: matches!(matrix.primary, TransportListener::Serial(_)),
        without_ssh: config.without_ssh,
        without_tcp: config.without_tcp,
    };

    let state = Arc::new(ServerState {
        session_id: Uuid::new_v4(),
        freeze: FreezeState::new(),
        telemetry: crate::telemetry::spawn_poller(shutdown.clone()),
        features,
        ssh_user_key,
        shutdown: shutdown.clone(),
    });

    let tls_server_config = if matches!(matrix.primary, TransportListener::Vsock(_)) || !config.without_tcp {
        Some(Arc::new(crate::tls::server_config(&config.cert_dir)?))
    } else {
        None
    };

    let router = Server::builder()
        .layer(interceptors::AdmissionLayer {
            state: Arc::clone(&state),
        })
        .add_service(AgentServer::new(crate::services::agent::AgentService::new(
            Arc::clone(&state),
        )))
        .add_service(FilesystemServer::new(
            crate::services::filesystem::FilesystemService::new(Arc::clone(&state)),
        ))
        .add_service(NetworkServer::new(crate::services::network::NetworkService::new(
            Arc::clone(&state),
        )))
        .add_service(SecureShellServer::new(
            crate::services::secure_shell::SecureShellService::new(Arc::clone(&state)),
        ));

    let mut secondary = matrix.secondary;
    let primary_shutdown = shutdown.clone();
    let primary_router = router.clone();
    let primary_tls = tls_server_config.clone();
    let primary_listener = matrix.primary;

    let primary_task = tokio::spawn(serve_listener(
        primary_listener,
        primary_tls,
        primary_router,
        primary_shutdown,
    ));

    let secondary_shutdown = shutdown.clone();
    let secondary_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(listener) = secondary.recv() => {
                    tokio::spawn(serve_listener(
                        listener,
                        tls_server_config.clone(),
                        router.clone(),
                        secondary_shutdown.clone(),
                    ));
                }
                _ = secondary_shutdown.cancelled() => break,
                else => break,
            }
        }
    });

    if !config.without_ssh {
        if let Some(key) = &state.ssh_user_key {
            tokio::spawn(crate::ssh::run(Arc::clone(key), shutdown.clone()));
        }
    }

    tokio::signal::ctrl_c().await.ok();
    shutdown.cancel();
    tokio::time::sleep(SHUTDOWN_GRACE).await;

    primary_task.abort();
    secondary_task.abort();

    Ok(())
}

async fn serve_listener<L>(
    mut listener: TransportListener,
    tls_config: Option<Arc<rustls::ServerConfig>>,
    router: tonic::transport::server::Router<L>,
    shutdown: CancellationToken,
) where
    L: tower::Layer<tonic::service::Routes> + Clone + Send + 'static,
    L::Service: tower::Service<
            http::Request<tonic::body::BoxBody>,
            Response = http::Response<tonic::body::BoxBody>,
        > + Clone
        + Send
        + 'static,
    <L::Service as tower::Service<http::Request<tonic::body::BoxBody>>>::Future: Send + 'static,
    <L::Service as tower::Service<http::Request<tonic::body::BoxBody>>>::Error:
        Into<Box<dyn std::error::Error + Send + Sync>> + Send,
{
    let label = listener.label();
    tracing::info!(%label, "listening");

    let acceptor = tls_config.map(tokio_rustls::TlsAcceptor::from);

    let incoming = async_stream::stream! {
        loop {
            tokio::select! {
                conn = listener.accept() => {
                    match conn {
                        Ok(conn) => {
                            if conn.wants_tls() {
                                if let Some(acceptor) = &acceptor {
                                    match acceptor.accept(conn).await {
                                        Ok(tls) => yield Ok::<_, std::io::Error>(io::ServerIo::Tls(Box::new(tls))),
                                        Err(e) => {
                                            tracing::warn!(%label, error = %e, "tls handshake failed");
                                            continue;
                                        }
                                    }
                                } else {
                                    tracing::warn!(%label, "connection requires tls but none configured");
                                    continue;
                                }
                            } else {
                                yield Ok(io::ServerIo::Plain(conn));
                            }
                        }
                        Err(e) => {
                            tracing::warn!(%label, error = %e, "accept failed");
                            continue;
                        }
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
    };

    if let Err(e) = router
        .serve_with_incoming_shutdown(incoming, shutdown.cancelled())
        .await
    {
        tracing::error!(%label, error = %e, "listener exited with error");
    }
}
