//! The ordered interceptor chain: request-id tagging, structured logging,
//! and the freeze-gate admission check. Implemented as a single `tower`
//! layer wrapping the whole service router, since the freeze gate needs the
//! gRPC method path, which is only visible at the HTTP/2 request level.
//!
//! The fourth interceptor, error mapping, is realized at each handler's
//! `Result<_, Error> -> Result<_, Status>` boundary via `From<Error>`
//! (see `src/error.rs`) rather than here, since unary and streaming handlers
//! need to produce that conversion at different points in the call.

use std::sync::Arc;
use std::task::{Context, Poll};

use tonic::body::BoxBody;
use tower::{Layer, Service};
use tracing::Instrument;
use uuid::Uuid;

use crate::server::ServerState;

/// gRPC method paths that are client- or server-streaming. The freeze gate
/// consults the streaming allow-list for these, the unary allow-list for
/// everything else.
const STREAMING_METHODS: &[&str] = &[
    "/agent.v1.Filesystem/UploadFile",
    "/agent.v1.Filesystem/DownloadFile",
    "/agent.v1.Agent/SubscribeTelemetry",
];

#[derive(Clone)]
pub struct AdmissionLayer {
    pub state: Arc<ServerState>,
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = AdmissionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AdmissionService {
            inner,
            state: Arc::clone(&self.state),
        }
    }
}

#[derive(Clone)]
pub struct AdmissionService<S> {
    inner: S,
    state: Arc<ServerState>,
}

impl<S> Service<http::Request<BoxBody>> for AdmissionService<S>
where
    S: Service<http::Request<BoxBody>, Response = http::Response<BoxBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<Box<dyn std::error::Error + Send + Sync>> + 'static,
{
    type Response = http::Response<BoxBody>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: http::Request<BoxBody>) -> Self::Future {
        let method = req.uri().path().to_string();
        let request_id = Uuid::new_v4();
        req.headers_mut().insert(
            "x-request-id",
            http::HeaderValue::from_str(&request_id.to_string()).unwrap(),
        );

        let span = tracing::info_span!("rpc", %method, %request_id);
        {
            let _enter = span.enter();
            tracing::info!("handling call");
        }

        let is_stream = STREAMING_METHODS.contains(&method.as_str());
        if let Err(err) = self.state.freeze.admit(&method, is_stream) {
            let _enter = span.enter();
            tracing::warn!(%method, "admission denied while frozen");
            drop(_enter);
            let status: tonic::Status = err.into();
            return Box::pin(async move { Ok(status.to_http()) }.instrument(span));
        }

        let mut inner = self.inner.clone();
        Box::pin(async move { inner.call(req).await }.instrument(span))
    }
}
