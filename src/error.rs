//! Error taxonomy for the guest agent core and its RPC boundary.

use thiserror::Error;

/// Result type alias using the agent's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the agent core. Variants map to `tonic::Status` codes
/// at the RPC boundary via [`Error::grpc_code`]; see `src/server/interceptors.rs`.
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or malformed certificates, bad endpoint string, bad CLI config.
    #[error("config error: {0}")]
    Config(String),

    /// Failed to bind or accept on a transport listener.
    #[error("transport error: {0}")]
    Transport(String),

    /// The freeze gate rejected a call while the guest filesystems are locked.
    #[error("all filesystems are frozen: {0}")]
    AdmissionDenied(String),

    /// A requested resource does not exist, or telemetry has no sample yet.
    #[error("not found: {0}")]
    NotFound(String),

    /// Telemetry has not produced its first sample.
    #[error("not ready yet")]
    NotReady,

    /// Malformed or out-of-range request argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Request was canceled by the caller.
    #[error("canceled")]
    Canceled,

    /// Request exceeded its deadline.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// rtnetlink request failed.
    #[error("rtnetlink: {0}")]
    Netlink(String),

    /// SSH server/session errors.
    #[error("ssh error: {0}")]
    Ssh(String),

    /// Any other handler failure.
    #[error("internal error: {0}")]
    Internal(String),

    /// I/O errors, propagated with context by call sites.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call errors (Linux only).
    #[error("system error: {0}")]
    System(#[from] nix::Error),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Maps this error to a gRPC status code per the error-mapping interceptor's
    /// policy: not-found-like errors map to `NotFound`, everything else not
    /// explicitly listed maps to `Internal`.
    pub fn grpc_code(&self) -> tonic::Code {
        match self {
            Error::NotFound(_) | Error::NotReady => tonic::Code::NotFound,
            Error::AdmissionDenied(_) => tonic::Code::FailedPrecondition,
            Error::InvalidArgument(_) => tonic::Code::InvalidArgument,
            Error::Canceled => tonic::Code::Cancelled,
            Error::DeadlineExceeded => tonic::Code::DeadlineExceeded,
            Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound => tonic::Code::NotFound,
            Error::Config(_)
            | Error::Transport(_)
            | Error::Netlink(_)
            | Error::Ssh(_)
            | Error::Internal(_)
            | Error::Io(_)
            | Error::System(_) => tonic::Code::Internal,
        }
    }
}

impl From<Error> for tonic::Status {
    fn from(err: Error) -> Self {
        let code = err.grpc_code();
        tonic::Status::new(code, err.to_string())
    }
}
