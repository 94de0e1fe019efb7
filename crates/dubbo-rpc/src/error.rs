//! Error types for invocations.

use dubbo_proto::{RemoteException, DEFAULT_EXCEPTION_CLASS};
use dubbo_remoting::RemotingError;
use thiserror::Error;

/// Exception class that carries [`RpcError::Rejected`] from a provider.
pub const REJECTED_EXCEPTION_CLASS: &str = "java.util.concurrent.RejectedExecutionException";

/// Exception class that carries [`RpcError::AuthFailed`] from a provider.
pub const AUTH_EXCEPTION_CLASS: &str = "org.apache.dubbo.auth.exception.RpcAuthenticationException";

/// Errors surfaced to callers of an invoker.
///
/// Payloads are owned strings so the error can be cloned into every branch
/// of a forked call and kept as the "last error" of a failover loop.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// Connection-level failure; the provider may be unreachable.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("invocation timed out: {0}")]
    Timeout(String),

    /// The remote method threw.
    #[error("remote exception {class}: {message}")]
    Remote { class: String, message: String },

    /// The provider answered with an error status.
    #[error("provider error ({status}): {message}")]
    Status { status: String, message: String },

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("no provider available for {0}")]
    NoProvider(String),

    #[error("invoker for {0} is unavailable")]
    Unavailable(String),

    #[error("failed after {attempts} attempts, last error: {last}")]
    ClusterExhausted { attempts: usize, last: Box<RpcError> },

    #[error("authentication failed")]
    AuthFailed,

    #[error("rejected execution: {0}")]
    Rejected(String),

    #[error("unknown filter: {0}")]
    UnknownFilter(String),

    #[error("unknown {kind}: {name}")]
    UnknownExtension { kind: &'static str, name: String },

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("invalid route rule: {0}")]
    InvalidRoute(String),

    #[error("{0}")]
    Internal(String),
}

impl RpcError {
    /// Short machine-readable tag for logging.
    #[must_use]
    pub const fn error_type(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Timeout(_) => "timeout",
            Self::Remote { .. } => "remote",
            Self::Status { .. } => "status",
            Self::Decode(_) => "decode",
            Self::NoProvider(_) => "no_provider",
            Self::Unavailable(_) => "unavailable",
            Self::ClusterExhausted { .. } => "cluster_exhausted",
            Self::AuthFailed => "auth_failed",
            Self::Rejected(_) => "rejected",
            Self::UnknownFilter(_) => "unknown_filter",
            Self::UnknownExtension { .. } => "unknown_extension",
            Self::InvalidUrl(_) => "invalid_url",
            Self::InvalidRoute(_) => "invalid_route",
            Self::Internal(_) => "internal",
        }
    }

    /// Builds the error for an exception received from a provider.
    ///
    /// Rejections and authentication failures come back as their own
    /// variants; anything else is an application error.
    #[must_use]
    pub fn remote(exception: RemoteException) -> Self {
        match exception.class.as_str() {
            REJECTED_EXCEPTION_CLASS => Self::Rejected(exception.message),
            AUTH_EXCEPTION_CLASS => Self::AuthFailed,
            _ => Self::Remote {
                class: exception.class,
                message: exception.message,
            },
        }
    }

    /// The exception a provider answers with for this error.
    #[must_use]
    pub fn to_exception(&self) -> RemoteException {
        match self {
            Self::Remote { class, message } => {
                RemoteException::new(class.clone(), message.clone())
            }
            Self::Rejected(message) => {
                RemoteException::new(REJECTED_EXCEPTION_CLASS, message.clone())
            }
            Self::AuthFailed => RemoteException::new(AUTH_EXCEPTION_CLASS, self.to_string()),
            other => RemoteException::new(DEFAULT_EXCEPTION_CLASS, other.to_string()),
        }
    }
}

impl From<RemotingError> for RpcError {
    fn from(err: RemotingError) -> Self {
        match err {
            RemotingError::Timeout { .. } => Self::Timeout(err.to_string()),
            RemotingError::Status { status, message } => Self::Status {
                status: status.to_string(),
                message,
            },
            RemotingError::Decode { .. } => Self::Decode(err.to_string()),
            other => Self::Transport(other.to_string()),
        }
    }
}
