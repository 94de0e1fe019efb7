//! Error types for the exchange layer.

use std::time::Duration;

use dubbo_proto::{ProtocolError, ResponseStatus};
use thiserror::Error;

/// Errors raised while exchanging packages with a peer.
#[derive(Error, Debug)]
pub enum RemotingError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connect to {addr} timed out after {after:?}")]
    ConnectTimeout { addr: String, after: Duration },

    /// The connection is gone; in-flight calls on it are failed with this.
    #[error("connection to {0} closed")]
    Closed(String),

    #[error("request {id} timed out after {after:?}")]
    Timeout { id: u64, after: Duration },

    /// The peer answered with a non-OK status.
    #[error("peer returned {status}: {message}")]
    Status {
        status: ResponseStatus,
        message: String,
    },

    /// The response frame arrived but its body could not be read.
    #[error("failed to decode response {id}: {message}")]
    Decode { id: u64, message: String },

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RemotingError {
    /// Short machine-readable tag for logging.
    #[must_use]
    pub const fn error_type(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::ConnectTimeout { .. } => "connect_timeout",
            Self::Closed(_) => "closed",
            Self::Timeout { .. } => "timeout",
            Self::Status { .. } => "status",
            Self::Decode { .. } => "decode",
            Self::Protocol(_) => "protocol",
            Self::Io(_) => "io",
        }
    }

    /// Whether the failure says something about the transport rather than
    /// the call, so the connection should be considered broken.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. }
                | Self::ConnectTimeout { .. }
                | Self::Closed(_)
                | Self::Protocol(_)
                | Self::Io(_)
        )
    }
}

/// Failure reported by a [`RequestHandler`](crate::server::RequestHandler).
///
/// Turned into an error-status response carrying only the message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{status}: {message}")]
pub struct DispatchError {
    pub status: ResponseStatus,
    pub message: String,
}

impl DispatchError {
    #[must_use]
    pub fn service_not_found(service_key: &str) -> Self {
        Self {
            status: ResponseStatus::ServiceNotFound,
            message: format!("service not found: {service_key}"),
        }
    }

    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::BadRequest,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn service_error(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::ServiceError,
            message: message.into(),
        }
    }
}
