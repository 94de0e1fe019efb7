//! Error types for the wire protocol.

use thiserror::Error;

use crate::hessian::HessianError;

/// Protocol errors.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The first two bytes of a frame were not the Dubbo magic.
    #[error("invalid magic: 0x{0:04x}")]
    InvalidMagic(u16),

    /// Frame body exceeds the configured limit.
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// Serialisation id in the header has no registered serializer.
    #[error("unknown serialization id: {0}")]
    UnknownSerialization(u8),

    /// Package contents do not match what the header promises.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// The header parsed but the body could not be deserialised.
    ///
    /// `frame_len` covers the header and body so the reader can skip the
    /// frame and keep the connection alive.
    #[error("failed to decode body of package {id}: {source}")]
    Body {
        id: u64,
        frame_len: usize,
        #[source]
        source: HessianError,
    },

    /// Hessian2 encoding or decoding error.
    #[error("hessian: {0}")]
    Hessian(#[from] HessianError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Short machine-readable tag for logging.
    #[must_use]
    pub const fn error_type(&self) -> &'static str {
        match self {
            Self::InvalidMagic(_) => "invalid_magic",
            Self::MessageTooLarge { .. } => "message_too_large",
            Self::UnknownSerialization(_) => "unknown_serialization",
            Self::InvalidPayload(_) => "invalid_payload",
            Self::Body { .. } => "body_decode",
            Self::Hessian(_) => "hessian",
            Self::Io(_) => "io",
        }
    }

    /// Whether the connection can keep reading after this error.
    ///
    /// Body failures leave the stream aligned on the next frame; everything
    /// else means the byte stream can no longer be trusted.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Body { .. })
    }
}

/// Response status byte carried in the header of response frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResponseStatus {
    Ok = 20,
    ClientTimeout = 30,
    ServerTimeout = 31,
    BadRequest = 40,
    BadResponse = 50,
    ServiceNotFound = 60,
    ServiceError = 70,
    ServerError = 80,
    ClientError = 90,
    ServerThreadpoolExhausted = 100,
}

impl ResponseStatus {
    /// Returns the numeric value of this status.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Creates a status from its wire value.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            20 => Some(Self::Ok),
            30 => Some(Self::ClientTimeout),
            31 => Some(Self::ServerTimeout),
            40 => Some(Self::BadRequest),
            50 => Some(Self::BadResponse),
            60 => Some(Self::ServiceNotFound),
            70 => Some(Self::ServiceError),
            80 => Some(Self::ServerError),
            90 => Some(Self::ClientError),
            100 => Some(Self::ServerThreadpoolExhausted),
            _ => None,
        }
    }
}

impl std::fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::ClientTimeout => write!(f, "client_timeout"),
            Self::ServerTimeout => write!(f, "server_timeout"),
            Self::BadRequest => write!(f, "bad_request"),
            Self::BadResponse => write!(f, "bad_response"),
            Self::ServiceNotFound => write!(f, "service_not_found"),
            Self::ServiceError => write!(f, "service_error"),
            Self::ServerError => write!(f, "server_error"),
            Self::ClientError => write!(f, "client_error"),
            Self::ServerThreadpoolExhausted => write!(f, "server_threadpool_exhausted"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_status_roundtrip() {
        let statuses = [
            ResponseStatus::Ok,
            ResponseStatus::ClientTimeout,
            ResponseStatus::ServerTimeout,
            ResponseStatus::BadRequest,
            ResponseStatus::BadResponse,
            ResponseStatus::ServiceNotFound,
            ResponseStatus::ServiceError,
            ResponseStatus::ServerError,
            ResponseStatus::ClientError,
            ResponseStatus::ServerThreadpoolExhausted,
        ];

        for status in statuses {
            assert_eq!(ResponseStatus::from_u8(status.as_u8()), Some(status));
        }
        assert_eq!(ResponseStatus::from_u8(0), None);
    }

    #[test]
    fn only_body_errors_are_recoverable() {
        let body = ProtocolError::Body {
            id: 2,
            frame_len: 20,
            source: HessianError::UnexpectedEof,
        };
        assert!(body.is_recoverable());
        assert!(!ProtocolError::InvalidMagic(0x1234).is_recoverable());
        assert_eq!(ProtocolError::InvalidMagic(0).error_type(), "invalid_magic");
    }
}
