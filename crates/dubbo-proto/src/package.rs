//! The unit of exchange on a Dubbo connection.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::error::ResponseStatus;
use crate::header::{Header, PackageKind};
use crate::hessian::Value;

/// Attachment carrying the caller's protocol version.
pub const DUBBO_VERSION_KEY: &str = "dubbo";
pub const PATH_KEY: &str = "path";
pub const VERSION_KEY: &str = "version";
pub const GROUP_KEY: &str = "group";
pub const INTERFACE_KEY: &str = "interface";
pub const TIMEOUT_KEY: &str = "timeout";

/// Class written for exceptions raised without one.
pub const DEFAULT_EXCEPTION_CLASS: &str = "java.lang.RuntimeException";

const DETAIL_MESSAGE: &str = "detailMessage";

/// Target of a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Service {
    pub path: String,
    pub interface: String,
    pub group: String,
    pub version: String,
    pub method: String,
    /// Zero means no timeout is advertised to the provider.
    pub timeout: Duration,
}

impl Service {
    /// `group/path:version`, the key exporters are registered under.
    #[must_use]
    pub fn service_key(&self) -> String {
        service_key(&self.group, &self.path, &self.version)
    }
}

/// Builds `group/path:version`, omitting empty parts.
#[must_use]
pub fn service_key(group: &str, path: &str, version: &str) -> String {
    let mut key = String::with_capacity(group.len() + path.len() + version.len() + 2);
    if !group.is_empty() {
        key.push_str(group);
        key.push('/');
    }
    key.push_str(path);
    if !version.is_empty() && version != "0.0.0" {
        key.push(':');
        key.push_str(version);
    }
    key
}

/// Exception raised by the remote method.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteException {
    pub class: String,
    pub message: String,
}

impl RemoteException {
    #[must_use]
    pub fn new(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            message: message.into(),
        }
    }

    /// Exception carrying only a message, as sent with error statuses.
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            class: String::new(),
            message: message.into(),
        }
    }

    /// Reads an exception out of a decoded Java throwable.
    #[must_use]
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object { class, fields } => {
                let message = fields
                    .into_iter()
                    .find(|(name, _)| name == DETAIL_MESSAGE)
                    .and_then(|(_, v)| match v {
                        Value::String(s) => Some(s),
                        _ => None,
                    })
                    .unwrap_or_default();
                Self { class, message }
            }
            Value::String(message) => Self::message(message),
            other => Self::message(format!("unexpected exception payload: {}", other.kind())),
        }
    }

    /// Shapes the exception as a Java throwable.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let class: &str = if self.class.is_empty() {
            DEFAULT_EXCEPTION_CLASS
        } else {
            &self.class
        };
        Value::object(
            class,
            vec![(DETAIL_MESSAGE.to_owned(), Value::from(self.message.as_str()))],
        )
    }
}

impl fmt::Display for RemoteException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.class.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.class, self.message)
        }
    }
}

impl std::error::Error for RemoteException {}

/// Outbound request arguments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestPayload {
    pub args: Vec<Value>,
    /// Descriptor to send instead of the one derived from `args`.
    pub arg_types: Option<String>,
    pub attachments: HashMap<String, String>,
}

/// Request as reconstructed on the provider side.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceCall {
    pub dubbo_version: String,
    pub arg_types: String,
    pub args: Vec<Value>,
    pub attachments: HashMap<String, String>,
}

/// Response payload.
///
/// At most one of `value` and `exception` is set; neither means the method
/// returned null.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponsePayload {
    pub value: Option<Value>,
    pub exception: Option<RemoteException>,
    pub attachments: HashMap<String, String>,
}

impl ResponsePayload {
    #[must_use]
    pub fn value(value: Value) -> Self {
        Self {
            value: Some(value),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn exception(exception: RemoteException) -> Self {
        Self {
            exception: Some(exception),
            ..Self::default()
        }
    }
}

/// Decoded or to-be-encoded body.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Body {
    /// Heartbeats, and packages whose body has not been read.
    #[default]
    Empty,
    Request(RequestPayload),
    Call(ServiceCall),
    Response(ResponsePayload),
}

/// One frame: header, addressing, and body.
#[derive(Debug, Clone, PartialEq)]
pub struct Package {
    pub header: Header,
    pub service: Service,
    pub body: Body,
}

impl Package {
    /// Two-way request. The id is assigned when the package is sent.
    #[must_use]
    pub fn request(service: Service, payload: RequestPayload) -> Self {
        Self {
            header: Header::request(0),
            service,
            body: Body::Request(payload),
        }
    }

    #[must_use]
    pub fn response(id: u64, payload: ResponsePayload) -> Self {
        Self {
            header: Header::response(id),
            service: Service::default(),
            body: Body::Response(payload),
        }
    }

    /// Response carrying a non-OK status and only an error message.
    #[must_use]
    pub fn error_response(id: u64, status: ResponseStatus, message: impl Into<String>) -> Self {
        let mut header = Header::response(id);
        header.status = status.as_u8();
        Self {
            header,
            service: Service::default(),
            body: Body::Response(ResponsePayload::exception(RemoteException::message(message))),
        }
    }

    #[must_use]
    pub fn heartbeat_request(id: u64) -> Self {
        Self {
            header: Header::heartbeat_request(id),
            service: Service::default(),
            body: Body::Empty,
        }
    }

    #[must_use]
    pub fn heartbeat_response(id: u64) -> Self {
        Self {
            header: Header::heartbeat_response(id),
            service: Service::default(),
            body: Body::Empty,
        }
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.header.id
    }

    #[must_use]
    pub const fn kind(&self) -> PackageKind {
        self.header.kind
    }

    #[must_use]
    pub fn is_heartbeat(&self) -> bool {
        self.header.kind.is_heartbeat()
    }

    /// Takes the response payload out, leaving the body empty.
    pub fn take_response(&mut self) -> Option<ResponsePayload> {
        match std::mem::take(&mut self.body) {
            Body::Response(payload) => Some(payload),
            other => {
                self.body = other;
                None
            }
        }
    }
}
