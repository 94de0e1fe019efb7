//! Outcome of an invocation.

use std::collections::HashMap;

use dubbo_proto::{ResponsePayload, Value};

use crate::error::RpcError;

/// A value or an error, plus the response attachments.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcResult {
    value: Result<Value, RpcError>,
    attachments: HashMap<String, String>,
}

impl RpcResult {
    #[must_use]
    pub fn ok(value: Value) -> Self {
        Self {
            value: Ok(value),
            attachments: HashMap::new(),
        }
    }

    #[must_use]
    pub fn err(error: RpcError) -> Self {
        Self {
            value: Err(error),
            attachments: HashMap::new(),
        }
    }

    /// Converts a decoded response. A remote exception becomes
    /// [`RpcError::Remote`]; a missing value is `Null`.
    #[must_use]
    pub fn from_payload(payload: ResponsePayload) -> Self {
        let value = match payload.exception {
            Some(exception) => Err(RpcError::remote(exception)),
            None => Ok(payload.value.unwrap_or(Value::Null)),
        };
        Self {
            value,
            attachments: payload.attachments,
        }
    }

    #[must_use]
    pub fn with_attachments(mut self, attachments: HashMap<String, String>) -> Self {
        self.attachments = attachments;
        self
    }

    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.value.is_ok()
    }

    #[must_use]
    pub const fn is_err(&self) -> bool {
        self.value.is_err()
    }

    #[must_use]
    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref().ok()
    }

    #[must_use]
    pub fn error(&self) -> Option<&RpcError> {
        self.value.as_ref().err()
    }

    #[must_use]
    pub const fn attachments(&self) -> &HashMap<String, String> {
        &self.attachments
    }

    #[must_use]
    pub fn attachment(&self, key: &str) -> Option<&str> {
        self.attachments.get(key).map(String::as_str)
    }

    pub fn set_attachment(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attachments.insert(key.into(), value.into());
    }

    /// Replaces a successful value, keeping the attachments.
    #[must_use]
    pub fn map_value(self, f: impl FnOnce(Value) -> Value) -> Self {
        Self {
            value: self.value.map(f),
            attachments: self.attachments,
        }
    }

    /// Discards the attachments.
    ///
    /// # Errors
    ///
    /// Returns the invocation error, if any.
    pub fn into_result(self) -> Result<Value, RpcError> {
        self.value
    }
}

impl From<Result<Value, RpcError>> for RpcResult {
    fn from(value: Result<Value, RpcError>) -> Self {
        Self {
            value,
            attachments: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use dubbo_proto::RemoteException;

    use super::*;

    #[test]
    fn exception_payload_becomes_remote_error() {
        let mut payload =
            ResponsePayload::exception(RemoteException::new("com.example.Oops", "bad input"));
        payload.attachments.insert("trace".into(), "abc".into());

        let result = RpcResult::from_payload(payload);
        assert_eq!(
            result.error(),
            Some(&RpcError::Remote {
                class: "com.example.Oops".into(),
                message: "bad input".into()
            })
        );
        assert_eq!(result.attachment("trace"), Some("abc"));
    }

    #[test]
    fn empty_payload_is_null() {
        let result = RpcResult::from_payload(ResponsePayload::default());
        assert_eq!(result.into_result(), Ok(Value::Null));
    }
}
