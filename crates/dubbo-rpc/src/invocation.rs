//! A single logical call.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use dubbo_proto::hessian::args_type_descriptor;
use dubbo_proto::{ReturnType, Value};

use crate::result::RpcResult;

/// Receives the outcome of an asynchronous call.
pub type AsyncCallback = Arc<dyn Fn(RpcResult) + Send + Sync>;

/// How the caller wants the result delivered.
#[derive(Clone, Default)]
pub enum CallMode {
    /// Wait for the response.
    #[default]
    Sync,
    /// Return immediately; the callback receives the response.
    Async(AsyncCallback),
    /// Fire and forget. No response is expected.
    Oneway,
}

impl fmt::Debug for CallMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync => f.write_str("Sync"),
            Self::Async(_) => f.write_str("Async(..)"),
            Self::Oneway => f.write_str("Oneway"),
        }
    }
}

/// Method, arguments and attachments of one call.
///
/// Attachments travel on the wire. Attributes are local to this process and
/// let filters pass state from their pre-hook to their post-hook.
#[derive(Clone, Default)]
pub struct Invocation {
    method: String,
    args: Vec<Value>,
    arg_types: Option<String>,
    attachments: HashMap<String, String>,
    attributes: HashMap<String, Arc<dyn Any + Send + Sync>>,
    reply: ReturnType,
    mode: CallMode,
}

impl Invocation {
    #[must_use]
    pub fn new(method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            args,
            ..Self::default()
        }
    }

    /// Sets the type the response value is coerced to.
    #[must_use]
    pub fn with_reply(mut self, reply: ReturnType) -> Self {
        self.reply = reply;
        self
    }

    #[must_use]
    pub fn with_mode(mut self, mode: CallMode) -> Self {
        self.mode = mode;
        self
    }

    /// Overrides the descriptor derived from the argument values.
    #[must_use]
    pub fn with_arg_types(mut self, arg_types: impl Into<String>) -> Self {
        self.arg_types = Some(arg_types.into());
        self
    }

    #[must_use]
    pub fn with_attachment(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attachments.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    #[must_use]
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// JVM descriptor of the arguments.
    #[must_use]
    pub fn arg_types(&self) -> String {
        self.arg_types
            .clone()
            .unwrap_or_else(|| args_type_descriptor(&self.args))
    }

    /// The descriptor set with [`Invocation::with_arg_types`], if any.
    #[must_use]
    pub fn explicit_arg_types(&self) -> Option<&str> {
        self.arg_types.as_deref()
    }

    #[must_use]
    pub const fn reply(&self) -> &ReturnType {
        &self.reply
    }

    #[must_use]
    pub const fn mode(&self) -> &CallMode {
        &self.mode
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

    /// Points the invocation at another method with new arguments, keeping
    /// attachments, attributes and the call mode.
    pub fn redirect(
        &mut self,
        method: impl Into<String>,
        args: Vec<Value>,
        arg_types: Option<String>,
    ) {
        self.method = method.into();
        self.args = args;
        self.arg_types = arg_types;
    }

    pub fn set_attribute<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.attributes.insert(key.into(), Arc::new(value));
    }

    /// Returns the attribute under `key` if it holds a `T`.
    #[must_use]
    pub fn attribute<T: Any + Send + Sync>(&self, key: &str) -> Option<&T> {
        self.attributes.get(key).and_then(|v| v.downcast_ref::<T>())
    }

    pub fn remove_attribute(&mut self, key: &str) {
        self.attributes.remove(key);
    }

    /// Splits the invocation into its wire parts.
    #[must_use]
    pub fn into_parts(self) -> (String, Vec<Value>, HashMap<String, String>) {
        (self.method, self.args, self.attachments)
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("method", &self.method)
            .field("args", &self.args)
            .field("attachments", &self.attachments)
            .field("attributes", &self.attributes.keys().collect::<Vec<_>>())
            .field("reply", &self.reply)
            .field("mode", &self.mode)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    #[test]
    fn descriptor_follows_args_unless_overridden() {
        let inv = Invocation::new("greet", vec![Value::from("bob"), Value::Int(3)]);
        assert_eq!(inv.arg_types(), "Ljava/lang/String;I");

        let inv = inv.with_arg_types("Ljava/lang/Object;I");
        assert_eq!(inv.arg_types(), "Ljava/lang/Object;I");
    }

    #[test]
    fn attributes_are_typed() {
        let mut inv = Invocation::new("m", vec![]);
        let now = Instant::now();
        inv.set_attribute("start", now);

        assert_eq!(inv.attribute::<Instant>("start"), Some(&now));
        assert!(inv.attribute::<u64>("start").is_none());

        // Clones share the attribute value.
        let copy = inv.clone();
        inv.remove_attribute("start");
        assert!(inv.attribute::<Instant>("start").is_none());
        assert!(copy.attribute::<Instant>("start").is_some());
    }
}
