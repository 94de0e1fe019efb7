//! Invocations, invokers and filter chains on top of the Dubbo exchange.
//!
//! An [`Invocation`] is one logical call. An [`Invoker`] executes it and
//! yields an [`RpcResult`]. Invokers compose: the [`DubboProtocol`] hands
//! out a terminal invoker per provider wrapped in a [`FilterChain`] built
//! from the URL's filter list, and exports local handlers behind the
//! provider-side chain.
//!
//! Everything an invoker needs to know about its endpoint lives in its
//! [`Url`] parameters.

pub mod config;
pub mod error;
pub mod filter;
pub mod invocation;
pub mod invoker;
pub mod protocol;
pub mod result;
pub mod status;
pub mod url;

pub use config::{ApplicationConfig, ConfigError};
pub use error::{RpcError, AUTH_EXCEPTION_CLASS, REJECTED_EXCEPTION_CLASS};
pub use filter::{Filter, FilterChain, FilterRegistry, Next};
pub use invocation::{AsyncCallback, CallMode, Invocation};
pub use invoker::{BaseInvoker, Invoker};
pub use protocol::{handler_fn, DubboProtocol, Exporter, MethodHandler};
pub use result::RpcResult;
pub use status::{RpcStatus, StatusRegistry};
pub use url::Url;
