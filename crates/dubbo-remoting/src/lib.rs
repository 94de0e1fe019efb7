//! Request/response exchange over persistent Dubbo connections.
//!
//! The consumer side is [`ExchangeClient`]: it assigns request ids, keeps
//! in-flight requests in a [`PendingResponses`] map and matches responses
//! to them as the connection's reader task decodes frames. Calls can wait
//! for their response, register a callback, or be fire-and-forget. Idle
//! connections are kept alive with heartbeats, and a [`ReconnectSupervisor`]
//! re-establishes connections that close.
//!
//! The provider side is [`Server`], which decodes requests into
//! [`ServiceCall`](dubbo_proto::ServiceCall)s and hands them to a
//! [`RequestHandler`].

pub mod client;
pub mod connection;
pub mod error;
pub mod exchange;
pub mod reconnect;
pub mod server;
pub mod session;

pub use client::{ClientConfig, ExchangeClient};
pub use error::{DispatchError, RemotingError};
pub use exchange::{
    CallbackResponse, PendingResponse, PendingResponses, ResponseCallback, SequenceGenerator,
};
pub use reconnect::{Reconnect, ReconnectPolicy, ReconnectSupervisor, SupervisorExit};
pub use server::{RequestHandler, Server, ServerConfig};
pub use session::{ClientPackageHandler, ServerPackageHandler};
