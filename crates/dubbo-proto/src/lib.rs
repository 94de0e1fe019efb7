//! Wire protocol for Dubbo-compatible RPC.
//!
//! This crate frames packages on a byte stream and serialises their bodies
//! with Hessian2, interoperating with Java and Go Dubbo peers. It supports:
//!
//! - Two-way and one-way requests
//! - Responses with values, nulls, exceptions and (for peers that accept
//!   them) attachments
//! - Heartbeats in both directions
//! - Incremental decoding from partial reads
//!
//! # Wire Format
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                    Frame Header (16 bytes, fixed)                 │
//! ├──────────┬─────────┬──────────┬──────────────────┬───────────────┤
//! │ Magic (2)│Flags (1)│Status (1)│  Request Id (8)  │ Body Len (4)  │
//! │  0xdabb  │ R T E S │          │    big-endian    │  big-endian   │
//! ├──────────┴─────────┴──────────┴──────────────────┴───────────────┤
//! │                     Hessian2-serialised body                      │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Flags: `R` request (`0x80`), `T` two-way (`0x40`), `E` event/heartbeat
//! (`0x20`), `S` serialization id in the low five bits.
//!
//! # Example
//!
//! ```
//! use dubbo_proto::{Codec, Package, RequestPayload, Service, Value};
//!
//! let service = Service {
//!     path: "org.apache.dubbo.sample.UserProvider".into(),
//!     method: "GetUser".into(),
//!     ..Service::default()
//! };
//! let mut request = Package::request(
//!     service,
//!     RequestPayload { args: vec![Value::from("A003")], ..Default::default() },
//! );
//! request.header.id = 2;
//!
//! let mut codec = Codec::new();
//! let frame = codec.encode(&request).unwrap();
//! let (decoded, used) = codec.decode(&frame).unwrap().unwrap();
//! assert_eq!(used, frame.len());
//! assert_eq!(decoded.service.method, "GetUser");
//! ```

pub mod codec;
mod error;
pub mod header;
pub mod hessian;
mod package;
mod serialize;
pub mod version;

pub use codec::Codec;
pub use error::{ProtocolError, ResponseStatus};
pub use header::{Header, PackageKind, DEFAULT_MAX_BODY_SIZE, HEADER_LENGTH, MAGIC};
pub use hessian::{HessianError, ReturnType, Value};
pub use package::{
    service_key, Body, Package, RemoteException, RequestPayload, ResponsePayload, Service,
    ServiceCall, DEFAULT_EXCEPTION_CLASS, DUBBO_VERSION_KEY, GROUP_KEY, INTERFACE_KEY, PATH_KEY,
    TIMEOUT_KEY, VERSION_KEY,
};
pub use serialize::{serializer, HessianSerializer, Serializer};
pub use version::{is_support_response_attachment, DEFAULT_DUBBO_PROTOCOL_VERSION};
