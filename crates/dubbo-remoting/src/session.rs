//! Per-connection framing of inbound bytes and outbound packages.
//!
//! Handlers never consume input themselves. `read` reports how many bytes a
//! complete frame used and the connection advances its buffer by that much,
//! so a partial frame can simply be retried once more bytes arrive.

use bytes::Bytes;
use dubbo_proto::{Codec, Package, ProtocolError};

use crate::exchange::PendingResponses;

/// Consumer-side handler: decodes responses and server heartbeats.
#[derive(Debug, Default)]
pub struct ClientPackageHandler {
    codec: Codec,
}

impl ClientPackageHandler {
    #[must_use]
    pub fn new(codec: Codec) -> Self {
        Self { codec }
    }

    /// Decodes one package from the front of `buf`.
    ///
    /// The response shape is taken from the pending entry for the header's
    /// id before the body is read. Unknown ids decode untyped.
    pub fn read(
        &self,
        buf: &[u8],
        pending: &PendingResponses,
    ) -> Result<Option<(Package, usize)>, ProtocolError> {
        self.codec
            .decode_with(buf, |header| pending.reply_type(header.id).unwrap_or_default())
    }

    pub fn write(&mut self, package: &Package) -> Result<Bytes, ProtocolError> {
        self.codec.encode(package)
    }
}

/// Provider-side handler: decodes requests into service calls.
#[derive(Debug, Default)]
pub struct ServerPackageHandler {
    codec: Codec,
}

impl ServerPackageHandler {
    #[must_use]
    pub fn new(codec: Codec) -> Self {
        Self { codec }
    }

    pub fn read(&self, buf: &[u8]) -> Result<Option<(Package, usize)>, ProtocolError> {
        self.codec.decode(buf)
    }

    pub fn write(&mut self, package: &Package) -> Result<Bytes, ProtocolError> {
        self.codec.encode(package)
    }
}
