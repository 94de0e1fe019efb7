//! Frame encoding and incremental decoding.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::header::{Header, DEFAULT_MAX_BODY_SIZE, HEADER_LENGTH};
use crate::hessian::{Encoder, ReturnType, Value};
use crate::package::{Body, Package, Service};
use crate::serialize::serializer;

/// Codec for Dubbo frames.
#[derive(Debug)]
pub struct Codec {
    /// Reusable buffer for encoding.
    buffer: BytesMut,
    max_body_size: usize,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Creates a codec with pre-allocated buffer capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }

    #[must_use]
    pub const fn with_max_body_size(mut self, max: usize) -> Self {
        self.max_body_size = max;
        self
    }

    #[must_use]
    pub const fn max_body_size(&self) -> usize {
        self.max_body_size
    }

    /// Encodes a package to a complete frame.
    ///
    /// The header's `body_len` is filled in from the serialised body.
    pub fn encode(&mut self, package: &Package) -> Result<Bytes, ProtocolError> {
        let body = if package.is_heartbeat() {
            let mut encoder = Encoder::with_capacity(1);
            encoder.encode(&Value::Null);
            encoder.finish()
        } else {
            let serial_id = package.header.serial_id;
            serializer(serial_id)
                .ok_or(ProtocolError::UnknownSerialization(serial_id))?
                .marshal(package)?
        };

        if body.len() > self.max_body_size {
            return Err(ProtocolError::MessageTooLarge {
                size: body.len(),
                max: self.max_body_size,
            });
        }

        let mut header = package.header;
        header.body_len = u32::try_from(body.len()).map_err(|_| ProtocolError::MessageTooLarge {
            size: body.len(),
            max: self.max_body_size,
        })?;

        self.buffer.reserve(HEADER_LENGTH + body.len());
        self.buffer.put_slice(&header.encode());
        self.buffer.put_slice(&body);
        Ok(self.buffer.split().freeze())
    }

    /// Parses the header at the front of `buf`.
    ///
    /// Returns `Ok(None)` when fewer than [`HEADER_LENGTH`] bytes are
    /// available.
    pub fn decode_header(&self, buf: &[u8]) -> Result<Option<Header>, ProtocolError> {
        let Some(bytes) = buf.get(..HEADER_LENGTH) else {
            return Ok(None);
        };
        let mut raw = [0u8; HEADER_LENGTH];
        raw.copy_from_slice(bytes);
        let header = Header::decode(&raw)?;
        header.validate_body_len(self.max_body_size)?;
        Ok(Some(header))
    }

    /// Decodes one package from the front of `buf`, reading response values
    /// as untyped.
    pub fn decode(&self, buf: &[u8]) -> Result<Option<(Package, usize)>, ProtocolError> {
        self.decode_with(buf, |_| ReturnType::Any)
    }

    /// Decodes one package from the front of `buf`.
    ///
    /// Returns the package and the number of bytes it occupied, or
    /// `Ok(None)` when the frame is incomplete. Nothing is consumed from
    /// `buf`; the caller advances by the returned length. `reply` is asked
    /// for the expected response shape once the header is known.
    pub fn decode_with<F>(
        &self,
        buf: &[u8],
        reply: F,
    ) -> Result<Option<(Package, usize)>, ProtocolError>
    where
        F: FnOnce(&Header) -> ReturnType,
    {
        let Some(header) = self.decode_header(buf)? else {
            return Ok(None);
        };
        let frame_len = header.frame_len();
        let Some(body) = buf.get(HEADER_LENGTH..frame_len) else {
            return Ok(None);
        };

        let mut package = Package {
            header,
            service: Service::default(),
            body: Body::Empty,
        };
        if header.kind.is_heartbeat() {
            return Ok(Some((package, frame_len)));
        }

        let serializer = serializer(header.serial_id)
            .ok_or(ProtocolError::UnknownSerialization(header.serial_id))?;
        let expected = reply(&header);
        serializer
            .unmarshal(body, &mut package, &expected)
            .map_err(|source| ProtocolError::Body {
                id: header.id,
                frame_len,
                source,
            })?;

        Ok(Some((package, frame_len)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hessian::HessianError;
    use crate::package::{RequestPayload, ResponsePayload};

    #[test]
    fn heartbeat_body_is_null() {
        let mut codec = Codec::new();
        let bytes = codec.encode(&Package::heartbeat_request(10)).unwrap();
        assert_eq!(bytes.len(), HEADER_LENGTH + 1);
        assert_eq!(bytes[HEADER_LENGTH], b'N');

        let (package, used) = codec.decode(&bytes).unwrap().unwrap();
        assert_eq!(used, bytes.len());
        assert!(package.is_heartbeat());
        assert_eq!(package.id(), 10);
    }

    #[test]
    fn short_input_needs_more() {
        let mut codec = Codec::new();
        let bytes = codec
            .encode(&Package::response(2, ResponsePayload::value(Value::Int(1))))
            .unwrap();
        assert!(codec.decode(&bytes[..5]).unwrap().is_none());
        assert!(codec
            .decode(&bytes[..bytes.len() - 1])
            .unwrap()
            .is_none());
    }

    #[test]
    fn oversized_body_rejected_on_both_sides() {
        let mut small = Codec::new().with_max_body_size(8);
        let request = Package::request(
            Service {
                path: "com.example.Echo".into(),
                method: "echo".into(),
                ..Service::default()
            },
            RequestPayload {
                args: vec![Value::from("a longer argument")],
                ..RequestPayload::default()
            },
        );
        assert!(matches!(
            small.encode(&request),
            Err(ProtocolError::MessageTooLarge { max: 8, .. })
        ));

        let bytes = Codec::new().encode(&request).unwrap();
        assert!(matches!(
            small.decode(&bytes),
            Err(ProtocolError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn body_failure_keeps_id_and_length() {
        let mut header = Header::response(12);
        header.body_len = 2;
        let mut frame = header.encode().to_vec();
        // Value type code followed by a truncated string.
        frame.extend_from_slice(&[0x91, 0x05]);

        let err = Codec::new().decode(&frame).unwrap_err();
        match err {
            ProtocolError::Body {
                id,
                frame_len,
                source,
            } => {
                assert_eq!(id, 12);
                assert_eq!(frame_len, HEADER_LENGTH + 2);
                assert_eq!(source, HessianError::UnexpectedEof);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unknown_serialization_rejected() {
        let mut package = Package::response(2, ResponsePayload::default());
        package.header.serial_id = 9;
        assert!(matches!(
            Codec::new().encode(&package),
            Err(ProtocolError::UnknownSerialization(9))
        ));
    }

    #[test]
    fn reply_shape_applied() {
        let mut codec = Codec::new();
        let bytes = codec
            .encode(&Package::response(2, ResponsePayload::value(Value::Int(7))))
            .unwrap();
        let (mut package, _) = codec
            .decode_with(&bytes, |h| {
                assert_eq!(h.id, 2);
                ReturnType::Long
            })
            .unwrap()
            .unwrap();
        assert_eq!(package.take_response().unwrap().value, Some(Value::Long(7)));
    }
}
