//! Fixed 16-byte Dubbo frame header.

use crate::error::{ProtocolError, ResponseStatus};

/// Frame header size in bytes.
pub const HEADER_LENGTH: usize = 16;

/// Magic number opening every frame.
pub const MAGIC: u16 = 0xdabb;

/// Default maximum body size (8 MiB).
pub const DEFAULT_MAX_BODY_SIZE: usize = 8 * 1024 * 1024;

/// Serialisation id of Hessian2.
pub const SERIAL_HESSIAN2: u8 = 2;

const FLAG_REQUEST: u8 = 0x80;
const FLAG_TWO_WAY: u8 = 0x40;
const FLAG_EVENT: u8 = 0x20;
const SERIAL_MASK: u8 = 0x1f;

/// What a frame carries. Exactly one per frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PackageKind {
    Request,
    Response,
    HeartbeatRequest,
    HeartbeatResponse,
}

impl PackageKind {
    #[must_use]
    pub const fn is_heartbeat(self) -> bool {
        matches!(self, Self::HeartbeatRequest | Self::HeartbeatResponse)
    }

    /// Whether the frame travels from consumer to provider.
    #[must_use]
    pub const fn is_request(self) -> bool {
        matches!(self, Self::Request | Self::HeartbeatRequest)
    }
}

/// Frame header.
///
/// Wire format (16 bytes, big-endian):
/// - Bytes 0-1: magic `0xdabb`
/// - Byte 2: flags (request `0x80`, two-way `0x40`, event `0x20`,
///   serialization id in the low five bits)
/// - Byte 3: response status
/// - Bytes 4-11: correlation id
/// - Bytes 12-15: body length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub kind: PackageKind,
    /// Only meaningful for requests; heartbeat requests are always two-way.
    pub two_way: bool,
    pub serial_id: u8,
    pub status: u8,
    pub id: u64,
    pub body_len: u32,
}

impl Header {
    /// Header for a two-way request.
    #[must_use]
    pub const fn request(id: u64) -> Self {
        Self {
            kind: PackageKind::Request,
            two_way: true,
            serial_id: SERIAL_HESSIAN2,
            status: 0,
            id,
            body_len: 0,
        }
    }

    /// Header for an OK response to `id`.
    #[must_use]
    pub const fn response(id: u64) -> Self {
        Self {
            kind: PackageKind::Response,
            two_way: false,
            serial_id: SERIAL_HESSIAN2,
            status: ResponseStatus::Ok.as_u8(),
            id,
            body_len: 0,
        }
    }

    #[must_use]
    pub const fn heartbeat_request(id: u64) -> Self {
        Self {
            kind: PackageKind::HeartbeatRequest,
            two_way: true,
            serial_id: SERIAL_HESSIAN2,
            status: 0,
            id,
            body_len: 0,
        }
    }

    #[must_use]
    pub const fn heartbeat_response(id: u64) -> Self {
        Self {
            kind: PackageKind::HeartbeatResponse,
            two_way: false,
            serial_id: SERIAL_HESSIAN2,
            status: ResponseStatus::Ok.as_u8(),
            id,
            body_len: 0,
        }
    }

    /// Typed status, if the byte is a known code.
    #[must_use]
    pub fn response_status(&self) -> Option<ResponseStatus> {
        ResponseStatus::from_u8(self.status)
    }

    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok.as_u8()
    }

    /// Total frame length (header plus body).
    #[must_use]
    pub const fn frame_len(&self) -> usize {
        HEADER_LENGTH + self.body_len as usize
    }

    /// Encodes the header to bytes.
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_LENGTH] {
        let mut flags = self.serial_id & SERIAL_MASK;
        match self.kind {
            PackageKind::Request => {
                flags |= FLAG_REQUEST;
                if self.two_way {
                    flags |= FLAG_TWO_WAY;
                }
            }
            PackageKind::HeartbeatRequest => flags |= FLAG_REQUEST | FLAG_TWO_WAY | FLAG_EVENT,
            PackageKind::HeartbeatResponse => flags |= FLAG_EVENT,
            PackageKind::Response => {}
        }

        let mut buf = [0u8; HEADER_LENGTH];
        buf[0..2].copy_from_slice(&MAGIC.to_be_bytes());
        buf[2] = flags;
        buf[3] = if self.kind.is_request() { 0 } else { self.status };
        buf[4..12].copy_from_slice(&self.id.to_be_bytes());
        buf[12..16].copy_from_slice(&self.body_len.to_be_bytes());
        buf
    }

    /// Decodes a header from bytes.
    pub fn decode(bytes: &[u8; HEADER_LENGTH]) -> Result<Self, ProtocolError> {
        let magic = u16::from_be_bytes([bytes[0], bytes[1]]);
        if magic != MAGIC {
            return Err(ProtocolError::InvalidMagic(magic));
        }

        let flags = bytes[2];
        let is_request = flags & FLAG_REQUEST != 0;
        let kind = match (is_request, flags & FLAG_EVENT != 0) {
            (true, true) => PackageKind::HeartbeatRequest,
            (true, false) => PackageKind::Request,
            (false, true) => PackageKind::HeartbeatResponse,
            (false, false) => PackageKind::Response,
        };

        let mut id = [0u8; 8];
        id.copy_from_slice(&bytes[4..12]);

        Ok(Self {
            kind,
            two_way: flags & FLAG_TWO_WAY != 0,
            serial_id: flags & SERIAL_MASK,
            status: bytes[3],
            id: u64::from_be_bytes(id),
            body_len: u32::from_be_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
        })
    }

    /// Validates the body length against `max`.
    pub fn validate_body_len(&self, max: usize) -> Result<(), ProtocolError> {
        let len = self.body_len as usize;
        if len > max {
            return Err(ProtocolError::MessageTooLarge { size: len, max });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_header_roundtrip() {
        let mut header = Header::request(42);
        header.body_len = 1024;
        let bytes = header.encode();

        assert_eq!(&bytes[0..2], &[0xda, 0xbb]);
        assert_eq!(bytes[2], 0x80 | 0x40 | 0x02);
        assert_eq!(Header::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn one_way_request_clears_two_way_bit() {
        let mut header = Header::request(4);
        header.two_way = false;
        let bytes = header.encode();
        assert_eq!(bytes[2], 0x80 | 0x02);
        assert!(!Header::decode(&bytes).unwrap().two_way);
    }

    #[test]
    fn heartbeat_flags() {
        let req = Header::heartbeat_request(6).encode();
        assert_eq!(req[2], 0xe2);
        assert_eq!(
            Header::decode(&req).unwrap().kind,
            PackageKind::HeartbeatRequest
        );

        let rsp = Header::heartbeat_response(6).encode();
        assert_eq!(rsp[2], 0x22);
        assert_eq!(rsp[3], 20);
        assert!(Header::decode(&rsp).unwrap().kind.is_heartbeat());
    }

    #[test]
    fn response_carries_status() {
        let mut header = Header::response(8);
        header.status = ResponseStatus::ServiceNotFound.as_u8();
        let decoded = Header::decode(&header.encode()).unwrap();
        assert_eq!(
            decoded.response_status(),
            Some(ResponseStatus::ServiceNotFound)
        );
        assert!(!decoded.is_ok());
    }

    #[test]
    fn bad_magic_rejected() {
        let mut bytes = Header::request(2).encode();
        bytes[0] = 0xca;
        assert!(matches!(
            Header::decode(&bytes),
            Err(ProtocolError::InvalidMagic(0xcabb))
        ));
    }

    #[test]
    fn body_len_validation() {
        let mut header = Header::request(2);
        header.body_len = 100;
        assert!(header.validate_body_len(DEFAULT_MAX_BODY_SIZE).is_ok());
        assert!(header.validate_body_len(99).is_err());
    }
}
