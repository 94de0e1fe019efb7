//! Body serializers keyed by the header's serialization id.

use std::collections::HashMap;

use bytes::Bytes;

use crate::error::ProtocolError;
use crate::header::{PackageKind, SERIAL_HESSIAN2};
use crate::hessian::{
    args_type_descriptor, count_arg_types, Decoder, Encoder, HessianError, ReturnType, Value,
};
use crate::package::{
    Body, Package, RemoteException, ResponsePayload, ServiceCall, DUBBO_VERSION_KEY, GROUP_KEY,
    INTERFACE_KEY, PATH_KEY, TIMEOUT_KEY, VERSION_KEY,
};
use crate::version::{is_support_response_attachment, DEFAULT_DUBBO_PROTOCOL_VERSION};

const RESPONSE_WITH_EXCEPTION: i32 = 0;
const RESPONSE_VALUE: i32 = 1;
const RESPONSE_NULL_VALUE: i32 = 2;
const RESPONSE_WITH_EXCEPTION_WITH_ATTACHMENTS: i32 = 3;
const RESPONSE_VALUE_WITH_ATTACHMENTS: i32 = 4;
const RESPONSE_NULL_VALUE_WITH_ATTACHMENTS: i32 = 5;

/// Converts package bodies to and from bytes.
pub trait Serializer: Send + Sync {
    /// Serialization id written into the header flags.
    fn id(&self) -> u8;

    fn name(&self) -> &'static str;

    /// Encodes the body of a non-heartbeat package.
    fn marshal(&self, package: &Package) -> Result<Bytes, ProtocolError>;

    /// Decodes `body` into `package.body` (and `package.service` for
    /// requests), reshaping response values to `reply`.
    fn unmarshal(
        &self,
        body: &[u8],
        package: &mut Package,
        reply: &ReturnType,
    ) -> Result<(), HessianError>;
}

/// Looks up a built-in serializer by id.
#[must_use]
pub fn serializer(id: u8) -> Option<&'static dyn Serializer> {
    static HESSIAN2: HessianSerializer = HessianSerializer;
    match id {
        SERIAL_HESSIAN2 => Some(&HESSIAN2),
        _ => None,
    }
}

/// Hessian2 body serializer.
#[derive(Debug, Default, Clone, Copy)]
pub struct HessianSerializer;

impl Serializer for HessianSerializer {
    fn id(&self) -> u8 {
        SERIAL_HESSIAN2
    }

    fn name(&self) -> &'static str {
        "hessian2"
    }

    fn marshal(&self, package: &Package) -> Result<Bytes, ProtocolError> {
        let mut encoder = Encoder::with_capacity(256);
        match (&package.header.kind, &package.body) {
            (PackageKind::Request, Body::Request(payload)) => {
                let service = &package.service;
                encoder.write_string(DEFAULT_DUBBO_PROTOCOL_VERSION);
                encoder.write_string(&service.path);
                encoder.write_string(&service.version);
                encoder.write_string(&service.method);
                match &payload.arg_types {
                    Some(arg_types) => encoder.write_string(arg_types),
                    None => encoder.write_string(&args_type_descriptor(&payload.args)),
                }
                for arg in &payload.args {
                    encoder.encode(arg);
                }

                let mut attachments = payload.attachments.clone();
                attachments.insert(PATH_KEY.to_owned(), service.path.clone());
                attachments.insert(VERSION_KEY.to_owned(), service.version.clone());
                if !service.group.is_empty() {
                    attachments.insert(GROUP_KEY.to_owned(), service.group.clone());
                }
                if !service.interface.is_empty() {
                    attachments.insert(INTERFACE_KEY.to_owned(), service.interface.clone());
                }
                if !service.timeout.is_zero() {
                    attachments.insert(
                        TIMEOUT_KEY.to_owned(),
                        service.timeout.as_millis().to_string(),
                    );
                }
                encoder.encode(&Value::string_map(&attachments));
            }
            (PackageKind::Request, Body::Call(call)) => {
                // Re-encoding a received call, e.g. when relaying.
                encoder.write_string(&call.dubbo_version);
                encoder.write_string(&package.service.path);
                encoder.write_string(&package.service.version);
                encoder.write_string(&package.service.method);
                encoder.write_string(&call.arg_types);
                for arg in &call.args {
                    encoder.encode(arg);
                }
                encoder.encode(&Value::string_map(&call.attachments));
            }
            (PackageKind::Response, Body::Response(payload)) => {
                if package.header.is_ok() {
                    marshal_response(&mut encoder, payload);
                } else {
                    let message = payload
                        .exception
                        .as_ref()
                        .map(|e| e.message.as_str())
                        .unwrap_or_default();
                    encoder.write_string(message);
                }
            }
            (kind, _) => {
                return Err(ProtocolError::InvalidPayload(format!(
                    "body does not match package kind {kind:?}"
                )))
            }
        }
        Ok(encoder.finish())
    }

    fn unmarshal(
        &self,
        body: &[u8],
        package: &mut Package,
        reply: &ReturnType,
    ) -> Result<(), HessianError> {
        let mut decoder = Decoder::new(body);
        match package.header.kind {
            PackageKind::Request => unmarshal_request(&mut decoder, package),
            PackageKind::Response => {
                let payload = if package.header.is_ok() {
                    unmarshal_response(&mut decoder, reply)?
                } else {
                    ResponsePayload::exception(RemoteException::message(decoder.decode_string()?))
                };
                package.body = Body::Response(payload);
                Ok(())
            }
            PackageKind::HeartbeatRequest | PackageKind::HeartbeatResponse => {
                package.body = Body::Empty;
                Ok(())
            }
        }
    }
}

fn marshal_response(encoder: &mut Encoder, payload: &ResponsePayload) {
    let with_attachments = payload
        .attachments
        .get(DUBBO_VERSION_KEY)
        .is_some_and(|v| is_support_response_attachment(v));

    if let Some(exception) = &payload.exception {
        encoder.write_int(if with_attachments {
            RESPONSE_WITH_EXCEPTION_WITH_ATTACHMENTS
        } else {
            RESPONSE_WITH_EXCEPTION
        });
        encoder.encode(&exception.to_value());
    } else {
        match &payload.value {
            Some(value) if !value.is_null() => {
                encoder.write_int(if with_attachments {
                    RESPONSE_VALUE_WITH_ATTACHMENTS
                } else {
                    RESPONSE_VALUE
                });
                encoder.encode(value);
            }
            _ => encoder.write_int(if with_attachments {
                RESPONSE_NULL_VALUE_WITH_ATTACHMENTS
            } else {
                RESPONSE_NULL_VALUE
            }),
        }
    }

    if with_attachments {
        encoder.encode(&Value::string_map(&payload.attachments));
    }
}

fn unmarshal_response(
    decoder: &mut Decoder<'_>,
    reply: &ReturnType,
) -> Result<ResponsePayload, HessianError> {
    let code = decoder.decode_int()?;
    let mut payload = ResponsePayload::default();
    match code {
        RESPONSE_WITH_EXCEPTION | RESPONSE_WITH_EXCEPTION_WITH_ATTACHMENTS => {
            payload.exception = Some(RemoteException::from_value(decoder.decode()?));
        }
        RESPONSE_VALUE | RESPONSE_VALUE_WITH_ATTACHMENTS => {
            payload.value = Some(decoder.decode()?.coerce(reply)?);
        }
        RESPONSE_NULL_VALUE | RESPONSE_NULL_VALUE_WITH_ATTACHMENTS => {}
        other => return Err(HessianError::InvalidLength(i64::from(other))),
    }
    if code >= RESPONSE_WITH_EXCEPTION_WITH_ATTACHMENTS {
        payload.attachments = decoder.decode()?.into_string_map()?;
    }
    Ok(payload)
}

fn unmarshal_request(decoder: &mut Decoder<'_>, package: &mut Package) -> Result<(), HessianError> {
    let dubbo_version = decoder.decode_string()?;
    let path = decoder.decode_string()?;
    let version = decoder.decode_string()?;
    let method = decoder.decode_string()?;
    let arg_types = decoder.decode_string()?;

    let count = count_arg_types(&arg_types);
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        args.push(decoder.decode()?);
    }

    let mut attachments: HashMap<String, String> = if decoder.remaining() > 0 {
        decoder.decode()?.into_string_map()?
    } else {
        HashMap::new()
    };
    attachments.insert(DUBBO_VERSION_KEY.to_owned(), dubbo_version.clone());

    let fallback = |explicit: String, key: &str| {
        if explicit.is_empty() {
            attachments.get(key).cloned().unwrap_or_default()
        } else {
            explicit
        }
    };
    let path = fallback(path, PATH_KEY);
    let version = fallback(version, VERSION_KEY);
    let interface = attachments
        .get(INTERFACE_KEY)
        .filter(|i| !i.is_empty())
        .cloned()
        .unwrap_or_else(|| path.clone());
    let group = attachments.get(GROUP_KEY).cloned().unwrap_or_default();
    let timeout = attachments
        .get(TIMEOUT_KEY)
        .and_then(|t| t.parse::<u64>().ok())
        .map(std::time::Duration::from_millis)
        .unwrap_or_default();

    package.service = crate::package::Service {
        path,
        interface,
        group,
        version,
        method,
        timeout,
    };
    package.body = Body::Call(ServiceCall {
        dubbo_version,
        arg_types,
        args,
        attachments,
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::Header;
    use crate::package::{RequestPayload, Service};

    fn decode_as(kind: Package, bytes: &[u8], reply: &ReturnType) -> Package {
        let mut package = Package {
            header: kind.header,
            service: Service::default(),
            body: Body::Empty,
        };
        HessianSerializer
            .unmarshal(bytes, &mut package, reply)
            .unwrap();
        package
    }

    #[test]
    fn lookup_by_id() {
        assert_eq!(serializer(2).map(|s| s.name()), Some("hessian2"));
        assert!(serializer(6).is_none());
    }

    #[test]
    fn request_attachments_merge_service_fields() {
        let service = Service {
            path: "com.example.Echo".into(),
            interface: "com.example.Echo".into(),
            group: "g1".into(),
            version: "1.0.0".into(),
            method: "echo".into(),
            timeout: std::time::Duration::from_secs(3),
        };
        let mut attachments = HashMap::new();
        attachments.insert("trace".to_owned(), "abc".to_owned());
        attachments.insert(PATH_KEY.to_owned(), "stale".to_owned());
        let request = Package::request(
            service.clone(),
            RequestPayload {
                args: vec![Value::from("hi")],
                arg_types: None,
                attachments,
            },
        );

        let bytes = HessianSerializer.marshal(&request).unwrap();
        let decoded = decode_as(request, &bytes, &ReturnType::Any);

        assert_eq!(decoded.service, service);
        let Body::Call(call) = decoded.body else {
            panic!("expected call body");
        };
        assert_eq!(call.dubbo_version, "2.0.2");
        assert_eq!(call.arg_types, "Ljava/lang/String;");
        assert_eq!(call.args, vec![Value::from("hi")]);
        assert_eq!(call.attachments["path"], "com.example.Echo");
        assert_eq!(call.attachments["timeout"], "3000");
        assert_eq!(call.attachments["group"], "g1");
        assert_eq!(call.attachments["trace"], "abc");
        assert_eq!(call.attachments["dubbo"], "2.0.2");
    }

    #[test]
    fn empty_path_falls_back_to_attachment() {
        let mut encoder = Encoder::new();
        for s in ["2.0.2", "", "", "ping", ""] {
            encoder.write_string(s);
        }
        let mut attachments = HashMap::new();
        attachments.insert("path".to_owned(), "com.example.Ping".to_owned());
        attachments.insert("version".to_owned(), "2.0".to_owned());
        encoder.encode(&Value::string_map(&attachments));

        let decoded = decode_as(
            Package::request(Service::default(), RequestPayload::default()),
            &encoder.finish(),
            &ReturnType::Any,
        );
        assert_eq!(decoded.service.path, "com.example.Ping");
        assert_eq!(decoded.service.interface, "com.example.Ping");
        assert_eq!(decoded.service.version, "2.0");
        assert_eq!(decoded.service.method, "ping");
    }

    #[test]
    fn response_attachments_follow_version_gate() {
        let mut payload = ResponsePayload::value(Value::Int(5));
        payload
            .attachments
            .insert(DUBBO_VERSION_KEY.to_owned(), "2.0.2".to_owned());
        let response = Package::response(2, payload.clone());
        let bytes = HessianSerializer.marshal(&response).unwrap();
        assert_eq!(bytes[0], 0x94);
        let decoded = decode_as(response, &bytes, &ReturnType::Long);
        let Body::Response(got) = decoded.body else {
            panic!("expected response body");
        };
        assert_eq!(got.value, Some(Value::Long(5)));
        assert_eq!(got.attachments, payload.attachments);

        payload
            .attachments
            .insert(DUBBO_VERSION_KEY.to_owned(), "2.5.3".to_owned());
        let legacy = HessianSerializer
            .marshal(&Package::response(2, payload))
            .unwrap();
        assert_eq!(legacy[0], 0x91);
    }

    #[test]
    fn null_and_exception_responses() {
        let null = Package::response(2, ResponsePayload::default());
        let bytes = HessianSerializer.marshal(&null).unwrap();
        assert_eq!(&bytes[..], &[0x92]);

        let ex = RemoteException::new("java.lang.IllegalArgumentException", "bad");
        let failed = Package::response(2, ResponsePayload::exception(ex.clone()));
        let bytes = HessianSerializer.marshal(&failed).unwrap();
        let decoded = decode_as(failed, &bytes, &ReturnType::Any);
        let Body::Response(got) = decoded.body else {
            panic!("expected response body");
        };
        assert_eq!(got.exception, Some(ex));
        assert!(got.value.is_none());
    }

    #[test]
    fn error_status_carries_only_message() {
        let failed = Package::error_response(
            8,
            crate::error::ResponseStatus::ServiceNotFound,
            "no such service",
        );
        let bytes = HessianSerializer.marshal(&failed).unwrap();
        let mut encoder = Encoder::new();
        encoder.write_string("no such service");
        assert_eq!(bytes, encoder.finish());

        let decoded = decode_as(failed, &bytes, &ReturnType::Any);
        let Body::Response(got) = decoded.body else {
            panic!("expected response body");
        };
        assert_eq!(got.exception.unwrap().message, "no such service");
    }

    #[test]
    fn mismatched_body_is_rejected() {
        let bogus = Package {
            header: Header::request(2),
            service: Service::default(),
            body: Body::Response(ResponsePayload::default()),
        };
        assert!(matches!(
            HessianSerializer.marshal(&bogus),
            Err(ProtocolError::InvalidPayload(_))
        ));
    }
}
