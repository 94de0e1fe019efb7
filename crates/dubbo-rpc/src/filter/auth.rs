//! Request signing and verification.
//!
//! The consumer signs `"{interface:version:group}#{method}#{secret}#{timestamp}"`
//! with HMAC-SHA256 and sends the signature, the timestamp, its access key
//! and its application name as attachments. The provider recomputes the
//! signature from its own copy of the secret. With `param.sign=true` the
//! signed message is the JSON array of the arguments followed by the
//! canonical string.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use dubbo_proto::Value;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, warn};

use super::{Filter, Next};
use crate::error::RpcError;
use crate::invocation::Invocation;
use crate::result::RpcResult;
use crate::url::{Url, APPLICATION_KEY};

type HmacSha256 = Hmac<Sha256>;

pub const SIGN_FILTER: &str = "sign";
pub const AUTH_FILTER: &str = "auth";

/// URL switch enabling both filters.
pub const AUTH_KEY: &str = "auth";
pub const ACCESS_KEY_ID_KEY: &str = "accessKeyId";
pub const SECRET_ACCESS_KEY_KEY: &str = "secretAccessKey";
pub const PARAMETER_SIGNATURE_KEY: &str = "param.sign";

pub const REQUEST_SIGNATURE_KEY: &str = "signature";
pub const REQUEST_TIMESTAMP_KEY: &str = "timestamp";
pub const AK_KEY: &str = "ak";
pub const CONSUMER_KEY: &str = "consumer";

/// An access key and its secret.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessKeyPair {
    pub access_key: String,
    pub secret_key: String,
}

impl std::fmt::Debug for AccessKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessKeyPair")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// Resolves the key pair used for a call.
pub trait AccessKeyStorage: Send + Sync {
    fn access_key_pair(&self, invocation: &Invocation, url: &Url) -> Option<AccessKeyPair>;
}

/// Reads `accessKeyId` and `secretAccessKey` from the URL.
#[derive(Debug, Default, Clone, Copy)]
pub struct UrlAccessKeyStorage;

impl AccessKeyStorage for UrlAccessKeyStorage {
    fn access_key_pair(&self, _invocation: &Invocation, url: &Url) -> Option<AccessKeyPair> {
        let access_key = url.param(ACCESS_KEY_ID_KEY).filter(|v| !v.is_empty())?;
        let secret_key = url
            .param(SECRET_ACCESS_KEY_KEY)
            .filter(|v| !v.trim().is_empty())?;
        Some(AccessKeyPair {
            access_key: access_key.to_owned(),
            secret_key: secret_key.to_owned(),
        })
    }
}

/// Consumer-side filter that signs outgoing calls when `auth=true`.
pub struct SignFilter {
    storage: Arc<dyn AccessKeyStorage>,
}

impl SignFilter {
    #[must_use]
    pub fn new(storage: Arc<dyn AccessKeyStorage>) -> Self {
        Self { storage }
    }

    /// Adds the signature attachments to `invocation`.
    ///
    /// # Errors
    ///
    /// Fails when no key pair is available.
    pub fn sign(&self, invocation: &mut Invocation, url: &Url) -> Result<(), RpcError> {
        let pair = self
            .storage
            .access_key_pair(invocation, url)
            .ok_or_else(|| RpcError::Internal("access key pair not found".into()))?;
        let timestamp = now_millis().to_string();
        let signature = signature(url, invocation, &pair.secret_key, &timestamp)?;

        invocation.set_attachment(REQUEST_SIGNATURE_KEY, signature);
        invocation.set_attachment(REQUEST_TIMESTAMP_KEY, timestamp);
        invocation.set_attachment(AK_KEY, pair.access_key);
        invocation.set_attachment(CONSUMER_KEY, url.param_or(APPLICATION_KEY, ""));
        Ok(())
    }
}

#[async_trait]
impl Filter for SignFilter {
    async fn invoke(&self, next: Next<'_>, invocation: &mut Invocation) -> RpcResult {
        let url = next.url();
        if url.param_bool(AUTH_KEY, false) {
            if let Err(e) = self.sign(invocation, url) {
                warn!(service = %url.service_key(), error = %e, "failed to sign request");
                return RpcResult::err(RpcError::AuthFailed);
            }
        }
        next.run(invocation).await
    }
}

/// Provider-side filter that verifies signatures when `auth=true`.
pub struct AuthFilter {
    storage: Arc<dyn AccessKeyStorage>,
}

impl AuthFilter {
    #[must_use]
    pub fn new(storage: Arc<dyn AccessKeyStorage>) -> Self {
        Self { storage }
    }

    /// Checks the signature attachments of `invocation`.
    ///
    /// # Errors
    ///
    /// Every failure is reported as [`RpcError::AuthFailed`]; the cause is
    /// only logged.
    pub fn authenticate(&self, invocation: &Invocation, url: &Url) -> Result<(), RpcError> {
        self.check(invocation, url).map_err(|cause| {
            debug!(service = %url.service_key(), method = %invocation.method(), cause, "authentication failed");
            RpcError::AuthFailed
        })
    }

    fn check(&self, invocation: &Invocation, url: &Url) -> Result<(), &'static str> {
        let present = |key| invocation.attachment(key).filter(|v| !v.is_empty());
        let (Some(_), Some(_), Some(timestamp), Some(signature)) = (
            present(AK_KEY),
            present(CONSUMER_KEY),
            present(REQUEST_TIMESTAMP_KEY),
            present(REQUEST_SIGNATURE_KEY),
        ) else {
            return Err("missing auth attachments");
        };

        let pair = self
            .storage
            .access_key_pair(invocation, url)
            .ok_or("access key pair not found")?;
        let message = signed_message(url, invocation, &pair.secret_key, timestamp)
            .map_err(|_| "failed to build signed message")?;
        let expected = URL_SAFE
            .decode(signature)
            .map_err(|_| "signature is not base64")?;

        let mut mac =
            HmacSha256::new_from_slice(pair.secret_key.as_bytes()).map_err(|_| "bad secret")?;
        mac.update(message.as_bytes());
        mac.verify_slice(&expected)
            .map_err(|_| "signature mismatch")
    }
}

#[async_trait]
impl Filter for AuthFilter {
    async fn invoke(&self, next: Next<'_>, invocation: &mut Invocation) -> RpcResult {
        let url = next.url();
        if url.param_bool(AUTH_KEY, false) {
            if let Err(e) = self.authenticate(invocation, url) {
                return RpcResult::err(e);
            }
        }
        next.run(invocation).await
    }
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}

fn signature(
    url: &Url,
    invocation: &Invocation,
    secret: &str,
    timestamp: &str,
) -> Result<String, RpcError> {
    let message = signed_message(url, invocation, secret, timestamp)?;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| RpcError::Internal(format!("invalid secret: {e}")))?;
    mac.update(message.as_bytes());
    Ok(URL_SAFE.encode(mac.finalize().into_bytes()))
}

fn signed_message(
    url: &Url,
    invocation: &Invocation,
    secret: &str,
    timestamp: &str,
) -> Result<String, RpcError> {
    let canonical = format!(
        "{}#{}#{secret}#{timestamp}",
        url.colon_separated_key(),
        invocation.method()
    );
    if !url.param_bool(PARAMETER_SIGNATURE_KEY, false) {
        return Ok(canonical);
    }
    let mut params: Vec<serde_json::Value> = invocation.args().iter().map(to_json).collect();
    params.push(serde_json::Value::String(canonical));
    serde_json::to_string(&params).map_err(|e| RpcError::Internal(format!("sign params: {e}")))
}

fn to_json(value: &Value) -> serde_json::Value {
    use serde_json::Value as Json;

    match value {
        Value::Null => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Int(i) => Json::from(*i),
        Value::Long(l) | Value::Date(l) => Json::from(*l),
        Value::Double(d) => serde_json::Number::from_f64(*d).map_or(Json::Null, Json::Number),
        Value::String(s) => Json::String(s.clone()),
        Value::Binary(b) => Json::String(base64::engine::general_purpose::STANDARD.encode(b)),
        Value::List { items, .. } => Json::Array(items.iter().map(to_json).collect()),
        Value::Map { entries, .. } => {
            if entries.iter().all(|(k, _)| k.as_str().is_some()) {
                Json::Object(
                    entries
                        .iter()
                        .filter_map(|(k, v)| Some((k.as_str()?.to_owned(), to_json(v))))
                        .collect(),
                )
            } else {
                Json::Array(
                    entries
                        .iter()
                        .map(|(k, v)| Json::Array(vec![to_json(k), to_json(v)]))
                        .collect(),
                )
            }
        }
        Value::Object { fields, .. } => Json::Object(
            fields
                .iter()
                .map(|(name, v)| (name.clone(), to_json(v)))
                .collect(),
        ),
    }
}
