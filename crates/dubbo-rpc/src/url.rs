//! Service URLs.
//!
//! Every invoker is bound to a URL of the form
//! `protocol://host:port/path?key=value&...`. Parameters carry the resolved
//! per-service configuration (`timeout`, `retries`, `cluster`, filter lists
//! and so on); method-level overrides use the `methods.<method>.<key>` form.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::RpcError;

pub const INTERFACE_KEY: &str = "interface";
pub const GROUP_KEY: &str = "group";
pub const VERSION_KEY: &str = "version";
pub const TIMEOUT_KEY: &str = "timeout";
pub const RETRIES_KEY: &str = "retries";
pub const CLUSTER_KEY: &str = "cluster";
pub const LOADBALANCE_KEY: &str = "loadbalance";
pub const FORKS_KEY: &str = "forks";
pub const APPLICATION_KEY: &str = "application";
pub const REFERENCE_FILTER_KEY: &str = "reference.filter";
pub const SERVICE_FILTER_KEY: &str = "service.filter";

pub const HEALTH_ROUTE_ENABLED_KEY: &str = "health.route.enabled";
pub const SUCCESSIVE_FAILED_THRESHOLD_KEY: &str = "successive.failed.threshold";
pub const CIRCUIT_TRIPPED_TIMEOUT_FACTOR_KEY: &str = "circuit.tripped.timeout.factor";
pub const OUTSTANDING_REQUEST_LIMIT_KEY: &str = "outstanding.request.limit";

pub const CONDITION_RULE_KEY: &str = "condition.rule";
pub const CONDITION_FORCE_KEY: &str = "condition.force";

pub const TPS_LIMIT_RATE_KEY: &str = "tps.limit.rate";
pub const TPS_LIMIT_INTERVAL_KEY: &str = "tps.limit.interval";

/// Default per-call timeout when the URL has none.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

/// A parsed service URL.
///
/// Parameters are kept sorted so that [`Url::key`] and the `Display` form
/// are stable.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Url {
    protocol: String,
    host: String,
    port: u16,
    path: String,
    params: BTreeMap<String, String>,
}

impl Url {
    #[must_use]
    pub fn new(protocol: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            protocol: protocol.into(),
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Parses `protocol://host:port/path?k=v&...`.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::InvalidUrl`] when the scheme or port is missing
    /// or malformed.
    pub fn parse(raw: &str) -> Result<Self, RpcError> {
        let invalid = |why: &str| RpcError::InvalidUrl(format!("{raw}: {why}"));

        let (protocol, rest) = raw.split_once("://").ok_or_else(|| invalid("missing scheme"))?;
        if protocol.is_empty() {
            return Err(invalid("empty scheme"));
        }

        let (location, query) = match rest.split_once('?') {
            Some((l, q)) => (l, Some(q)),
            None => (rest, None),
        };
        let (authority, path) = match location.split_once('/') {
            Some((a, p)) => (a, p),
            None => (location, ""),
        };
        let (host, port) = match authority.rsplit_once(':') {
            Some((h, p)) => {
                let port = p.parse::<u16>().map_err(|_| invalid("bad port"))?;
                (h, port)
            }
            None => (authority, 0),
        };

        let mut url = Self::new(protocol, host, port).with_path(percent_decode(path));
        if let Some(query) = query {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
                url.params.insert(percent_decode(k), percent_decode(v));
            }
        }
        Ok(url)
    }

    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.params.insert(key.into(), value.to_string());
        self
    }

    pub fn set_param(&mut self, key: impl Into<String>, value: impl ToString) {
        self.params.insert(key.into(), value.to_string());
    }

    #[must_use]
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub const fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    /// `host:port`.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    #[must_use]
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn param_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.param(key).filter(|v| !v.is_empty()).unwrap_or(default)
    }

    #[must_use]
    pub fn param_bool(&self, key: &str, default: bool) -> bool {
        self.param(key)
            .and_then(|v| v.parse::<bool>().ok())
            .unwrap_or(default)
    }

    #[must_use]
    pub fn param_i64(&self, key: &str, default: i64) -> i64 {
        self.param(key)
            .and_then(|v| v.trim().parse::<i64>().ok())
            .unwrap_or(default)
    }

    /// Reads a millisecond count. Negative or unparsable values fall back to
    /// `default`.
    #[must_use]
    pub fn param_duration_ms(&self, key: &str, default: Duration) -> Duration {
        self.param(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_millis)
    }

    /// `methods.<method>.<key>`, falling back to the service-level `key`.
    #[must_use]
    pub fn method_param(&self, method: &str, key: &str) -> Option<&str> {
        self.params
            .get(&format!("methods.{method}.{key}"))
            .or_else(|| self.params.get(key))
            .map(String::as_str)
    }

    #[must_use]
    pub fn method_param_i64(&self, method: &str, key: &str, default: i64) -> i64 {
        self.method_param(method, key)
            .and_then(|v| v.trim().parse::<i64>().ok())
            .unwrap_or(default)
    }

    /// Per-call timeout: `methods.<m>.timeout`, then `timeout`, in ms.
    #[must_use]
    pub fn method_timeout(&self, method: &str) -> Duration {
        self.method_param(method, TIMEOUT_KEY)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(DEFAULT_TIMEOUT, Duration::from_millis)
    }

    /// The `interface` param, or the path.
    #[must_use]
    pub fn interface(&self) -> &str {
        self.param(INTERFACE_KEY)
            .filter(|i| !i.is_empty())
            .unwrap_or_else(|| self.path.trim_start_matches('/'))
    }

    #[must_use]
    pub fn group(&self) -> &str {
        self.param(GROUP_KEY).unwrap_or("")
    }

    #[must_use]
    pub fn version(&self) -> &str {
        self.param(VERSION_KEY).unwrap_or("")
    }

    /// `group/path:version`, the key exporters register under.
    #[must_use]
    pub fn service_key(&self) -> String {
        dubbo_proto::service_key(self.group(), self.interface(), self.version())
    }

    /// `interface:version:group`, used by the auth signature.
    ///
    /// The version segment is empty for `0.0.0`.
    #[must_use]
    pub fn colon_separated_key(&self) -> String {
        let version = self.version();
        let version = if version == "0.0.0" { "" } else { version };
        format!("{}:{}:{}", self.interface(), version, self.group())
    }

    /// Identity of the provider endpoint: `protocol://host:port/path`.
    #[must_use]
    pub fn key(&self) -> String {
        format!(
            "{}://{}/{}",
            self.protocol,
            self.address(),
            self.path.trim_start_matches('/')
        )
    }
}

impl FromStr for Url {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())?;
        let mut sep = '?';
        for (k, v) in &self.params {
            write!(f, "{sep}{}={}", percent_encode(k), percent_encode(v))?;
            sep = '&';
        }
        Ok(())
    }
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let decoded = match (bytes[i], bytes.get(i + 1), bytes.get(i + 2)) {
            (b'%', Some(&hi), Some(&lo)) => hex_value(hi).zip(hex_value(lo)),
            _ => None,
        };
        match decoded {
            Some((hi, lo)) => {
                out.push((hi << 4) | lo);
                i += 3;
            }
            None => {
                out.push(if bytes[i] == b'+' { b' ' } else { bytes[i] });
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

const fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn percent_encode(input: &str) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(input.len());
    for b in input.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~' | b',' | b':') {
            out.push(char::from(b));
        } else {
            let _ = write!(out, "%{b:02X}");
        }
    }
    out
}
