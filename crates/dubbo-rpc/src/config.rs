//! Application configuration with layered loading and environment variable
//! interpolation.
//!
//! A TOML file (with `${VAR}` interpolation) is merged with environment
//! variables prefixed `DUBBO_`, using `__` as the nesting separator:
//! `DUBBO_SHUTDOWN__TIMEOUT=30s` overrides `[shutdown] timeout`.
//!
//! References and services convert into [`Url`]s carrying the resolved
//! parameters that invokers, filters and clusters read.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    value::{Dict, Map, Value},
    Error as FigmentError, Figment, Metadata, Profile, Provider,
};
use serde::Deserialize;
use thiserror::Error;

use crate::filter::{ACCESS_KEY_ID_KEY, AUTH_KEY, PARAMETER_SIGNATURE_KEY, SECRET_ACCESS_KEY_KEY};
use crate::url::{
    Url, APPLICATION_KEY, CIRCUIT_TRIPPED_TIMEOUT_FACTOR_KEY, CLUSTER_KEY, FORKS_KEY, GROUP_KEY,
    HEALTH_ROUTE_ENABLED_KEY, INTERFACE_KEY, LOADBALANCE_KEY, OUTSTANDING_REQUEST_LIMIT_KEY,
    REFERENCE_FILTER_KEY, RETRIES_KEY, SERVICE_FILTER_KEY, SUCCESSIVE_FAILED_THRESHOLD_KEY,
    TIMEOUT_KEY, VERSION_KEY,
};

/// Errors that can occur when loading or parsing configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Error from the Figment configuration library.
    #[error("configuration error: {0}")]
    Figment(Box<FigmentError>),

    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// The configuration parsed but is not usable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    #[must_use]
    pub const fn error_type(&self) -> &'static str {
        match self {
            Self::Figment(_) => "figment",
            Self::FileNotFound(_) => "file_not_found",
            Self::Invalid(_) => "invalid",
        }
    }
}

impl From<FigmentError> for ConfigError {
    fn from(err: FigmentError) -> Self {
        Self::Figment(Box::new(err))
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ApplicationConfig {
    #[serde(default)]
    pub application: AppInfo,

    /// Services this process exports. Absent for pure consumers.
    #[serde(default)]
    pub provider: Option<ProviderConfig>,

    /// Remote services this process calls, by name.
    #[serde(default)]
    pub references: HashMap<String, ReferenceConfig>,

    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

impl ApplicationConfig {
    /// Loads configuration from the specified file path.
    ///
    /// Environment variables prefixed with `DUBBO_` override file settings.
    ///
    /// # Errors
    ///
    /// Fails when the file is missing or the merged configuration does not
    /// deserialize.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let figment = Figment::new()
            .merge(InterpolatingToml::file(path)?)
            .merge(Env::prefixed("DUBBO_").split("__"));

        let config = figment.extract::<Self>()?;
        config.validate()?;
        Ok(config)
    }

    /// Parses configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Fails when the content does not deserialize or is invalid.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let figment = Figment::new().merge(InterpolatingToml::string(content));
        let config = figment.extract::<Self>()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (name, reference) in &self.references {
            if reference.urls.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "reference {name} has no provider urls"
                )));
            }
            if reference.interface.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "reference {name} has no interface"
                )));
            }
        }
        if let Some(provider) = &self.provider {
            for (name, service) in &provider.services {
                if service.interface.is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "service {name} has no interface"
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppInfo {
    #[serde(default = "default_application_name")]
    pub name: String,
}

impl Default for AppInfo {
    fn default() -> Self {
        Self {
            name: default_application_name(),
        }
    }
}

fn default_application_name() -> String {
    "dubbo-app".to_owned()
}

/// Provider side: where to listen and what to export.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Provider filter chain, e.g. `"provider_shutdown,auth"`.
    #[serde(default = "default_service_filter")]
    pub filter: String,

    #[serde(default)]
    pub services: HashMap<String, ServiceConfig>,
}

fn default_bind_address() -> String {
    "127.0.0.1:20880".to_owned()
}

fn default_service_filter() -> String {
    "provider_shutdown".to_owned()
}

/// One exported service.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub interface: String,

    #[serde(default)]
    pub version: String,

    #[serde(default)]
    pub group: String,

    #[serde(default)]
    pub auth: AuthConfig,

    /// Extra URL parameters.
    #[serde(default)]
    pub params: HashMap<String, String>,
}

impl ServiceConfig {
    /// Export URL on `provider`'s bind address.
    ///
    /// # Errors
    ///
    /// Fails when the bind address is not `host:port`.
    pub fn to_url(&self, application: &str, provider: &ProviderConfig) -> Result<Url, ConfigError> {
        let mut url = Url::parse(&format!("dubbo://{}/{}", provider.bind_address, self.interface))
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        for (k, v) in &self.params {
            url.set_param(k.clone(), v);
        }
        url.set_param(APPLICATION_KEY, application);
        url.set_param(INTERFACE_KEY, &self.interface);
        set_if_not_empty(&mut url, VERSION_KEY, &self.version);
        set_if_not_empty(&mut url, GROUP_KEY, &self.group);
        set_if_not_empty(&mut url, SERVICE_FILTER_KEY, &provider.filter);
        self.auth.apply(&mut url);
        Ok(url)
    }
}

/// One referenced remote service.
#[derive(Debug, Clone, Deserialize)]
pub struct ReferenceConfig {
    pub interface: String,

    /// Provider URLs, e.g. `dubbo://10.0.0.1:20880`.
    pub urls: Vec<String>,

    #[serde(default)]
    pub version: String,

    #[serde(default)]
    pub group: String,

    #[serde(default = "default_cluster")]
    pub cluster: String,

    #[serde(default = "default_loadbalance")]
    pub loadbalance: String,

    #[serde(default = "default_retries")]
    pub retries: i64,

    #[serde(default = "default_forks")]
    pub forks: i64,

    #[serde(
        default = "default_request_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub timeout: Duration,

    /// Consumer filter chain, e.g. `"consumer_shutdown,active,sign"`.
    #[serde(default = "default_reference_filter")]
    pub filter: String,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub health_check: Option<HealthCheckConfig>,

    /// Extra URL parameters, including `methods.<name>.<key>` overrides.
    #[serde(default)]
    pub params: HashMap<String, String>,
}

fn default_cluster() -> String {
    "failover".to_owned()
}

fn default_loadbalance() -> String {
    "random".to_owned()
}

const fn default_retries() -> i64 {
    2
}

const fn default_forks() -> i64 {
    2
}

const fn default_request_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_reference_filter() -> String {
    "consumer_shutdown,active".to_owned()
}

impl ReferenceConfig {
    /// The consumer URL the cluster reads its settings from.
    #[must_use]
    pub fn consumer_url(&self, application: &str) -> Url {
        let mut url = Url::new("consumer", "127.0.0.1", 0).with_path(self.interface.clone());
        self.apply(&mut url, application);
        url
    }

    /// One URL per provider, with the consumer parameters merged in.
    ///
    /// # Errors
    ///
    /// Fails on a malformed provider URL.
    pub fn provider_urls(&self, application: &str) -> Result<Vec<Url>, ConfigError> {
        self.urls
            .iter()
            .map(|raw| {
                let mut url = Url::parse(raw).map_err(|e| ConfigError::Invalid(e.to_string()))?;
                if url.path().is_empty() {
                    url = url.with_path(self.interface.clone());
                }
                self.apply(&mut url, application);
                Ok(url)
            })
            .collect()
    }

    fn apply(&self, url: &mut Url, application: &str) {
        for (k, v) in &self.params {
            url.set_param(k.clone(), v);
        }
        url.set_param(APPLICATION_KEY, application);
        url.set_param(INTERFACE_KEY, &self.interface);
        set_if_not_empty(url, VERSION_KEY, &self.version);
        set_if_not_empty(url, GROUP_KEY, &self.group);
        url.set_param(CLUSTER_KEY, &self.cluster);
        url.set_param(LOADBALANCE_KEY, &self.loadbalance);
        url.set_param(RETRIES_KEY, self.retries);
        url.set_param(FORKS_KEY, self.forks);
        url.set_param(TIMEOUT_KEY, self.timeout.as_millis());
        set_if_not_empty(url, REFERENCE_FILTER_KEY, &self.filter);
        self.auth.apply(url);
        if let Some(health) = &self.health_check {
            health.apply(url);
        }
    }
}

/// Request signing settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub access_key_id: String,

    #[serde(default)]
    pub secret_access_key: String,

    /// Sign the arguments as well as the method.
    #[serde(default)]
    pub param_sign: bool,
}

impl AuthConfig {
    fn apply(&self, url: &mut Url) {
        if !self.enabled {
            return;
        }
        url.set_param(AUTH_KEY, true);
        set_if_not_empty(url, ACCESS_KEY_ID_KEY, &self.access_key_id);
        set_if_not_empty(url, SECRET_ACCESS_KEY_KEY, &self.secret_access_key);
        if self.param_sign {
            url.set_param(PARAMETER_SIGNATURE_KEY, true);
        }
    }
}

/// Health-aware routing settings.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_successive_failed_threshold")]
    pub successive_failed_threshold: u32,

    #[serde(
        default = "default_circuit_tripped_timeout_factor",
        deserialize_with = "deserialize_duration"
    )]
    pub circuit_tripped_timeout_factor: Duration,

    #[serde(default = "default_outstanding_request_limit")]
    pub outstanding_request_limit: i64,
}

const fn default_true() -> bool {
    true
}

const fn default_successive_failed_threshold() -> u32 {
    5
}

const fn default_circuit_tripped_timeout_factor() -> Duration {
    Duration::from_millis(1000)
}

const fn default_outstanding_request_limit() -> i64 {
    i32::MAX as i64
}

impl HealthCheckConfig {
    fn apply(&self, url: &mut Url) {
        url.set_param(HEALTH_ROUTE_ENABLED_KEY, self.enabled);
        url.set_param(
            SUCCESSIVE_FAILED_THRESHOLD_KEY,
            self.successive_failed_threshold,
        );
        url.set_param(
            CIRCUIT_TRIPPED_TIMEOUT_FACTOR_KEY,
            self.circuit_tripped_timeout_factor.as_millis(),
        );
        url.set_param(OUTSTANDING_REQUEST_LIMIT_KEY, self.outstanding_request_limit);
    }
}

/// Graceful shutdown settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownConfig {
    /// Time to wait for in-flight requests to drain.
    #[serde(
        default = "default_shutdown_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout: default_shutdown_timeout(),
        }
    }
}

const fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(60)
}

fn set_if_not_empty(url: &mut Url, key: &str, value: &str) {
    if !value.is_empty() {
        url.set_param(key, value);
    }
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_duration(&s).map_err(serde::de::Error::custom)
}

/// Parses `"100ms"`, `"30s"`, `"5m"` or a bare number of seconds.
///
/// # Errors
///
/// Returns a description of the malformed input.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let number = |digits: &str| {
        digits
            .trim()
            .parse::<u64>()
            .map_err(|_| format!("invalid duration: {s}"))
    };
    if let Some(stripped) = s.strip_suffix("ms") {
        Ok(Duration::from_millis(number(stripped)?))
    } else if let Some(stripped) = s.strip_suffix('s') {
        Ok(Duration::from_secs(number(stripped)?))
    } else if let Some(stripped) = s.strip_suffix('m') {
        Ok(Duration::from_secs(number(stripped)?.saturating_mul(60)))
    } else {
        Ok(Duration::from_secs(number(s)?))
    }
}

fn interpolate(value: Value) -> Value {
    match value {
        Value::String(_, s) => Value::from(expand_env(&s)),
        Value::Dict(tag, dict) => Value::Dict(tag, interpolate_dict(dict)),
        Value::Array(tag, items) => {
            Value::Array(tag, items.into_iter().map(interpolate).collect())
        }
        other => other,
    }
}

fn interpolate_dict(dict: Dict) -> Dict {
    dict.into_iter().map(|(k, v)| (k, interpolate(v))).collect()
}

/// Expands `${VAR}` and `${VAR:-fallback}`. Unset variables without a
/// fallback expand to nothing; an unterminated `${` is kept as written.
fn expand_env(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(open) = rest.find("${") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let Some(close) = after.find('}') else {
            out.push_str(&rest[open..]);
            return out;
        };
        let (name, fallback) = match after[..close].split_once(":-") {
            Some((name, fallback)) => (name, Some(fallback)),
            None => (&after[..close], None),
        };
        match std::env::var(name) {
            Ok(value) if !value.is_empty() => out.push_str(&value),
            _ => out.push_str(fallback.unwrap_or_default()),
        }
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    out
}

/// TOML provider that expands `${VAR}` and `${VAR:-fallback}` in string
/// values.
pub struct InterpolatingToml {
    content: String,
}

impl InterpolatingToml {
    /// # Errors
    ///
    /// Fails when the file cannot be read.
    pub fn file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|_| ConfigError::FileNotFound(path.as_ref().display().to_string()))?;
        Ok(Self { content })
    }

    pub fn string(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }
}

impl Provider for InterpolatingToml {
    fn metadata(&self) -> Metadata {
        Metadata::named("Interpolating TOML")
    }

    fn data(&self) -> Result<Map<Profile, Dict>, FigmentError> {
        let profiles = Toml::string(&self.content).data()?;
        Ok(profiles
            .into_iter()
            .map(|(profile, dict)| (profile, interpolate_dict(dict)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("30s", Duration::from_secs(30))]
    #[case("100ms", Duration::from_millis(100))]
    #[case("5m", Duration::from_secs(300))]
    #[case("60", Duration::from_secs(60))]
    #[case(" 2 s ", Duration::from_secs(2))]
    fn parses_durations(#[case] input: &str, #[case] expected: Duration) {
        assert_eq!(parse_duration(input), Ok(expected));
    }

    #[rstest]
    #[case("soon")]
    #[case("-1s")]
    #[case("")]
    fn rejects_bad_durations(#[case] input: &str) {
        assert!(parse_duration(input).is_err());
    }

    #[test]
    fn config_from_string() {
        let config = ApplicationConfig::parse(
            r#"
            [application]
            name = "shop"

            [provider]
            bind_address = "0.0.0.0:20000"
            filter = "provider_shutdown,auth"

            [provider.services.greeter]
            interface = "org.example.Greeter"
            version = "1.0.0"
            auth = { enabled = true, access_key_id = "ak", secret_access_key = "sk" }

            [references.greeter]
            interface = "org.example.Greeter"
            version = "1.0.0"
            urls = ["dubbo://10.0.0.1:20000", "dubbo://10.0.0.2:20000/org.example.Greeter"]
            cluster = "forking"
            loadbalance = "roundrobin"
            retries = 4
            timeout = "250ms"
            filter = "consumer_shutdown,active,sign"
            health_check = { successive_failed_threshold = 3, circuit_tripped_timeout_factor = "200ms" }
            params = { "methods.greet.retries" = "0" }

            [shutdown]
            timeout = "15s"
            "#,
        )
        .unwrap();

        assert_eq!(config.application.name, "shop");
        assert_eq!(config.shutdown.timeout, Duration::from_secs(15));

        let reference = &config.references["greeter"];
        let urls = reference.provider_urls("shop").unwrap();
        assert_eq!(urls.len(), 2);
        let url = &urls[0];
        assert_eq!(url.address(), "10.0.0.1:20000");
        assert_eq!(url.path(), "org.example.Greeter");
        assert_eq!(url.service_key(), "org.example.Greeter:1.0.0");
        assert_eq!(url.param(CLUSTER_KEY), Some("forking"));
        assert_eq!(url.param(LOADBALANCE_KEY), Some("roundrobin"));
        assert_eq!(url.method_param_i64("greet", RETRIES_KEY, 2), 0);
        assert_eq!(url.method_param_i64("other", RETRIES_KEY, 2), 4);
        assert_eq!(url.method_timeout("greet"), Duration::from_millis(250));
        assert_eq!(url.param(HEALTH_ROUTE_ENABLED_KEY), Some("true"));
        assert_eq!(url.param(SUCCESSIVE_FAILED_THRESHOLD_KEY), Some("3"));
        assert_eq!(url.param(CIRCUIT_TRIPPED_TIMEOUT_FACTOR_KEY), Some("200"));
        assert_eq!(url.param(APPLICATION_KEY), Some("shop"));

        let consumer = reference.consumer_url("shop");
        assert_eq!(consumer.protocol(), "consumer");
        assert_eq!(consumer.param(REFERENCE_FILTER_KEY), Some("consumer_shutdown,active,sign"));

        let provider = config.provider.as_ref().unwrap();
        let export = provider.services["greeter"].to_url("shop", provider).unwrap();
        assert_eq!(export.address(), "0.0.0.0:20000");
        assert_eq!(export.param(SERVICE_FILTER_KEY), Some("provider_shutdown,auth"));
        assert_eq!(export.param(AUTH_KEY), Some("true"));
        assert_eq!(export.param(ACCESS_KEY_ID_KEY), Some("ak"));
        assert_eq!(export.colon_separated_key(), url.colon_separated_key());
    }

    #[test]
    fn config_defaults() {
        let config = ApplicationConfig::parse(
            r#"
            [references.echo]
            interface = "org.example.Echo"
            urls = ["dubbo://127.0.0.1:20880"]
            "#,
        )
        .unwrap();

        assert_eq!(config.application.name, "dubbo-app");
        assert!(config.provider.is_none());
        assert_eq!(config.shutdown.timeout, Duration::from_secs(60));

        let reference = &config.references["echo"];
        assert_eq!(reference.cluster, "failover");
        assert_eq!(reference.loadbalance, "random");
        assert_eq!(reference.retries, 2);
        assert_eq!(reference.forks, 2);
        assert_eq!(reference.timeout, Duration::from_secs(3));
        assert!(!reference.auth.enabled);

        let url = &reference.provider_urls("dubbo-app").unwrap()[0];
        assert_eq!(url.param(AUTH_KEY), None);
        assert_eq!(url.param(HEALTH_ROUTE_ENABLED_KEY), None);
        assert_eq!(url.param(TIMEOUT_KEY), Some("3000"));
    }

    #[test]
    fn health_check_defaults() {
        let config = ApplicationConfig::parse(
            r#"
            [references.echo]
            interface = "org.example.Echo"
            urls = ["dubbo://127.0.0.1:20880"]
            [references.echo.health_check]
            "#,
        )
        .unwrap();
        let health = config.references["echo"].health_check.clone().unwrap();
        assert!(health.enabled);
        assert_eq!(health.successive_failed_threshold, 5);
        assert_eq!(health.circuit_tripped_timeout_factor, Duration::from_secs(1));
        assert_eq!(health.outstanding_request_limit, i64::from(i32::MAX));
    }

    #[rstest]
    #[case::no_urls(
        r#"
        [references.echo]
        interface = "org.example.Echo"
        urls = []
        "#
    )]
    #[case::no_interface(
        r#"
        [references.echo]
        interface = ""
        urls = ["dubbo://127.0.0.1:1"]
        "#
    )]
    fn invalid_references_are_rejected(#[case] content: &str) {
        assert!(matches!(
            ApplicationConfig::parse(content),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn interpolates_environment() {
        assert_eq!(expand_env("${DUBBO_TEST_SURELY_UNSET_VAR}-x"), "-x");
        assert_eq!(
            expand_env("${DUBBO_TEST_SURELY_UNSET_VAR:-127.0.0.1}:20880"),
            "127.0.0.1:20880"
        );
        assert_eq!(expand_env("left ${unterminated"), "left ${unterminated");
        let path = std::env::var("PATH").unwrap_or_default();
        assert_eq!(expand_env("${PATH}"), path);
    }

    #[test]
    fn missing_file() {
        let err = ApplicationConfig::load_from("/nonexistent/dubbo.toml").unwrap_err();
        assert_eq!(err.error_type(), "file_not_found");
    }
}
