//! Configuration loading and management.
//!
//! This module provides layered configuration for the extension using figment.
//! Configuration is loaded from (in order of priority):
//! 1. Default values (compiled in)
//! 2. Config file: `/var/task/telemetry-extension.toml` (optional)
//! 3. Lambda environment variables (`AWS_LAMBDA_RUNTIME_API`, `AWS_SAM_LOCAL`)
//! 4. Extension-specific environment variables (`TELEMETRY_EXTENSION_*`)
//!
//! # Supported Environment Variables
//!
//! | Variable | Config Path | Default |
//! |----------|-------------|---------|
//! | `TELEMETRY_EXTENSION_ENABLED` | `enabled` | `false` |
//! | `AWS_LAMBDA_RUNTIME_API` | `runtime_api` | `127.0.0.1:9001` |
//! | `AWS_SAM_LOCAL` | `listener.host` = `0.0.0.0` | unset |
//! | `TELEMETRY_EXTENSION_SUBSCRIBE_EVENTS` | `subscribe_events` | `function` |
//! | `TELEMETRY_EXTENSION_FLUENTD_ENABLED` | `fluentd.enabled` | `false` |
//! | `TELEMETRY_EXTENSION_FLUENTD_HOST` | `fluentd.host` | required |
//! | `TELEMETRY_EXTENSION_FLUENTD_PORT` | `fluentd.port` | `24224` |
//! | `TELEMETRY_EXTENSION_FLUENTD_TAG_NAME` | `fluentd.tag_name` | `lambda` |
//! | `TELEMETRY_EXTENSION_FLUENTD_TLS` | `fluentd.tls` | `true` |
//! | `TELEMETRY_EXTENSION_FLUENTD_TLS_INSECURE_SKIP_VERIFY` | `fluentd.tls_insecure_skip_verify` | `true` |
//! | `TELEMETRY_EXTENSION_FLUENTD_TLS_CA_FILE` | `fluentd.tls_ca_file` | unset |
//! | `TELEMETRY_EXTENSION_FLUENTD_CONNECT_TIMEOUT` | `fluentd.connect_timeout` (ms) | `3000` |
//! | `TELEMETRY_EXTENSION_LISTENER_HOST` | `listener.host` | `sandbox` |
//! | `TELEMETRY_EXTENSION_LISTENER_PORT` | `listener.port` | `4323` |
//!
//! Boolean flags accept a boolean or a string equal to `true` ignoring case.
//! String settings keep numeric values as text. Empty variables are ignored.

use crate::error::Result;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the optional config file inside the function package.
pub const DEFAULT_CONFIG_PATH: &str = "/var/task/telemetry-extension.toml";
const ENV_PREFIX: &str = "TELEMETRY_EXTENSION_";
const DEFAULT_RUNTIME_API: &str = "127.0.0.1:9001";

/// Host the listener binds to inside the Lambda execution environment.
pub const SANDBOX_HOST: &str = "sandbox";
const ALL_INTERFACES: &str = "0.0.0.0";

/// Main configuration struct for the extension.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Whether the extension should run at all.
    #[serde(deserialize_with = "flag::deserialize")]
    pub enabled: bool,
    /// Authority of the Lambda host APIs (`host:port`, scheme optional).
    pub runtime_api: String,
    /// Comma-separated Telemetry API event types to subscribe to.
    #[serde(deserialize_with = "text::deserialize")]
    pub subscribe_events: String,
    /// Telemetry listener configuration.
    pub listener: ListenerConfig,
    /// Fluentd writer configuration.
    pub fluentd: FluentdConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: false,
            runtime_api: DEFAULT_RUNTIME_API.to_string(),
            subscribe_events: String::new(),
            listener: ListenerConfig::default(),
            fluentd: FluentdConfig::default(),
        }
    }
}

impl Config {
    /// Loads configuration from all sources.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration parsing fails.
    pub fn load() -> Result<Self> {
        Self::load_from_path(DEFAULT_CONFIG_PATH)
    }

    /// Loads configuration from a custom config file path.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration parsing fails.
    pub fn load_from_path<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        Ok(figment(config_path).extract()?)
    }

    /// Reads only the enable flag.
    ///
    /// Other values are not extracted, so a disabled extension never fails on
    /// malformed settings it would not use.
    ///
    /// # Errors
    ///
    /// Returns an error if the enable flag itself cannot be parsed.
    pub fn is_enabled() -> Result<bool> {
        Self::is_enabled_from_path(DEFAULT_CONFIG_PATH)
    }

    /// Reads only the enable flag, using a custom config file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the enable flag itself cannot be parsed.
    pub fn is_enabled_from_path<P: AsRef<Path>>(config_path: P) -> Result<bool> {
        #[derive(Deserialize)]
        struct EnableFlag {
            #[serde(default, deserialize_with = "flag::deserialize")]
            enabled: bool,
        }

        let flag: EnableFlag = figment(config_path).extract()?;
        Ok(flag.enabled)
    }

    /// Returns the host API base URL, adding `http://` when no scheme is present.
    pub fn runtime_api_url(&self) -> String {
        let authority = self.runtime_api.trim().trim_end_matches('/');
        if authority.starts_with("http") {
            authority.to_string()
        } else {
            format!("http://{authority}")
        }
    }

    /// Creates a new config builder for testing.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }
}

/// Telemetry listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Host to bind to; also used in the subscription URI.
    pub host: String,
    /// Port to bind to (default 4323). Port 0 picks a free port.
    pub port: u16,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            host: SANDBOX_HOST.to_string(),
            port: 4323,
        }
    }
}

/// Fluentd writer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FluentdConfig {
    /// Whether the Fluentd writer is enabled.
    #[serde(deserialize_with = "flag::deserialize")]
    pub enabled: bool,
    /// Collector host. Required when the writer is enabled.
    #[serde(deserialize_with = "text::deserialize_option")]
    pub host: Option<String>,
    /// Collector port (default 24224).
    pub port: u16,
    /// Tag attached to every forwarded record.
    #[serde(deserialize_with = "text::deserialize")]
    pub tag_name: String,
    /// Wrap the connection in TLS.
    #[serde(deserialize_with = "flag::deserialize")]
    pub tls: bool,
    /// Accept any server certificate.
    #[serde(deserialize_with = "flag::deserialize")]
    pub tls_insecure_skip_verify: bool,
    /// PEM bundle of trusted CAs, used when verification is enabled.
    pub tls_ca_file: Option<PathBuf>,
    /// Connect timeout in milliseconds.
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
}

impl Default for FluentdConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: None,
            port: 24224,
            tag_name: "lambda".to_string(),
            tls: true,
            tls_insecure_skip_verify: true,
            tls_ca_file: None,
            connect_timeout: Duration::from_secs(3),
        }
    }
}

/// Builder for constructing configuration programmatically.
#[must_use = "builders do nothing unless .build() is called"]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Creates a new config builder with default values.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Enables or disables the extension.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.config.enabled = enabled;
        self
    }

    /// Sets the host API authority.
    pub fn runtime_api(mut self, runtime_api: impl Into<String>) -> Self {
        self.config.runtime_api = runtime_api.into();
        self
    }

    /// Sets the comma-separated subscription event types.
    pub fn subscribe_events(mut self, events: impl Into<String>) -> Self {
        self.config.subscribe_events = events.into();
        self
    }

    /// Sets the listener host.
    pub fn listener_host(mut self, host: impl Into<String>) -> Self {
        self.config.listener.host = host.into();
        self
    }

    /// Sets the listener port.
    pub fn listener_port(mut self, port: u16) -> Self {
        self.config.listener.port = port;
        self
    }

    /// Enables the Fluentd writer for the given collector.
    pub fn fluentd(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.fluentd.enabled = true;
        self.config.fluentd.host = Some(host.into());
        self.config.fluentd.port = port;
        self
    }

    /// Sets the Fluentd tag.
    pub fn fluentd_tag(mut self, tag: impl Into<String>) -> Self {
        self.config.fluentd.tag_name = tag.into();
        self
    }

    /// Enables or disables TLS on the Fluentd connection.
    pub fn fluentd_tls(mut self, tls: bool) -> Self {
        self.config.fluentd.tls = tls;
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn figment<P: AsRef<Path>>(config_path: P) -> Figment {
    let mut figment = Figment::from(Serialized::defaults(Config::default()));

    if config_path.as_ref().exists() {
        figment = figment.merge(Toml::file(config_path));
    }

    figment
        .merge(lambda_env())
        .merge(
            Env::prefixed(ENV_PREFIX)
                .filter(|key| has_value(key.as_str()))
                .map(|key| nest_section(key.as_str()).into()),
        )
}

/// Empty variables are treated as unset so the lower layers apply.
fn has_value(key: &str) -> bool {
    std::env::var_os(format!("{ENV_PREFIX}{key}")).is_some_and(|value| !value.is_empty())
}

/// Maps `fluentd_tag_name` to `fluentd.tag_name` so section keys nest.
fn nest_section(key: &str) -> String {
    let key = key.to_ascii_lowercase();
    for section in ["fluentd", "listener"] {
        if let Some(rest) = key.strip_prefix(section).and_then(|k| k.strip_prefix('_')) {
            return format!("{section}.{rest}");
        }
    }
    key
}

/// Partial listener config for `AWS_SAM_LOCAL` overrides.
#[derive(Debug, Default, Serialize)]
struct PartialListenerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    host: Option<String>,
}

/// Partial config for Lambda environment overrides.
#[derive(Debug, Default, Serialize)]
struct PartialConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    runtime_api: Option<String>,
    #[serde(skip_serializing_if = "is_partial_listener_empty")]
    listener: PartialListenerConfig,
}

fn is_partial_listener_empty(config: &PartialListenerConfig) -> bool {
    config.host.is_none()
}

fn lambda_env() -> Serialized<PartialConfig> {
    let mut config = PartialConfig::default();

    if let Ok(runtime_api) = std::env::var("AWS_LAMBDA_RUNTIME_API") {
        if !runtime_api.is_empty() {
            config.runtime_api = Some(runtime_api);
        }
    }

    if std::env::var("AWS_SAM_LOCAL").is_ok_and(|local| local == "true") {
        config.listener.host = Some(ALL_INTERFACES.to_string());
    }

    Serialized::defaults(config)
}

mod flag {
    use serde::Deserializer;
    use serde::de::{self, Visitor};
    use std::fmt;

    /// Accepts a boolean, or a string that equals `true` ignoring case.
    /// Any other value reads as `false`.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<bool, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(FlagVisitor)
    }

    struct FlagVisitor;

    impl Visitor<'_> for FlagVisitor {
        type Value = bool;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a boolean flag")
        }

        fn visit_bool<E: de::Error>(self, value: bool) -> Result<bool, E> {
            Ok(value)
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<bool, E> {
            Ok(value.trim().eq_ignore_ascii_case("true"))
        }

        fn visit_i64<E: de::Error>(self, _: i64) -> Result<bool, E> {
            Ok(false)
        }

        fn visit_u64<E: de::Error>(self, _: u64) -> Result<bool, E> {
            Ok(false)
        }

        fn visit_f64<E: de::Error>(self, _: f64) -> Result<bool, E> {
            Ok(false)
        }

        fn visit_unit<E: de::Error>(self) -> Result<bool, E> {
            Ok(false)
        }
    }
}

mod text {
    use serde::de::{self, Visitor};
    use serde::{Deserialize, Deserializer};
    use std::fmt;

    /// Accepts a string, or a number or boolean rendered as text.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<String, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(TextVisitor)
    }

    pub fn deserialize_option<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<Text>::deserialize(deserializer)?.map(|text| text.0))
    }

    struct Text(String);

    impl<'de> Deserialize<'de> for Text {
        fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            deserialize(deserializer).map(Text)
        }
    }

    struct TextVisitor;

    impl Visitor<'_> for TextVisitor {
        type Value = String;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a string")
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<String, E> {
            Ok(value.to_string())
        }

        fn visit_string<E: de::Error>(self, value: String) -> Result<String, E> {
            Ok(value)
        }

        fn visit_bool<E: de::Error>(self, value: bool) -> Result<String, E> {
            Ok(value.to_string())
        }

        fn visit_i64<E: de::Error>(self, value: i64) -> Result<String, E> {
            Ok(value.to_string())
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> Result<String, E> {
            Ok(value.to_string())
        }

        fn visit_f64<E: de::Error>(self, value: f64) -> Result<String, E> {
            Ok(value.to_string())
        }

        fn visit_char<E: de::Error>(self, value: char) -> Result<String, E> {
            Ok(value.to_string())
        }

        fn visit_unit<E: de::Error>(self) -> Result<String, E> {
            Ok(String::new())
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}
