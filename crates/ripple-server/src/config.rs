//! Server configuration.
//!
//! Configuration is layered with the `config` crate:
//! - The first of `ripple.toml`, `/etc/ripple/ripple.toml` or
//!   `~/.config/ripple/ripple.toml` that exists
//! - Environment variables (`RIPPLE__PORT`, `RIPPLE__AUTH__JWT_SECRET`, ...)

use anyhow::{bail, Context, Result};
use ripple_core::ProviderKind;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_PATHS: [&str; 3] = [
    "ripple.toml",
    "/etc/ripple/ripple.toml",
    "~/.config/ripple/ripple.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub realtime: RealtimeConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub external: ExternalConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Socket namespace, providers and per-connection limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default = "default_primary")]
    pub primary: ProviderKind,

    /// Used only when that provider is available.
    #[serde(default = "default_fallback")]
    pub fallback: Option<ProviderKind>,

    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    #[serde(default = "default_max_tables")]
    pub max_tables_per_connection: usize,

    /// Provider health check interval in milliseconds.
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_ms: u64,
}

/// Session registry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_session_ttl")]
    pub ttl_secs: u64,

    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Redis URL. The in-memory store is used when unset.
    #[serde(default)]
    pub redis_url: Option<String>,

    /// How often the in-memory store drops expired keys, in milliseconds.
    #[serde(default = "default_purge_interval")]
    pub purge_interval_ms: u64,
}

/// Token verification settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HS256 shared secret.
    #[serde(default)]
    pub jwt_secret: String,

    #[serde(default)]
    pub issuer: Option<String>,

    #[serde(default)]
    pub audience: Option<String>,
}

/// Upstream change feed settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Realtime endpoint, e.g. `wss://host/realtime/v1`.
    #[serde(default)]
    pub url: String,

    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_schema")]
    pub schema: String,

    /// Row field naming the owning user.
    #[serde(default = "default_owner_field")]
    pub owner_field: String,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    #[serde(default)]
    pub access_token: Option<String>,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_namespace() -> String {
    ripple_transport::gateway::DEFAULT_NAMESPACE.to_string()
}

fn default_primary() -> ProviderKind {
    ProviderKind::Local
}

fn default_fallback() -> Option<ProviderKind> {
    Some(ProviderKind::External)
}

fn default_max_reconnect_attempts() -> u32 {
    ripple_transport::gateway::DEFAULT_MAX_RECONNECT_ATTEMPTS
}

fn default_max_tables() -> usize {
    ripple_transport::gateway::DEFAULT_MAX_TABLES
}

fn default_health_check_interval() -> u64 {
    30_000
}

fn default_session_ttl() -> u64 {
    ripple_core::registry::DEFAULT_SESSION_TTL.as_secs()
}

fn default_key_prefix() -> String {
    ripple_core::registry::DEFAULT_KEY_PREFIX.to_string()
}

fn default_purge_interval() -> u64 {
    60_000
}

fn default_schema() -> String {
    "public".to_string()
}

fn default_owner_field() -> String {
    ripple_transport::external::DEFAULT_OWNER_FIELD.to_string()
}

fn default_heartbeat_interval() -> u64 {
    25_000
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            realtime: RealtimeConfig::default(),
            session: SessionConfig::default(),
            auth: AuthConfig::default(),
            external: ExternalConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            primary: default_primary(),
            fallback: default_fallback(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            max_tables_per_connection: default_max_tables(),
            health_check_interval_ms: default_health_check_interval(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_session_ttl(),
            key_prefix: default_key_prefix(),
            redis_url: None,
            purge_interval_ms: default_purge_interval(),
        }
    }
}

impl Default for ExternalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            api_key: String::new(),
            schema: default_schema(),
            owner_field: default_owner_field(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            access_token: None,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from the first config file found and the
    /// environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be read or the result is invalid.
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();

        for path in &CONFIG_PATHS {
            let expanded = shellexpand::tilde(path);
            let path = PathBuf::from(expanded.as_ref());
            if path.exists() {
                builder = builder.add_source(config::File::from(path));
                break;
            }
        }

        let config: Config = builder
            .add_source(
                config::Environment::with_prefix("RIPPLE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to load configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Check settings that have no usable default.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.auth.jwt_secret.is_empty() {
            bail!("auth.jwt_secret must be set");
        }
        if self.external.enabled && self.external.url.is_empty() {
            bail!("external.url must be set when the external provider is enabled");
        }
        if self.realtime.primary == ProviderKind::External && !self.external.enabled {
            bail!("primary provider is external but external.enabled is false");
        }
        if !self.realtime.namespace.starts_with('/') {
            bail!("realtime.namespace must start with '/'");
        }
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    #[must_use]
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.realtime.health_check_interval_ms)
    }

    #[must_use]
    pub fn purge_interval(&self) -> Duration {
        Duration::from_millis(self.session.purge_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.realtime.namespace, "/realtime");
        assert_eq!(config.realtime.primary, ProviderKind::Local);
        assert_eq!(config.realtime.max_reconnect_attempts, 5);
        assert_eq!(config.session.ttl_secs, 86_400);
        assert!(!config.external.enabled);
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        assert_eq!(config.bind_addr().unwrap().port(), 8080);

        let config = Config {
            host: "not a host".into(),
            ..Config::default()
        };
        assert!(config.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [realtime]
            primary = "external"
            fallback = "local"
            max_tables_per_connection = 10

            [auth]
            jwt_secret = "s3cret"

            [external]
            enabled = true
            url = "wss://db.example.com/realtime/v1"
            owner_field = "owner_id"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.realtime.primary, ProviderKind::External);
        assert_eq!(config.realtime.fallback, Some(ProviderKind::Local));
        assert_eq!(config.realtime.max_tables_per_connection, 10);
        assert_eq!(config.external.owner_field, "owner_id");
        assert_eq!(config.external.schema, "public");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate() {
        assert!(Config::default().validate().is_err());

        let mut config = Config::default();
        config.auth.jwt_secret = "s3cret".into();
        assert!(config.validate().is_ok());

        config.realtime.primary = ProviderKind::External;
        assert!(config.validate().is_err());

        config.external.enabled = true;
        assert!(config.validate().is_err());

        config.external.url = "wss://db.example.com/realtime/v1".into();
        assert!(config.validate().is_ok());
    }
}
