/// Per-session transport configuration
///
/// Immutable once an adapter is built from it. Loadable from JSON, from a
/// `raknet://host:port?...` URL, and overridable from the environment.

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::TransportError;
use crate::protocol::version::GameVersion;

/// Server connection limit when none is configured
pub const DEFAULT_MAX_CONNECTIONS: usize = 3;
/// Default game port
pub const DEFAULT_PORT: u16 = 19132;
/// Handshake / idle deadline
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Environment variable overriding the backend identifier
pub const BACKEND_ENV: &str = "RAKLINK_BACKEND";
/// Environment variable toggling worker offload (`1`/`true`)
pub const WORKERS_ENV: &str = "RAKLINK_USE_WORKERS";

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub host: String,
    pub port: u16,
    /// Game version, decides the transport protocol id
    pub version: GameVersion,
    pub max_connections: usize,
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,
    /// Backend identifier, `None` lets the registry pick
    pub backend: Option<String>,
    /// Run client socket I/O on a dedicated worker thread
    pub use_workers: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            version: GameVersion::default(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            timeout: DEFAULT_TIMEOUT,
            backend: None,
            use_workers: false,
        }
    }
}

impl TransportConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn with_version(mut self, version: GameVersion) -> Self {
        self.version = version;
        self
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    pub fn with_workers(mut self, use_workers: bool) -> Self {
        self.use_workers = use_workers;
        self
    }

    /// Transport protocol id derived from the game version
    pub fn protocol_version(&self) -> u8 {
        self.version.protocol_version()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::MissingRequiredField {
                field: "host".to_string(),
                suggestion: "set a host name or IP address such as '127.0.0.1'".to_string(),
            });
        }

        if self.max_connections == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_connections".to_string(),
                value: "0".to_string(),
                reason: "must be > 0".to_string(),
                suggestion: format!("leave unset for the default of {}", DEFAULT_MAX_CONNECTIONS),
            });
        }

        if self.timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "timeout_ms".to_string(),
                value: "0".to_string(),
                reason: "must be > 0".to_string(),
                suggestion: "set a positive value".to_string(),
            });
        }

        Ok(())
    }

    /// Resolve `host:port` to a socket address
    pub async fn resolve(&self) -> Result<SocketAddr, TransportError> {
        if let Ok(ip) = self.host.parse::<std::net::IpAddr>() {
            return Ok(SocketAddr::new(ip, self.port));
        }
        let mut addrs = tokio::net::lookup_host((self.host.as_str(), self.port)).await?;
        addrs.next().ok_or_else(|| {
            TransportError::from(ConfigError::InvalidAddress {
                address: format!("{}:{}", self.host, self.port),
                reason: "host did not resolve to any address".to_string(),
                source: None,
            })
        })
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json).map_err(|e| ConfigError::InvalidValue {
            field: "<document>".to_string(),
            value: json.chars().take(64).collect(),
            reason: e.to_string(),
            suggestion: "check the JSON field names and types".to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Parse `raknet://host:port?backend=udp&workers=true&version=1.21.50&max_connections=10&timeout_ms=5000`
    pub fn from_url(input: &str) -> Result<Self, ConfigError> {
        let url = url::Url::parse(input).map_err(|e| ConfigError::InvalidAddress {
            address: input.to_string(),
            reason: format!("Invalid URL: {}", e),
            source: Some(Box::new(e)),
        })?;

        let host = url.host_str().ok_or_else(|| ConfigError::MissingRequiredField {
            field: "host".to_string(),
            suggestion: "use a URL like 'raknet://127.0.0.1:19132'".to_string(),
        })?;
        // url keeps the brackets around IPv6 hosts
        let host = host.trim_start_matches('[').trim_end_matches(']');

        let mut config = Self::new(host, url.port().unwrap_or(DEFAULT_PORT));
        for (key, value) in url.query_pairs() {
            let invalid = |reason: &str| ConfigError::InvalidValue {
                field: key.to_string(),
                value: value.to_string(),
                reason: reason.to_string(),
                suggestion: "see TransportConfig for accepted values".to_string(),
            };
            match key.as_ref() {
                "backend" => config.backend = Some(value.to_string()),
                "workers" => config.use_workers = parse_flag(&value).ok_or_else(|| invalid("expected a boolean"))?,
                "version" => config.version = value.parse()?,
                "max_connections" => {
                    config.max_connections = value.parse().map_err(|_| invalid("expected an integer"))?
                }
                "timeout_ms" => {
                    config.timeout = Duration::from_millis(value.parse().map_err(|_| invalid("expected milliseconds"))?)
                }
                other => tracing::debug!("[CONFIG] ignoring unknown URL parameter '{}'", other),
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Apply `RAKLINK_BACKEND` / `RAKLINK_USE_WORKERS` overrides
    pub fn from_env(mut self) -> Self {
        if let Ok(backend) = std::env::var(BACKEND_ENV) {
            if !backend.trim().is_empty() {
                tracing::debug!("[CONFIG] backend '{}' selected from {}", backend, BACKEND_ENV);
                self.backend = Some(backend.trim().to_string());
            }
        }
        if let Ok(flag) = std::env::var(WORKERS_ENV) {
            match parse_flag(&flag) {
                Some(use_workers) => self.use_workers = use_workers,
                None => tracing::warn!("[CONFIG] ignoring {}={:?}: expected a boolean", WORKERS_ENV, flag),
            }
        }
        self
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid address '{address}': {reason}")]
    InvalidAddress {
        address: String,
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Missing required field '{field}'\nSuggestion: {suggestion}")]
    MissingRequiredField {
        field: String,
        suggestion: String,
    },

    #[error("Invalid value for '{field}': {value}\nReason: {reason}\nSuggestion: {suggestion}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
        suggestion: String,
    },
}

impl ConfigError {
    pub fn field(&self) -> &str {
        match self {
            ConfigError::InvalidAddress { .. } => "host",
            ConfigError::MissingRequiredField { field, .. } | ConfigError::InvalidValue { field, .. } => field,
        }
    }
}

impl From<ConfigError> for TransportError {
    fn from(error: ConfigError) -> Self {
        TransportError::config_error(error.field().to_string(), error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::version::{CURRENT_PROTOCOL, LEGACY_PROTOCOL};

    #[test]
    fn test_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(config.max_connections, 3);
        assert_eq!(config.port, 19132);
        assert_eq!(config.protocol_version(), CURRENT_PROTOCOL);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let err = TransportConfig::default().with_max_connections(0).validate().unwrap_err();
        assert_eq!(err.field(), "max_connections");

        let err = TransportConfig::default().with_timeout(Duration::ZERO).validate().unwrap_err();
        assert_eq!(err.field(), "timeout_ms");

        let err = TransportConfig::new(" ", 1).validate().unwrap_err();
        assert_eq!(err.field(), "host");
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config = TransportConfig::from_json(r#"{"host":"10.0.0.2","version":"1.19.20","timeout_ms":2500}"#).unwrap();
        assert_eq!(config.host, "10.0.0.2");
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.timeout, Duration::from_millis(2500));
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(config.protocol_version(), LEGACY_PROTOCOL);

        assert!(TransportConfig::from_json(r#"{"version":"one"}"#).is_err());
    }

    #[test]
    fn test_from_url() {
        let config =
            TransportConfig::from_url("raknet://play.example.net:19133?backend=memory&workers=yes&max_connections=12")
                .unwrap();
        assert_eq!(config.host, "play.example.net");
        assert_eq!(config.port, 19133);
        assert_eq!(config.backend.as_deref(), Some("memory"));
        assert!(config.use_workers);
        assert_eq!(config.max_connections, 12);

        let v6 = TransportConfig::from_url("raknet://[::1]").unwrap();
        assert_eq!(v6.host, "::1");
        assert_eq!(v6.port, DEFAULT_PORT);

        assert!(TransportConfig::from_url("raknet://host?workers=maybe").is_err());
        assert!(TransportConfig::from_url("not a url").is_err());
    }

    #[test]
    fn test_config_error_converts() {
        let err: TransportError = TransportConfig::default()
            .with_max_connections(0)
            .validate()
            .unwrap_err()
            .into();
        assert_eq!(err.error_code(), "CONFIG_ERROR");
        assert!(!err.is_retryable());
    }

    // the only test that touches these variables, so the cases run in sequence
    #[test]
    fn test_from_env_overrides() {
        std::env::set_var(BACKEND_ENV, " memory ");
        std::env::set_var(WORKERS_ENV, "true");
        let config = TransportConfig::default().from_env();
        assert_eq!(config.backend.as_deref(), Some("memory"));
        assert!(config.use_workers);

        std::env::set_var(BACKEND_ENV, "   ");
        std::env::set_var(WORKERS_ENV, "maybe");
        let config = TransportConfig::default()
            .with_backend("udp")
            .with_workers(true)
            .from_env();
        assert_eq!(config.backend.as_deref(), Some("udp"));
        assert!(config.use_workers);

        std::env::set_var(WORKERS_ENV, "off");
        assert!(!TransportConfig::default().with_workers(true).from_env().use_workers);

        std::env::remove_var(BACKEND_ENV);
        std::env::remove_var(WORKERS_ENV);
        let config = TransportConfig::default().from_env();
        assert_eq!(config.backend, None);
        assert!(!config.use_workers);
    }
}
