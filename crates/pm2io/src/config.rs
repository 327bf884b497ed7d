//! Agent configuration
//!
//! `Config` carries the credentials and identity supplied once at startup.
//! `TransportOptions` carries the timing knobs of the connection manager;
//! the defaults are the collector's expected cadence.

use crate::error::ConfigurationError;
use crate::reconnect::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Version reported to the collector during discovery and handshake
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol version sent on the upgrade request
pub const PROTOCOL_VERSION: &str = "1";

/// Credentials and identity of the monitored process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Public bucket id
    pub public_key: String,
    /// Secret bucket id
    pub private_key: String,
    /// Display name of the monitored process
    pub name: String,
    /// Collector hostname used for discovery (e.g. "root.keymetrics.io")
    pub server: String,
    /// Machine name reported to the collector, defaults to the hostname
    #[serde(default)]
    pub server_name: Option<String>,
    /// Agent version reported to the collector
    #[serde(default = "default_version")]
    pub version: String,
}

fn default_version() -> String {
    AGENT_VERSION.to_string()
}

impl Config {
    pub fn new(
        public_key: impl Into<String>,
        private_key: impl Into<String>,
        name: impl Into<String>,
        server: impl Into<String>,
    ) -> Self {
        Self {
            public_key: public_key.into(),
            private_key: private_key.into(),
            name: name.into(),
            server: server.into(),
            server_name: None,
            version: default_version(),
        }
    }

    pub fn with_server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = Some(server_name.into());
        self
    }

    /// Reject configurations the collector would never accept
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        for (field, value) in [
            ("public_key", &self.public_key),
            ("private_key", &self.private_key),
            ("name", &self.name),
            ("server", &self.server),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigurationError::MissingField {
                    field: field.to_string(),
                });
            }
        }

        if self.server.contains("://") || self.server.contains('/') {
            return Err(ConfigurationError::InvalidValue {
                field: "server".to_string(),
                reason: "expected a bare hostname".to_string(),
            });
        }

        Ok(())
    }
}

/// Timing configuration of the connection manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportOptions {
    /// Interval between protocol pings on the active stream
    pub heartbeat_interval: Duration,
    /// Interval between endpoint re-resolutions
    pub refresh_interval: Duration,
    /// Delay policy after a failed discovery
    pub discovery_retry: RetryPolicy,
    /// Delay policy after a failed handshake
    pub handshake_retry: RetryPolicy,
    /// Consecutive handshake failures before the cached endpoint is dropped
    pub rediscover_after: u32,
    /// Upper bound on a single frame write
    pub write_timeout: Duration,
    /// Upper bound on the upgrade request
    pub handshake_timeout: Duration,
    /// Upper bound on the discovery request
    pub discovery_timeout: Duration,
    /// Interval between status samples
    pub status_interval: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            refresh_interval: Duration::from_secs(10 * 60),
            discovery_retry: RetryPolicy::fixed(Duration::from_secs(10)),
            handshake_retry: RetryPolicy::fixed(Duration::from_secs(2)),
            rediscover_after: 10,
            write_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(30),
            discovery_timeout: Duration::from_secs(30),
            status_interval: Duration::from_secs(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_empty_fields() {
        let config = Config::new("", "secret", "app", "root.keymetrics.io");
        assert_eq!(
            config.validate(),
            Err(ConfigurationError::MissingField {
                field: "public_key".to_string()
            })
        );

        let config = Config::new("public", "secret", "app", "  ");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_url_as_server() {
        let config = Config::new("public", "secret", "app", "https://root.keymetrics.io");
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: Config = serde_json::from_str(
            r#"{"public_key":"p","private_key":"s","name":"app","server":"root.keymetrics.io"}"#,
        )
        .unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.server_name, None);
        assert_eq!(config.version, AGENT_VERSION);
    }

    #[test]
    fn test_default_options() {
        let options = TransportOptions::default();
        assert_eq!(options.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(options.refresh_interval, Duration::from_secs(600));
        assert_eq!(options.discovery_retry.delay_for(7), Duration::from_secs(10));
        assert_eq!(options.handshake_retry.delay_for(0), Duration::from_secs(2));
    }
}
