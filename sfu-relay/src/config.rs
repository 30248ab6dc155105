//! Relay configuration

use config::{Config as ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::level_filters::LevelFilter;

use crate::error::Result;

/// Environment variable prefix (`SFU_RELAY_KEYFRAME_INTERVAL_SECS`, ...)
const ENV_PREFIX: &str = "SFU_RELAY";

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// ICE servers handed to every peer connection
    pub ice_servers: Vec<IceServerConfig>,
    /// Seconds between picture-loss-indication requests on each relayed track
    pub keyframe_interval_secs: u64,
    /// Whether server-side negotiators take the polite role
    pub server_polite: bool,
    pub logging: LoggingConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServerConfig {
                urls: vec!["stun:stun.l.google.com:19302".to_string()],
                username: None,
                credential: None,
            }],
            keyframe_interval_secs: 3,
            server_polite: true,
            logging: LoggingConfig::default(),
        }
    }
}

/// A STUN or TURN server entry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl RelayConfig {
    /// Load configuration from an optional file, overridden by environment
    pub fn load(config_file: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // Nested keys use a double underscore: SFU_RELAY_LOGGING__LEVEL
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        Ok(builder.build()?.try_deserialize()?)
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    /// Check for settings that would leave the relay unusable
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.keyframe_interval_secs == 0 {
            errors.push("keyframe_interval_secs must be greater than zero".to_string());
        }

        for (index, server) in self.ice_servers.iter().enumerate() {
            if server.urls.is_empty() {
                errors.push(format!("ice_servers[{index}] has no urls"));
            }
            if server.username.is_some() != server.credential.is_some() {
                errors.push(format!(
                    "ice_servers[{index}] needs both username and credential"
                ));
            }
        }

        if self.logging.level.parse::<LevelFilter>().is_err() {
            errors.push(format!("unknown logging level: {}", self.logging.level));
        }

        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!("unknown logging format: {}", self.logging.format));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Interval between keyframe requests on each relayed track
    #[must_use]
    pub const fn keyframe_interval(&self) -> Duration {
        Duration::from_secs(self.keyframe_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    #[test]
    fn test_defaults_are_valid() {
        let config = RelayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.keyframe_interval(), Duration::from_secs(3));
        assert!(config.server_polite);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: RelayConfig = ConfigBuilder::builder()
            .add_source(File::from_str(
                r#"
                keyframe_interval_secs = 5

                [[ice_servers]]
                urls = ["turn:turn.example.com:3478"]
                username = "relay"
                credential = "secret"
                "#,
                FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.keyframe_interval_secs, 5);
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.ice_servers[0].username.as_deref(), Some("relay"));
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_reports_every_problem() {
        let config = RelayConfig {
            ice_servers: vec![IceServerConfig {
                urls: vec![],
                username: Some("user".to_string()),
                credential: None,
            }],
            keyframe_interval_secs: 0,
            server_polite: false,
            logging: LoggingConfig {
                level: "chatty".to_string(),
                format: "xml".to_string(),
                ..Default::default()
            },
        };

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 5);
    }

    #[test]
    fn test_unreadable_file_is_a_config_error() {
        let dir = std::env::temp_dir().join(format!("sfu-relay-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("relay.toml");
        std::fs::write(&path, "keyframe_interval_secs = \"often\"\n").unwrap();

        let err = RelayConfig::load(path.to_str()).unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
