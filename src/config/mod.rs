//! Configuration file for the relay server and its clients
//!
//! Read from `~/.minik8s/config.yaml` when present. Every field has a
//! default, so a missing file or a partial one is fine:
//!
//! ```yaml
//! control-plane: http://10.0.0.1:8282
//! server:
//!   bind_addr: 0.0.0.0
//!   port: 8282
//! watch:
//!   reopen_backoff_secs: 5
//!   resync_interval_secs: 30
//!   retry_backoff_secs: 5
//!   tombstone_ttl_secs: 60
//!   policy: prune
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::{InformerConfig, ResyncPolicy};
use crate::watch::RegistryConfig;

/// Default port of the control plane API
pub const DEFAULT_PORT: u16 = 8282;

/// Default config file location: ~/.minik8s/config.yaml
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".minik8s")
        .join("config.yaml")
}

/// Errors for loading configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// The complete configuration file structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Control plane URL used by client commands
    #[serde(rename = "control-plane", default = "default_control_plane")]
    pub control_plane: String,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub watch: WatchConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            control_plane: default_control_plane(),
            server: ServerConfig::default(),
            watch: WatchConfig::default(),
        }
    }
}

/// Where `serve` listens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_addr: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_address(),
            port: DEFAULT_PORT,
        }
    }
}

/// Watch relay and informer timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Delay before the relay re-opens a disconnected store watch
    #[serde(default = "default_backoff_secs")]
    pub reopen_backoff_secs: u64,

    /// Interval between informer re-lists (0 disables)
    #[serde(default = "default_resync_interval_secs")]
    pub resync_interval_secs: u64,

    /// Delay before an informer retries a failed list + watch
    #[serde(default = "default_backoff_secs")]
    pub retry_backoff_secs: u64,

    /// Age at which deleted keys are forgotten when resync is disabled
    #[serde(default = "default_tombstone_ttl_secs")]
    pub tombstone_ttl_secs: u64,

    #[serde(default)]
    pub policy: ResyncPolicy,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            reopen_backoff_secs: default_backoff_secs(),
            resync_interval_secs: default_resync_interval_secs(),
            retry_backoff_secs: default_backoff_secs(),
            tombstone_ttl_secs: default_tombstone_ttl_secs(),
            policy: ResyncPolicy::default(),
        }
    }
}

fn default_control_plane() -> String {
    format!("http://127.0.0.1:{}", DEFAULT_PORT)
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_backoff_secs() -> u64 {
    5
}

fn default_resync_interval_secs() -> u64 {
    30
}

fn default_tombstone_ttl_secs() -> u64 {
    60
}

// ============================================================================
// Parsing and validation
// ============================================================================

/// Parse and validate config from a YAML string
pub fn parse_config(content: &str) -> Result<Config, ConfigError> {
    let config: Config =
        serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Invalid("server.port must be non-zero".to_string()));
        }
        if self.watch.reopen_backoff_secs == 0 {
            return Err(ConfigError::Invalid(
                "watch.reopen_backoff_secs must be at least 1".to_string(),
            ));
        }
        if self.watch.retry_backoff_secs == 0 {
            return Err(ConfigError::Invalid(
                "watch.retry_backoff_secs must be at least 1".to_string(),
            ));
        }
        if !self.control_plane.starts_with("http://") && !self.control_plane.starts_with("https://") {
            return Err(ConfigError::Invalid(format!(
                "control-plane '{}' is not an http(s) URL",
                self.control_plane
            )));
        }
        Ok(())
    }

    /// `host:port` the server binds to
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.bind_addr, self.server.port)
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            reopen_backoff: Duration::from_secs(self.watch.reopen_backoff_secs),
        }
    }

    pub fn informer_config(&self) -> InformerConfig {
        InformerConfig::default()
            .with_resync_interval(Duration::from_secs(self.watch.resync_interval_secs))
            .with_retry_backoff(Duration::from_secs(self.watch.retry_backoff_secs))
            .with_policy(self.watch.policy)
            .with_tombstone_ttl(Duration::from_secs(self.watch.tombstone_ttl_secs))
    }
}

// ============================================================================
// I/O boundary
// ============================================================================

/// Load config from the default location
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&default_config_path())
}

/// Load config from `path`; a missing file yields the defaults
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)?;
    parse_config(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.port, DEFAULT_PORT);
        assert_eq!(config.bind_address(), "0.0.0.0:8282");
        assert_eq!(config.control_plane, "http://127.0.0.1:8282");
        assert_eq!(config.registry_config().reopen_backoff, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config = parse_config("server:\n  port: 9000\n").unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.bind_addr, "0.0.0.0");
        assert_eq!(config.watch.resync_interval_secs, 30);
    }

    #[test]
    fn test_full_config() {
        let yaml = r#"
control-plane: https://cp.example:8443
server:
  bind_addr: 127.0.0.1
  port: 8300
watch:
  reopen_backoff_secs: 2
  resync_interval_secs: 0
  retry_backoff_secs: 10
  tombstone_ttl_secs: 120
  policy: retain
"#;
        let config = parse_config(yaml).unwrap();

        assert_eq!(config.control_plane, "https://cp.example:8443");
        let informer = config.informer_config();
        assert!(informer.resync_interval.is_zero());
        assert_eq!(informer.retry_backoff, Duration::from_secs(10));
        assert_eq!(informer.policy, ResyncPolicy::Retain);
        assert_eq!(informer.tombstone_ttl, Duration::from_secs(120));
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            parse_config("watch:\n  reopen_backoff_secs: 0\n"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            parse_config("control-plane: localhost:8282\n"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            parse_config("server: [1, 2]\n"),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_load_config_file() {
        let file = create_temp_file("server:\n  port: 8999\n");
        let config = load_config_from(file.path()).unwrap();
        assert_eq!(config.server.port, 8999);
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let config = load_config_from(Path::new("/nonexistent/config.yaml")).unwrap();
        assert_eq!(config.server.port, DEFAULT_PORT);
    }
}
