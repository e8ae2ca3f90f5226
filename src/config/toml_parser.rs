//! TOML configuration file parser
//!
//! File layout:
//!
//! ```toml
//! [controller]
//! keys_dir = "/var/lib/wg-fleet/keys"
//! connect_timeout_secs = 3
//!
//! [controller.retry]
//! max_attempts = 3
//!
//! [http]
//! bind_address = "0.0.0.0"
//! bind_port = 8080
//!
//! [[servers]]
//! name = "edge"
//! ip = "203.0.113.7"
//! ```

use crate::config::{
    ClientEntry, ControllerConfig, FleetConfig, GroupEntry, HttpConfig, Inventory, RetryPolicy,
    ServerEntry, DEFAULT_KEYS_DIR, DEFAULT_REMOTE_CONFIG_DIR, DEFAULT_STAGING_DIR,
};
use crate::error::{FleetError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// TOML configuration file structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TomlConfig {
    /// Remote-management settings
    #[serde(default)]
    pub controller: TomlControllerConfig,

    /// HTTP listener (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http: Option<TomlHttpConfig>,

    /// Servers to import
    #[serde(default)]
    pub servers: Vec<ServerEntry>,

    /// Groups to import
    #[serde(default)]
    pub groups: Vec<GroupEntry>,

    /// Clients to import
    #[serde(default)]
    pub clients: Vec<ClientEntry>,
}

/// TOML controller section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TomlControllerConfig {
    /// Directory of per-server ssh identities
    #[serde(default = "default_keys_dir")]
    pub keys_dir: PathBuf,

    /// Directory for staged server configs
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,

    /// Remote config directory
    #[serde(default = "default_remote_config_dir")]
    pub remote_config_dir: String,

    /// Remote login user
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,

    /// Remote ssh port
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,

    /// Session connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Whole-operation deadline in seconds
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: u64,

    /// Telemetry lifetime in seconds
    #[serde(default = "default_telemetry_ttl")]
    pub telemetry_ttl_secs: u64,

    /// Retry settings
    #[serde(default)]
    pub retry: TomlRetryConfig,
}

impl Default for TomlControllerConfig {
    fn default() -> Self {
        Self {
            keys_dir: default_keys_dir(),
            staging_dir: default_staging_dir(),
            remote_config_dir: default_remote_config_dir(),
            ssh_user: default_ssh_user(),
            ssh_port: default_ssh_port(),
            connect_timeout_secs: default_connect_timeout(),
            operation_timeout_secs: default_operation_timeout(),
            telemetry_ttl_secs: default_telemetry_ttl(),
            retry: TomlRetryConfig::default(),
        }
    }
}

/// TOML retry section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TomlRetryConfig {
    /// Attempts including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First backoff in milliseconds
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Backoff cap in milliseconds
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for TomlRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

/// TOML HTTP configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TomlHttpConfig {
    /// Bind address
    pub bind_address: String,

    /// Bind port
    pub bind_port: u16,
}

impl TomlConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            FleetError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        toml::from_str(&contents)
            .map_err(|e| FleetError::Config(format!("Failed to parse TOML config: {}", e)))
    }

    /// Parse configuration from a TOML string
    pub fn parse(toml: &str) -> Result<Self> {
        toml::from_str(toml).map_err(|e| FleetError::Config(format!("Failed to parse TOML: {}", e)))
    }
}

impl From<TomlConfig> for FleetConfig {
    fn from(toml: TomlConfig) -> Self {
        FleetConfig {
            controller: toml.controller.into(),
            http: toml.http.map(Into::into).unwrap_or_default(),
            inventory: Inventory {
                servers: toml.servers,
                groups: toml.groups,
                clients: toml.clients,
            },
        }
    }
}

impl From<TomlControllerConfig> for ControllerConfig {
    fn from(toml: TomlControllerConfig) -> Self {
        ControllerConfig {
            keys_dir: toml.keys_dir,
            staging_dir: toml.staging_dir,
            remote_config_dir: toml.remote_config_dir.trim_end_matches('/').to_string(),
            ssh_user: toml.ssh_user,
            ssh_port: toml.ssh_port,
            connect_timeout: Duration::from_secs(toml.connect_timeout_secs),
            operation_timeout: Duration::from_secs(toml.operation_timeout_secs),
            telemetry_ttl: Duration::from_secs(toml.telemetry_ttl_secs),
            retry: toml.retry.into(),
        }
    }
}

impl From<TomlRetryConfig> for RetryPolicy {
    fn from(toml: TomlRetryConfig) -> Self {
        RetryPolicy {
            max_attempts: toml.max_attempts,
            initial_backoff: Duration::from_millis(toml.initial_backoff_ms),
            max_backoff: Duration::from_millis(toml.max_backoff_ms),
        }
    }
}

impl From<TomlHttpConfig> for HttpConfig {
    fn from(toml: TomlHttpConfig) -> Self {
        HttpConfig {
            bind_address: toml.bind_address,
            bind_port: toml.bind_port,
        }
    }
}

// Default value functions
fn default_keys_dir() -> PathBuf {
    PathBuf::from(DEFAULT_KEYS_DIR)
}

fn default_staging_dir() -> PathBuf {
    PathBuf::from(DEFAULT_STAGING_DIR)
}

fn default_remote_config_dir() -> String {
    DEFAULT_REMOTE_CONFIG_DIR.to_string()
}

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_connect_timeout() -> u64 {
    3
}

fn default_operation_timeout() -> u64 {
    60
}

fn default_telemetry_ttl() -> u64 {
    300
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff() -> u64 {
    500
}

fn default_max_backoff() -> u64 {
    10_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty_uses_defaults() {
        let config: FleetConfig = TomlConfig::parse("").expect("Failed to parse TOML").into();
        assert_eq!(config.controller, ControllerConfig::default());
        assert_eq!(config.http, HttpConfig::default());
        assert!(config.inventory.servers.is_empty());
    }

    #[test]
    fn test_parse_controller_section() {
        let toml = r#"
            [controller]
            keys_dir = "/srv/wg/keys"
            staging_dir = "/srv/wg/staging"
            remote_config_dir = "/etc/wireguard/"
            ssh_user = "deploy"
            connect_timeout_secs = 5
            operation_timeout_secs = 30

            [controller.retry]
            max_attempts = 4
            initial_backoff_ms = 250
        "#;

        let config: FleetConfig = TomlConfig::parse(toml).expect("Failed to parse TOML").into();
        let controller = &config.controller;
        assert_eq!(controller.keys_dir, PathBuf::from("/srv/wg/keys"));
        assert_eq!(controller.remote_config_dir, "/etc/wireguard");
        assert_eq!(controller.ssh_user, "deploy");
        assert_eq!(controller.connect_timeout, Duration::from_secs(5));
        assert_eq!(controller.operation_timeout, Duration::from_secs(30));
        assert_eq!(controller.telemetry_ttl, Duration::from_secs(300));
        assert_eq!(controller.retry.max_attempts, 4);
        assert_eq!(controller.retry.initial_backoff, Duration::from_millis(250));
        assert_eq!(controller.retry.max_backoff, Duration::from_secs(10));
    }

    #[test]
    fn test_parse_toml_with_http() {
        let toml = r#"
            [http]
            bind_address = "0.0.0.0"
            bind_port = 8081
        "#;

        let config: FleetConfig = TomlConfig::parse(toml).expect("Failed to parse TOML").into();
        assert_eq!(config.http.bind_address, "0.0.0.0");
        assert_eq!(config.http.bind_port, 8081);
    }

    #[test]
    fn test_parse_inventory() {
        let toml = r#"
            [[servers]]
            name = "edge"
            ip = "203.0.113.7"
            network = "10.20.0.0/24"

            [[groups]]
            name = "staff"
            ips = "10.0.0.0/8"

            [[clients]]
            name = "laptop"
            group = "staff"
            server = "edge"
            enable_download = true
        "#;

        let config = FleetConfig::parse(toml).expect("Failed to parse TOML");
        let inventory = &config.inventory;
        assert_eq!(inventory.servers[0].server.name, "edge");
        assert_eq!(inventory.servers[0].server.port, 41800);
        assert_eq!(inventory.servers[0].server.network, "10.20.0.0/24");
        assert_eq!(inventory.groups[0].ips, "10.0.0.0/8");
        assert_eq!(inventory.clients[0].group, "staff");
        assert!(inventory.clients[0].enable_download);
        assert!(inventory.clients[0].is_enabled);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            TomlConfig::parse("[controller\nkeys_dir = 1"),
            Err(FleetError::Config(_))
        ));
    }
}
