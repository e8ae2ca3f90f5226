//! Configuration management
//!
//! The controller reads one TOML file: remote-management settings, the HTTP
//! listener for `serve`, and an optional fleet inventory that seeds the
//! store at startup.

mod inventory;
mod toml_parser;
pub mod validation;

pub use inventory::{ClientEntry, GroupEntry, Inventory, ServerEntry};
pub use toml_parser::TomlConfig;

use crate::error::{FleetError, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default directory for per-server management identities
pub const DEFAULT_KEYS_DIR: &str = "/var/lib/wg-fleet/keys";
/// Default directory for locally staged server configs
pub const DEFAULT_STAGING_DIR: &str = "/var/lib/wg-fleet/staging";
/// Remote directory holding `<interface>.conf`
pub const DEFAULT_REMOTE_CONFIG_DIR: &str = "/etc/wireguard";

/// Fully resolved controller configuration
#[derive(Debug, Clone, Default)]
pub struct FleetConfig {
    /// Remote-management settings
    pub controller: ControllerConfig,
    /// HTTP listener for `serve`
    pub http: HttpConfig,
    /// Entities imported at startup
    pub inventory: Inventory,
}

/// Remote-management settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Directory with one ssh identity per server, named by server id
    pub keys_dir: PathBuf,
    /// Directory for rendered configs before upload
    pub staging_dir: PathBuf,
    /// Remote directory the server config is installed into
    pub remote_config_dir: String,
    /// Remote login user
    pub ssh_user: String,
    /// Remote ssh port
    pub ssh_port: u16,
    /// Bound on opening a management session
    pub connect_timeout: Duration,
    /// Bound on one whole remote operation
    pub operation_timeout: Duration,
    /// Lifetime of cached peer telemetry
    pub telemetry_ttl: Duration,
    /// Retry behaviour for reconciliation
    pub retry: RetryPolicy,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            keys_dir: PathBuf::from(DEFAULT_KEYS_DIR),
            staging_dir: PathBuf::from(DEFAULT_STAGING_DIR),
            remote_config_dir: DEFAULT_REMOTE_CONFIG_DIR.to_string(),
            ssh_user: "root".to_string(),
            ssh_port: 22,
            connect_timeout: Duration::from_secs(3),
            operation_timeout: Duration::from_secs(60),
            telemetry_ttl: crate::monitoring::DEFAULT_TELEMETRY_TTL,
            retry: RetryPolicy::default(),
        }
    }
}

/// Exponential backoff for retryable remote failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts including the first one
    pub max_attempts: u32,
    /// Delay after the first failure
    pub initial_backoff: Duration,
    /// Upper bound on any delay
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay before the attempt following failed attempt `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// HTTP listener settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpConfig {
    /// Bind address for HTTP server
    pub bind_address: String,
    /// Bind port for HTTP server
    pub bind_port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            bind_port: 8080,
        }
    }
}

impl FleetConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: Self = TomlConfig::from_file(path)?.into();
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn parse(toml: &str) -> Result<Self> {
        let config: Self = TomlConfig::parse(toml)?.into();
        config.validate()?;
        Ok(config)
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<()> {
        self.controller.validate()?;
        validation::validate_port(self.http.bind_port)
            .map_err(|e| FleetError::Config(format!("http: {}", e)))?;
        self.inventory
            .validate()
            .map_err(|e| FleetError::Config(format!("inventory: {}", e)))
    }
}

impl ControllerConfig {
    /// Validate controller settings
    pub fn validate(&self) -> Result<()> {
        if self.ssh_user.trim().is_empty() {
            return Err(FleetError::Config("ssh_user must not be empty".into()));
        }
        validation::validate_port(self.ssh_port)
            .map_err(|e| FleetError::Config(format!("ssh_port: {}", e)))?;
        if !self.remote_config_dir.starts_with('/') {
            return Err(FleetError::Config(format!(
                "remote_config_dir '{}' must be absolute",
                self.remote_config_dir
            )));
        }
        if self.connect_timeout.is_zero() {
            return Err(FleetError::Config("connect_timeout_secs must be positive".into()));
        }
        if self.operation_timeout < self.connect_timeout {
            return Err(FleetError::Config(
                "operation_timeout_secs must not be shorter than connect_timeout_secs".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(FleetError::Config("retry.max_attempts must be at least 1".into()));
        }
        Ok(())
    }
}
