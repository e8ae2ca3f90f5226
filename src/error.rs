//! Error types for wg-fleet
//!
//! This module defines the error types used throughout the controller.
//! We use `thiserror` for ergonomic error definitions and `anyhow` for
//! error propagation in the binary.

use crate::wireguard::KeyError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for wg-fleet operations
#[derive(Error, Debug)]
pub enum FleetError {
    /// Input failed validation (subnet, allow-list, interface name, ...)
    #[error("Validation error: {0}")]
    Validation(String),

    /// No record matches the identifier or token
    #[error("Not found: {0}")]
    NotFound(String),

    /// Key material could not be decoded
    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    /// A remote operation against a server failed
    #[error("Remote error: {0}")]
    Apply(#[from] ApplyError),

    /// Statistics output could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid state errors
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Permission errors
    #[error("Permission denied: {0}")]
    Permission(String),
}

/// Result type alias using FleetError
pub type Result<T> = std::result::Result<T, FleetError>;

impl From<serde_json::Error> for FleetError {
    fn from(err: serde_json::Error) -> Self {
        FleetError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for FleetError {
    fn from(err: toml::de::Error) -> Self {
        FleetError::Config(err.to_string())
    }
}

/// Failure of a management-session operation against a remote server
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "message")]
pub enum ApplyError {
    /// The management session could not be opened (network or auth failure)
    #[error("can't connect to server: {0}")]
    Unreachable(String),

    /// Config upload or permission change failed
    #[error("transfer failed: {0}")]
    TransferFailed(String),

    /// A remote command exited non-zero or produced unexpected output
    #[error("command `{command}` failed: {reason}")]
    CommandFailed {
        /// The command line that was run
        command: String,
        /// Exit status and stderr summary
        reason: String,
    },

    /// The overall operation deadline expired
    #[error("operation timed out: {0}")]
    Timeout(String),
}

impl ApplyError {
    /// Whether running the same operation again may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ApplyError::Unreachable(_) | ApplyError::TransferFailed(_) | ApplyError::Timeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(ApplyError::Unreachable("x".into()).is_retryable());
        assert!(ApplyError::Timeout("x".into()).is_retryable());
        assert!(!ApplyError::CommandFailed {
            command: "wg".into(),
            reason: "exit 1".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_apply_error_wraps_into_fleet_error() {
        let err: FleetError = ApplyError::TransferFailed("disk full".into()).into();
        assert_eq!(err.to_string(), "Remote error: transfer failed: disk full");
    }
}
