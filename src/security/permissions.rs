//! File permission validation and enforcement
//!
//! Management identity files and staged server configs carry private keys,
//! so they are kept owner-only.

use crate::error::{FleetError, Result};
use std::path::Path;
use tracing::{debug, warn};

/// Secure file mode requirements
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecureFileMode {
    /// Private key or anything embedding one (0600 or stricter)
    PrivateKey,
    /// Directory holding private material (0700 or stricter)
    Directory,
}

impl SecureFileMode {
    /// Get the maximum allowed permission mode
    pub fn max_mode(&self) -> u32 {
        match self {
            Self::PrivateKey => 0o600,
            Self::Directory => 0o700,
        }
    }

    /// Get human-readable description
    pub fn description(&self) -> &'static str {
        match self {
            Self::PrivateKey => "0600 (owner read/write only)",
            Self::Directory => "0700 (owner only)",
        }
    }
}

/// Check that `path` grants no more than `mode` allows
#[cfg(unix)]
pub fn validate_file_permissions(path: &Path, mode: SecureFileMode) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = std::fs::metadata(path).map_err(|e| {
        FleetError::Permission(format!("Failed to read metadata for {:?}: {}", path, e))
    })?;

    let file_mode = metadata.permissions().mode() & 0o777;
    // any bit outside the allowed mask is too permissive
    if file_mode & !mode.max_mode() != 0 {
        warn!(
            "File {:?} has insecure permissions: {:o} (max: {:o})",
            path,
            file_mode,
            mode.max_mode()
        );
        return Err(FleetError::Permission(format!(
            "File {:?} has insecure permissions: {:o}, expected {}",
            path,
            file_mode,
            mode.description()
        )));
    }

    debug!("Permissions valid for {:?}: {:o}", path, file_mode);
    Ok(())
}

/// Check that `path` grants no more than `mode` allows (non-Unix stub)
#[cfg(not(unix))]
pub fn validate_file_permissions(path: &Path, _mode: SecureFileMode) -> Result<()> {
    debug!("Permission validation not implemented for this platform: {:?}", path);
    Ok(())
}

/// Set `mode` on `path`
#[cfg(unix)]
pub fn set_secure_permissions(path: &Path, mode: SecureFileMode) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let perms = std::fs::Permissions::from_mode(mode.max_mode());
    std::fs::set_permissions(path, perms).map_err(|e| {
        FleetError::Permission(format!("Failed to set permissions on {:?}: {}", path, e))
    })?;

    debug!("Set secure permissions on {:?}: {:o}", path, mode.max_mode());
    Ok(())
}

/// Set `mode` on `path` (non-Unix stub)
#[cfg(not(unix))]
pub fn set_secure_permissions(path: &Path, _mode: SecureFileMode) -> Result<()> {
    debug!("Permission setting not implemented for this platform: {:?}", path);
    Ok(())
}
