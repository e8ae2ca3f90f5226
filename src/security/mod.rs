//! Capability checks and file hardening
//!
//! Mutating fleet operations take an [`Actor`]; only privileged actors may
//! change servers, groups or clients. Reading a client config through its
//! download token needs no actor at all.

use crate::error::{FleetError, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

mod permissions;

pub use permissions::{set_secure_permissions, validate_file_permissions, SecureFileMode};

/// The principal performing an operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    /// Name used in logs
    pub name: String,
    /// Whether the actor may administer the fleet
    pub privileged: bool,
}

impl Actor {
    /// A privileged operator
    pub fn operator(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            privileged: true,
        }
    }

    /// An unprivileged principal
    pub fn anonymous() -> Self {
        Self {
            name: "anonymous".to_string(),
            privileged: false,
        }
    }
}

/// Whether `actor` may administer the fleet
pub fn is_privileged(actor: &Actor) -> bool {
    actor.privileged
}

/// Fail with `FleetError::Permission` unless `actor` is privileged
pub fn require_privileged(actor: &Actor, action: &str) -> Result<()> {
    if is_privileged(actor) {
        return Ok(());
    }
    warn!("Denied {} to unprivileged actor '{}'", action, actor.name);
    Err(FleetError::Permission(format!(
        "'{}' may not {}",
        actor.name, action
    )))
}
