//! Per-server management identities
//!
//! Each server authenticates the controller with its own ssh key pair,
//! stored as `<keys_dir>/<server_id>` and `<keys_dir>/<server_id>.pub`.

use crate::error::{FleetError, Result};
use crate::model::{Server, ServerId};
use crate::security::{set_secure_permissions, validate_file_permissions, SecureFileMode};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Directory of management identities
#[derive(Debug, Clone)]
pub struct CredentialStore {
    keys_dir: PathBuf,
    keygen_program: String,
}

impl CredentialStore {
    /// Store rooted at `keys_dir`
    pub fn new(keys_dir: impl Into<PathBuf>) -> Self {
        Self {
            keys_dir: keys_dir.into(),
            keygen_program: "ssh-keygen".to_string(),
        }
    }

    /// Use a different key generator binary
    pub fn with_keygen(mut self, program: impl Into<String>) -> Self {
        self.keygen_program = program.into();
        self
    }

    /// Directory holding the identities
    pub fn keys_dir(&self) -> &Path {
        &self.keys_dir
    }

    /// Private identity file of a server
    pub fn key_path(&self, server_id: ServerId) -> PathBuf {
        self.keys_dir.join(server_id.to_string())
    }

    /// Public half of a server's identity
    pub fn public_key_path(&self, server_id: ServerId) -> PathBuf {
        self.keys_dir.join(format!("{}.pub", server_id))
    }

    /// Whether `server_id` already has an identity
    pub fn exists(&self, server_id: ServerId) -> bool {
        self.key_path(server_id).exists()
    }

    /// Make sure `server_id` has an identity.
    ///
    /// Existing files are kept. Otherwise the pair is copied from
    /// `copy_from` (a server on the same host) when that one has an
    /// identity, or generated fresh.
    pub async fn provision(&self, server_id: ServerId, copy_from: Option<ServerId>) -> Result<()> {
        let key_path = self.key_path(server_id);
        if key_path.exists() {
            debug!("Server {} already has a management identity", server_id);
            if let Err(e) = validate_file_permissions(&key_path, SecureFileMode::PrivateKey) {
                warn!("Tightening identity permissions: {}", e);
                set_secure_permissions(&key_path, SecureFileMode::PrivateKey)?;
            }
            return Ok(());
        }

        tokio::fs::create_dir_all(&self.keys_dir).await?;
        set_secure_permissions(&self.keys_dir, SecureFileMode::Directory)?;

        match copy_from.filter(|source| self.exists(*source)) {
            Some(source) => {
                tokio::fs::copy(self.key_path(source), &key_path).await?;
                tokio::fs::copy(self.public_key_path(source), self.public_key_path(server_id))
                    .await?;
                info!(
                    "Copied management identity of server {} to server {}",
                    source, server_id
                );
            }
            None => {
                self.generate(server_id, &key_path).await?;
                info!("Generated management identity for server {}", server_id);
            }
        }

        set_secure_permissions(&key_path, SecureFileMode::PrivateKey)
    }

    async fn generate(&self, server_id: ServerId, key_path: &Path) -> Result<()> {
        let output = Command::new(&self.keygen_program)
            .args(["-q", "-t", "ed25519", "-N", ""])
            .arg("-C")
            .arg(format!("wg-fleet-{}", server_id))
            .arg("-f")
            .arg(key_path)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                FleetError::Io(std::io::Error::new(
                    e.kind(),
                    format!("failed to run {}: {}", self.keygen_program, e),
                ))
            })?;

        if !output.status.success() {
            return Err(FleetError::InvalidState(format!(
                "{} failed for server {}: {}",
                self.keygen_program,
                server_id,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    /// Command the operator runs once to authorize the identity on the host
    pub fn ssh_copy_id_hint(&self, server: &Server, user: &str) -> String {
        format!(
            "ssh-copy-id -i {} {}@{}",
            self.public_key_path(server.id).display(),
            user,
            server.ip
        )
    }
}
