//! Remote reconciliation of one server
//!
//! An apply renders the full server config, installs it over a management
//! session and optionally pushes a single peer change to the live interface
//! and restarts or stops the service. Steps run in order and stop at the
//! first failure; nothing already done on the host is rolled back.

use super::{commands, commands::ServiceAction, open_session, Connector, CredentialStore};
use super::{ManagementSession, RemoteTarget};
use crate::config::ControllerConfig;
use crate::error::{ApplyError, FleetError};
use crate::model::{Client, Server};
use crate::security::{set_secure_permissions, SecureFileMode};
use crate::wireguard::render_server_config;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Mode of the installed config on the server
const REMOTE_CONFIG_MODE: u32 = 0o600;

/// Optional service actions after the config is installed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyOptions {
    /// Restart the wg-quick service
    pub restart: bool,
    /// Stop the wg-quick service
    pub stop: bool,
}

impl ApplyOptions {
    /// Install and restart
    pub fn restart() -> Self {
        Self {
            restart: true,
            stop: false,
        }
    }

    /// Install and stop
    pub fn stop() -> Self {
        Self {
            restart: false,
            stop: true,
        }
    }
}

/// Outcome of an apply as shown to operators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyReport {
    /// Whether every step succeeded
    pub ok: bool,
    /// Failure description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
}

impl ApplyReport {
    /// Report of a successful apply
    pub fn success() -> Self {
        Self { ok: true, msg: None }
    }

    /// Report of a failed apply
    pub fn failure(error: &ApplyError) -> Self {
        Self {
            ok: false,
            msg: Some(error.to_string()),
        }
    }
}

impl From<&Result<(), ApplyError>> for ApplyReport {
    fn from(result: &Result<(), ApplyError>) -> Self {
        match result {
            Ok(()) => Self::success(),
            Err(e) => Self::failure(e),
        }
    }
}

impl From<&crate::error::Result<()>> for ApplyReport {
    fn from(result: &crate::error::Result<()>) -> Self {
        match result {
            Ok(()) => Self::success(),
            Err(FleetError::Apply(e)) => Self::failure(e),
            Err(e) => Self {
                ok: false,
                msg: Some(e.to_string()),
            },
        }
    }
}

/// Installs server configs over management sessions
pub struct RemoteApplier {
    connector: Arc<dyn Connector>,
    credentials: CredentialStore,
    settings: ControllerConfig,
}

impl RemoteApplier {
    /// Create an applier using `connector` for sessions and the identities
    /// in `credentials`
    pub fn new(
        connector: Arc<dyn Connector>,
        credentials: CredentialStore,
        settings: ControllerConfig,
    ) -> Self {
        Self {
            connector,
            credentials,
            settings,
        }
    }

    /// Management identities used by this applier
    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    /// Remote-management settings
    pub fn settings(&self) -> &ControllerConfig {
        &self.settings
    }

    /// Session target for `server`
    pub fn target(&self, server: &Server) -> RemoteTarget {
        RemoteTarget {
            server_id: server.id,
            host: server.ip.clone(),
            port: self.settings.ssh_port,
            user: self.settings.ssh_user.clone(),
            identity_file: self.credentials.key_path(server.id),
            connect_timeout: self.settings.connect_timeout,
        }
    }

    /// Local file the rendered config is staged in
    pub fn staging_path(&self, server: &Server) -> PathBuf {
        self.settings
            .staging_dir
            .join(format!("{}-{}.conf", server.id, server.interface))
    }

    /// Reconcile `server` with `clients`, optionally pushing the state of
    /// `changed` to the live interface.
    pub async fn apply(
        &self,
        server: &Server,
        clients: &[Client],
        changed: Option<&Client>,
        options: ApplyOptions,
    ) -> Result<(), ApplyError> {
        info!(
            "Applying config to server {} ({}), restart={}, stop={}",
            server.id, server.ip, options.restart, options.stop
        );

        let deadline = self.settings.operation_timeout;
        let result = match tokio::time::timeout(deadline, self.run(server, clients, changed, options))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(ApplyError::Timeout(format!(
                "apply to server {} exceeded {}s",
                server.id,
                deadline.as_secs()
            ))),
        };

        match &result {
            Ok(()) => info!("Server {} reconciled", server.id),
            Err(e) => warn!("Apply to server {} failed: {}", server.id, e),
        }
        result
    }

    async fn run(
        &self,
        server: &Server,
        clients: &[Client],
        changed: Option<&Client>,
        options: ApplyOptions,
    ) -> Result<(), ApplyError> {
        let mut session = open_session(self.connector.as_ref(), &self.target(server)).await?;
        let result = self
            .steps(session.as_mut(), server, clients, changed, options)
            .await;
        session.close().await;
        result
    }

    async fn steps(
        &self,
        session: &mut dyn ManagementSession,
        server: &Server,
        clients: &[Client],
        changed: Option<&Client>,
        options: ApplyOptions,
    ) -> Result<(), ApplyError> {
        let document = render_server_config(server, clients);
        debug!(
            "Rendered config for server {} with {} peers",
            server.id,
            document.peers.len()
        );
        let staged = self.stage(server, &document.to_string()).await?;

        let remote_path =
            commands::remote_config_path(&self.settings.remote_config_dir, &server.interface);
        session.upload(&staged, &remote_path).await?;
        session.chmod(&remote_path, REMOTE_CONFIG_MODE).await?;
        debug!("Installed {} on server {}", remote_path, server.id);

        if let Some(client) = changed {
            let command = if client.is_enabled {
                commands::peer_upsert(server, client)
            } else {
                commands::peer_remove(&server.interface, &client.keys.public)
            };
            session.exec(&command).await?.check(&command)?;
            debug!("Peer of client {} updated on server {}", client.id, server.id);
        }

        if options.restart {
            run_service(session, &server.interface, ServiceAction::Restart).await?;
        }
        if options.stop {
            run_service(session, &server.interface, ServiceAction::Stop).await?;
        }
        Ok(())
    }

    async fn stage(&self, server: &Server, document: &str) -> Result<PathBuf, ApplyError> {
        let path = self.staging_path(server);
        write_private(&path, document)
            .await
            .map_err(|e| ApplyError::TransferFailed(format!("staging {:?}: {}", path, e)))?;
        set_secure_permissions(&path, SecureFileMode::PrivateKey)
            .map_err(|e| ApplyError::TransferFailed(e.to_string()))?;
        Ok(path)
    }
}

async fn run_service(
    session: &mut dyn ManagementSession,
    interface: &str,
    action: ServiceAction,
) -> Result<(), ApplyError> {
    let command = commands::service(interface, action);
    session.exec(&command).await?.check(&command)?;
    info!("Ran `{}`", command);
    Ok(())
}

async fn write_private(path: &std::path::Path, contents: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;
    file.write_all(contents.as_bytes()).await?;
    file.flush().await
}
