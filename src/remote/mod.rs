//! Remote management of WireGuard servers
//!
//! A management session is an authenticated remote-execution channel to a
//! server host. The applier uses it to install rendered configuration and
//! change single peers; the statistics collector uses it to read live state.
//! `Connector` and `ManagementSession` are the seam that lets tests replace
//! the ssh transport.

mod applier;
pub mod commands;
mod credentials;
mod ssh;

pub use applier::{ApplyOptions, ApplyReport, RemoteApplier};
pub use credentials::CredentialStore;
pub use ssh::SshConnector;

use crate::error::ApplyError;
use crate::model::ServerId;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Where and how to open a management session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    /// Server the session belongs to
    pub server_id: ServerId,
    /// Host to connect to
    pub host: String,
    /// Management (ssh) port
    pub port: u16,
    /// Remote user
    pub user: String,
    /// Private key file authenticating the controller
    pub identity_file: PathBuf,
    /// Bound on establishing the session
    pub connect_timeout: Duration,
}

/// Result of a remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status, `None` if the process was killed by a signal
    pub status: Option<i32>,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
}

impl CommandOutput {
    /// Output of a command that exited zero
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Whether the command exited zero
    pub fn is_success(&self) -> bool {
        self.status == Some(0)
    }

    /// Turn a non-zero exit into `ApplyError::CommandFailed`
    pub fn check(self, command: &str) -> Result<Self, ApplyError> {
        if self.is_success() {
            return Ok(self);
        }
        let status = match self.status {
            Some(code) => format!("exit status {}", code),
            None => "terminated by signal".to_string(),
        };
        let stderr = self.stderr.trim();
        let reason = if stderr.is_empty() {
            status
        } else {
            format!("{}: {}", status, stderr)
        };
        Err(ApplyError::CommandFailed {
            command: command.to_string(),
            reason,
        })
    }
}

/// Opens management sessions
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open an authenticated session to `target`
    async fn connect(&self, target: &RemoteTarget) -> Result<Box<dyn ManagementSession>, ApplyError>;
}

/// An open management session to one host
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ManagementSession: Send {
    /// Copy a local file to `remote_path`
    async fn upload(&mut self, local_path: &Path, remote_path: &str) -> Result<(), ApplyError>;

    /// Change the mode of a remote file
    async fn chmod(&mut self, remote_path: &str, mode: u32) -> Result<(), ApplyError>;

    /// Run a command. Transport failures are errors; a non-zero exit is
    /// reported in the returned output.
    async fn exec(&mut self, command: &str) -> Result<CommandOutput, ApplyError>;

    /// Tear the session down
    async fn close(&mut self);
}

/// Open a session, bounding the whole handshake by the target's connect timeout
pub async fn open_session(
    connector: &dyn Connector,
    target: &RemoteTarget,
) -> Result<Box<dyn ManagementSession>, ApplyError> {
    debug!(
        "Opening management session to {}@{}:{} for server {}",
        target.user, target.host, target.port, target.server_id
    );
    match tokio::time::timeout(target.connect_timeout, connector.connect(target)).await {
        Ok(Ok(session)) => Ok(session),
        Ok(Err(e)) => {
            warn!("Server {} unreachable: {}", target.server_id, e);
            Err(e)
        }
        Err(_) => {
            warn!(
                "Server {} connect timed out after {:?}",
                target.server_id, target.connect_timeout
            );
            Err(ApplyError::Unreachable(format!(
                "connect to {} timed out after {}s",
                target.host,
                target.connect_timeout.as_secs()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_success() {
        assert!(CommandOutput::success("ok").check("true").is_ok());
    }

    #[test]
    fn test_check_failure_includes_stderr() {
        let output = CommandOutput {
            status: Some(1),
            stdout: String::new(),
            stderr: "Unable to access interface: No such device\n".into(),
        };
        let err = output.check("wg set wg0 peer x remove").unwrap_err();
        assert_eq!(
            err,
            ApplyError::CommandFailed {
                command: "wg set wg0 peer x remove".into(),
                reason: "exit status 1: Unable to access interface: No such device".into(),
            }
        );
    }

    #[test]
    fn test_check_signal() {
        let output = CommandOutput {
            status: None,
            ..Default::default()
        };
        assert!(matches!(
            output.check("sleep 100"),
            Err(ApplyError::CommandFailed { reason, .. }) if reason == "terminated by signal"
        ));
    }

    struct SlowConnector;

    #[async_trait]
    impl Connector for SlowConnector {
        async fn connect(
            &self,
            _target: &RemoteTarget,
        ) -> Result<Box<dyn ManagementSession>, ApplyError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(ApplyError::Unreachable("never".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_session_times_out() {
        let target = RemoteTarget {
            server_id: 1,
            host: "203.0.113.7".into(),
            port: 22,
            user: "root".into(),
            identity_file: PathBuf::from("/nonexistent"),
            connect_timeout: Duration::from_secs(3),
        };
        let err = open_session(&SlowConnector, &target).await.err().unwrap();
        assert!(matches!(err, ApplyError::Unreachable(msg) if msg.contains("timed out")));
    }
}
