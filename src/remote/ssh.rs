//! Management sessions over the system OpenSSH client
//!
//! One multiplexed master connection is opened per session; commands and
//! uploads ride on it through the control socket. Child processes are killed
//! when their futures are dropped, so an expired deadline does not leave
//! stray `ssh` processes behind.

use super::{commands, CommandOutput, Connector, ManagementSession, RemoteTarget};
use crate::error::ApplyError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use tokio::process::Command;
use tracing::{debug, warn};

/// ssh exits with 255 when the connection itself failed
const SSH_TRANSPORT_FAILURE: i32 = 255;

/// Opens sessions with `ssh` / `scp`
#[derive(Debug, Clone)]
pub struct SshConnector {
    control_dir: PathBuf,
    ssh_program: String,
    scp_program: String,
}

impl SshConnector {
    /// Connector keeping its control sockets in `control_dir`
    pub fn new(control_dir: impl Into<PathBuf>) -> Self {
        Self {
            control_dir: control_dir.into(),
            ssh_program: "ssh".to_string(),
            scp_program: "scp".to_string(),
        }
    }

    /// Use different client binaries
    pub fn with_programs(mut self, ssh: impl Into<String>, scp: impl Into<String>) -> Self {
        self.ssh_program = ssh.into();
        self.scp_program = scp.into();
        self
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, target: &RemoteTarget) -> Result<Box<dyn ManagementSession>, ApplyError> {
        tokio::fs::create_dir_all(&self.control_dir)
            .await
            .map_err(|e| {
                ApplyError::Unreachable(format!(
                    "can't create control directory {:?}: {}",
                    self.control_dir, e
                ))
            })?;

        let session = SshSession {
            destination: format!("{}@{}", target.user, target.host),
            port: target.port.to_string(),
            options: ssh_options(target, &self.control_dir),
            ssh_program: self.ssh_program.clone(),
            scp_program: self.scp_program.clone(),
        };

        // `true` forces the master connection up so auth failures surface here
        let output = session.ssh(&["true"]).await.map_err(ApplyError::Unreachable)?;
        if !output.status.success() {
            return Err(ApplyError::Unreachable(failure_summary(&output)));
        }

        debug!("Management session to {} established", session.destination);
        Ok(Box::new(session))
    }
}

fn ssh_options(target: &RemoteTarget, control_dir: &Path) -> Vec<String> {
    let control_path = control_dir.join(format!("{}-%C", target.server_id));
    [
        "BatchMode=yes".to_string(),
        "StrictHostKeyChecking=accept-new".to_string(),
        format!("ConnectTimeout={}", target.connect_timeout.as_secs().max(1)),
        "ControlMaster=auto".to_string(),
        format!("ControlPath={}", control_path.display()),
        "ControlPersist=60".to_string(),
    ]
    .into_iter()
    .flat_map(|opt| ["-o".to_string(), opt])
    .chain(["-i".to_string(), target.identity_file.display().to_string()])
    .collect()
}

fn failure_summary(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.is_empty() {
        format!("ssh exited with {}", output.status)
    } else {
        stderr
    }
}

struct SshSession {
    destination: String,
    port: String,
    options: Vec<String>,
    ssh_program: String,
    scp_program: String,
}

impl SshSession {
    async fn ssh(&self, args: &[&str]) -> Result<Output, String> {
        run(
            Command::new(&self.ssh_program)
                .args(&self.options)
                .args(["-p", self.port.as_str(), self.destination.as_str()])
                .args(args),
        )
        .await
        .map_err(|e| format!("failed to run {}: {}", self.ssh_program, e))
    }
}

async fn run(command: &mut Command) -> std::io::Result<Output> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
}

#[async_trait]
impl ManagementSession for SshSession {
    async fn upload(&mut self, local_path: &Path, remote_path: &str) -> Result<(), ApplyError> {
        debug!("Uploading {:?} to {}:{}", local_path, self.destination, remote_path);
        let output = run(
            Command::new(&self.scp_program)
                .args(&self.options)
                .args(["-q", "-P", self.port.as_str()])
                .arg(local_path)
                .arg(format!("{}:{}", self.destination, remote_path)),
        )
        .await
        .map_err(|e| ApplyError::TransferFailed(format!("failed to run {}: {}", self.scp_program, e)))?;

        if !output.status.success() {
            return Err(ApplyError::TransferFailed(failure_summary(&output)));
        }
        Ok(())
    }

    async fn chmod(&mut self, remote_path: &str, mode: u32) -> Result<(), ApplyError> {
        let command = commands::chmod(remote_path, mode);
        let output = self
            .exec(&command)
            .await
            .map_err(|e| ApplyError::TransferFailed(e.to_string()))?;
        output
            .check(&command)
            .map(|_| ())
            .map_err(|e| ApplyError::TransferFailed(e.to_string()))
    }

    async fn exec(&mut self, command: &str) -> Result<CommandOutput, ApplyError> {
        debug!("Running on {}: {}", self.destination, command);
        let output = self.ssh(&[command]).await.map_err(ApplyError::Unreachable)?;

        if output.status.code() == Some(SSH_TRANSPORT_FAILURE) {
            return Err(ApplyError::Unreachable(failure_summary(&output)));
        }

        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn close(&mut self) {
        let result = run(
            Command::new(&self.ssh_program)
                .args(&self.options)
                .args(["-O", "exit", "-p", self.port.as_str(), self.destination.as_str()]),
        )
        .await;
        match result {
            Ok(output) if output.status.success() => {
                debug!("Closed management session to {}", self.destination)
            }
            Ok(output) => debug!(
                "Control master for {} already gone: {}",
                self.destination,
                failure_summary(&output)
            ),
            Err(e) => warn!("Failed to close session to {}: {}", self.destination, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn target() -> RemoteTarget {
        RemoteTarget {
            server_id: 4,
            host: "203.0.113.7".into(),
            port: 22,
            user: "root".into(),
            identity_file: PathBuf::from("/var/lib/wg-fleet/keys/4"),
            connect_timeout: Duration::from_secs(3),
        }
    }

    #[test]
    fn test_ssh_options() {
        let options = ssh_options(&target(), Path::new("/run/wg-fleet"));
        assert!(options.contains(&"BatchMode=yes".to_string()));
        assert!(options.contains(&"ConnectTimeout=3".to_string()));
        assert!(options.contains(&"ControlPath=/run/wg-fleet/4-%C".to_string()));
        assert_eq!(
            &options[options.len() - 2..],
            &["-i".to_string(), "/var/lib/wg-fleet/keys/4".to_string()]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_connect_failure_is_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let connector = SshConnector::new(dir.path()).with_programs("false", "false");
        let err = connector.connect(&target()).await.err().unwrap();
        assert!(matches!(err, ApplyError::Unreachable(msg) if !msg.is_empty()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_program_is_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let connector = SshConnector::new(dir.path())
            .with_programs("/nonexistent/ssh", "/nonexistent/scp");
        let err = connector.connect(&target()).await.err().unwrap();
        assert!(matches!(err, ApplyError::Unreachable(msg) if msg.contains("failed to run")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_session_with_stub_client() {
        let dir = tempfile::tempdir().unwrap();
        let connector = SshConnector::new(dir.path()).with_programs("true", "true");
        let mut session = connector.connect(&target()).await.unwrap();

        let output = session.exec("wg show all dump").await.unwrap();
        assert!(output.is_success());
        session
            .upload(Path::new("/dev/null"), "/etc/wireguard/wg0.conf")
            .await
            .unwrap();
        session.chmod("/etc/wireguard/wg0.conf", 0o600).await.unwrap();
        session.close().await;
    }
}
