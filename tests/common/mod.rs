//! Shared fixtures for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use wg_fleet::config::{ControllerConfig, RetryPolicy};
use wg_fleet::control::Fleet;
use std::net::Ipv4Addr;
use wg_fleet::model::{
    Client, ClientId, Group, GroupId, MemoryStore, Server, ServerId, Store,
};
use wg_fleet::monitoring::MemoryTelemetryCache;
use wg_fleet::remote::{CommandOutput, Connector, ManagementSession, RemoteTarget};
use wg_fleet::{ApplyError, Result as FleetResult};

/// One operation seen by a recording session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Connect(String),
    Upload(String),
    Chmod(String, u32),
    Exec(String),
    Close,
}

/// Connector that records every operation and answers from canned state
#[derive(Default)]
pub struct RecordingConnector {
    ops: Arc<Mutex<Vec<Op>>>,
    uploads: Arc<Mutex<Vec<String>>>,
    unreachable: AtomicBool,
    failing_command: Mutex<Option<String>>,
    dump: Mutex<String>,
}

impl RecordingConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every connect fail
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Commands starting with `prefix` exit with status 1
    pub fn fail_commands_starting_with(&self, prefix: &str) {
        *self.failing_command.lock().unwrap() = Some(prefix.to_string());
    }

    /// Output returned for the dump command
    pub fn set_dump(&self, dump: &str) {
        *self.dump.lock().unwrap() = dump.to_string();
    }

    pub fn ops(&self) -> Vec<Op> {
        self.ops.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.ops.lock().unwrap().clear();
        self.uploads.lock().unwrap().clear();
    }

    /// Executed command lines in order
    pub fn commands(&self) -> Vec<String> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                Op::Exec(command) => Some(command),
                _ => None,
            })
            .collect()
    }

    /// Contents of every uploaded file in order
    pub fn uploaded(&self) -> Vec<String> {
        self.uploads.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for RecordingConnector {
    async fn connect(
        &self,
        target: &RemoteTarget,
    ) -> Result<Box<dyn ManagementSession>, ApplyError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(ApplyError::Unreachable(format!(
                "{}: Connection refused",
                target.host
            )));
        }
        self.ops
            .lock()
            .unwrap()
            .push(Op::Connect(target.host.clone()));
        Ok(Box::new(RecordingSession {
            ops: self.ops.clone(),
            uploads: self.uploads.clone(),
            failing_command: self.failing_command.lock().unwrap().clone(),
            dump: self.dump.lock().unwrap().clone(),
        }))
    }
}

struct RecordingSession {
    ops: Arc<Mutex<Vec<Op>>>,
    uploads: Arc<Mutex<Vec<String>>>,
    failing_command: Option<String>,
    dump: String,
}

#[async_trait]
impl ManagementSession for RecordingSession {
    async fn upload(&mut self, local_path: &Path, remote_path: &str) -> Result<(), ApplyError> {
        let contents = tokio::fs::read_to_string(local_path)
            .await
            .map_err(|e| ApplyError::TransferFailed(e.to_string()))?;
        self.uploads.lock().unwrap().push(contents);
        self.ops
            .lock()
            .unwrap()
            .push(Op::Upload(remote_path.to_string()));
        Ok(())
    }

    async fn chmod(&mut self, remote_path: &str, mode: u32) -> Result<(), ApplyError> {
        self.ops
            .lock()
            .unwrap()
            .push(Op::Chmod(remote_path.to_string(), mode));
        Ok(())
    }

    async fn exec(&mut self, command: &str) -> Result<CommandOutput, ApplyError> {
        self.ops
            .lock()
            .unwrap()
            .push(Op::Exec(command.to_string()));
        if let Some(prefix) = &self.failing_command {
            if command.starts_with(prefix.as_str()) {
                return Ok(CommandOutput {
                    status: Some(1),
                    stdout: String::new(),
                    stderr: "Unable to modify interface: No such device".to_string(),
                });
            }
        }
        if command == wg_fleet::monitoring::DUMP_COMMAND {
            return Ok(CommandOutput::success(self.dump.clone()));
        }
        Ok(CommandOutput::success(""))
    }

    async fn close(&mut self) {
        self.ops.lock().unwrap().push(Op::Close);
    }
}

/// Controller settings rooted in a temporary directory, with no retries
pub fn test_settings(dir: &TempDir) -> ControllerConfig {
    ControllerConfig {
        keys_dir: dir.path().join("keys"),
        staging_dir: dir.path().join("staging"),
        connect_timeout: Duration::from_secs(1),
        operation_timeout: Duration::from_secs(5),
        retry: RetryPolicy::none(),
        ..ControllerConfig::default()
    }
}

/// A fleet over a fresh memory store and `connector`
pub fn test_fleet(dir: &TempDir, connector: Arc<RecordingConnector>) -> (Fleet, Arc<dyn Store>) {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let cache = Arc::new(MemoryTelemetryCache::new());
    let fleet = Fleet::new(store.clone(), connector, cache, test_settings(dir));
    (fleet, store)
}

/// Memory store whose server writes take `delay` to land
pub struct SlowServerWrites {
    inner: MemoryStore,
    delay: Duration,
}

impl SlowServerWrites {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryStore::new(),
            delay,
        })
    }
}

#[async_trait]
impl Store for SlowServerWrites {
    async fn insert_server(&self, server: Server) -> FleetResult<Server> {
        self.inner.insert_server(server).await
    }
    async fn update_server(&self, server: &Server) -> FleetResult<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.update_server(server).await
    }
    async fn get_server(&self, id: ServerId) -> FleetResult<Option<Server>> {
        self.inner.get_server(id).await
    }
    async fn list_servers(&self) -> FleetResult<Vec<Server>> {
        self.inner.list_servers().await
    }
    async fn find_server_by_host(
        &self,
        host: &str,
        exclude: ServerId,
    ) -> FleetResult<Option<Server>> {
        self.inner.find_server_by_host(host, exclude).await
    }
    async fn delete_server(&self, id: ServerId) -> FleetResult<Server> {
        self.inner.delete_server(id).await
    }
    async fn set_cursor(&self, id: ServerId, cursor: Ipv4Addr) -> FleetResult<()> {
        self.inner.set_cursor(id, cursor).await
    }
    async fn insert_group(&self, group: Group) -> FleetResult<Group> {
        self.inner.insert_group(group).await
    }
    async fn update_group(&self, group: &Group) -> FleetResult<()> {
        self.inner.update_group(group).await
    }
    async fn get_group(&self, id: GroupId) -> FleetResult<Option<Group>> {
        self.inner.get_group(id).await
    }
    async fn list_groups(&self) -> FleetResult<Vec<Group>> {
        self.inner.list_groups().await
    }
    async fn create_client(&self, client: Client, cursor: Ipv4Addr) -> FleetResult<Client> {
        self.inner.create_client(client, cursor).await
    }
    async fn update_client(&self, client: &Client) -> FleetResult<()> {
        self.inner.update_client(client).await
    }
    async fn get_client(&self, id: ClientId) -> FleetResult<Option<Client>> {
        self.inner.get_client(id).await
    }
    async fn find_client_by_token(&self, token: &str) -> FleetResult<Option<Client>> {
        self.inner.find_client_by_token(token).await
    }
    async fn list_clients(&self, server_id: ServerId) -> FleetResult<Vec<Client>> {
        self.inner.list_clients(server_id).await
    }
    async fn list_orphaned_clients(&self) -> FleetResult<Vec<Client>> {
        self.inner.list_orphaned_clients().await
    }
    async fn delete_client(&self, id: ClientId) -> FleetResult<Client> {
        self.inner.delete_client(id).await
    }
    async fn increment_download_count(&self, id: ClientId) -> FleetResult<u64> {
        self.inner.increment_download_count(id).await
    }
}

/// Write an executable stand-in for ssh-keygen that creates the `-f` pair
#[cfg(unix)]
pub fn fake_keygen(dir: &Path) -> std::path::PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("fake-keygen");
    let script = "#!/bin/sh\n\
                  while [ $# -gt 0 ]; do\n\
                  \x20 if [ \"$1\" = \"-f\" ]; then f=\"$2\"; fi\n\
                  \x20 shift\n\
                  done\n\
                  echo private > \"$f\"\n\
                  echo public > \"$f.pub\"\n";
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}
