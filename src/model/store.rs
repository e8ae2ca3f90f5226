//! Entity persistence seam
//!
//! `Store` is the collaborator that owns durable records. The controller
//! never reaches for global state; it is handed a store. `MemoryStore` is the
//! in-process implementation used by the binary and the tests.

use super::{Client, ClientId, Group, GroupId, Server, ServerId};
use crate::error::{FleetError, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use tokio::sync::RwLock;
use tracing::debug;

/// Durable storage for servers, groups and clients
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a server, returning it with its assigned id
    async fn insert_server(&self, server: Server) -> Result<Server>;
    /// Replace a stored server record. The stored cursor is kept; only
    /// `set_cursor` and `create_client` move it.
    async fn update_server(&self, server: &Server) -> Result<()>;
    /// Look up a server
    async fn get_server(&self, id: ServerId) -> Result<Option<Server>>;
    /// All servers ordered by id
    async fn list_servers(&self) -> Result<Vec<Server>>;
    /// First server (lowest id) reachable at `host`, other than `exclude`
    async fn find_server_by_host(&self, host: &str, exclude: ServerId) -> Result<Option<Server>>;
    /// Remove a server and orphan its clients
    async fn delete_server(&self, id: ServerId) -> Result<Server>;
    /// Store a new cursor value on a server
    async fn set_cursor(&self, id: ServerId, cursor: Ipv4Addr) -> Result<()>;

    /// Insert a group, returning it with its assigned id
    async fn insert_group(&self, group: Group) -> Result<Group>;
    /// Replace a stored group record
    async fn update_group(&self, group: &Group) -> Result<()>;
    /// Look up a group
    async fn get_group(&self, id: GroupId) -> Result<Option<Group>>;
    /// All groups ordered by id
    async fn list_groups(&self) -> Result<Vec<Group>>;

    /// Insert a client and move its server's cursor to `cursor` in one
    /// transaction
    async fn create_client(&self, client: Client, cursor: Ipv4Addr) -> Result<Client>;
    /// Replace a stored client record
    async fn update_client(&self, client: &Client) -> Result<()>;
    /// Look up a client
    async fn get_client(&self, id: ClientId) -> Result<Option<Client>>;
    /// Look up a client by download token
    async fn find_client_by_token(&self, token: &str) -> Result<Option<Client>>;
    /// Clients attached to a server, ordered by id
    async fn list_clients(&self, server_id: ServerId) -> Result<Vec<Client>>;
    /// Clients whose server was removed
    async fn list_orphaned_clients(&self) -> Result<Vec<Client>>;
    /// Remove a client, returning the removed record
    async fn delete_client(&self, id: ClientId) -> Result<Client>;
    /// Atomically bump a client's download counter, returning the new value
    async fn increment_download_count(&self, id: ClientId) -> Result<u64>;
}

#[derive(Debug, Default)]
struct Tables {
    next_id: u64,
    servers: BTreeMap<ServerId, Server>,
    groups: BTreeMap<GroupId, Group>,
    clients: BTreeMap<ClientId, Client>,
}

impl Tables {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-memory store guarded by a single async lock
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

fn missing(kind: &str, id: u64) -> FleetError {
    FleetError::NotFound(format!("{} {}", kind, id))
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_server(&self, mut server: Server) -> Result<Server> {
        let mut tables = self.tables.write().await;
        server.id = tables.allocate_id();
        tables.servers.insert(server.id, server.clone());
        debug!("Stored server {} ({})", server.id, server.name);
        Ok(server)
    }

    async fn update_server(&self, server: &Server) -> Result<()> {
        let mut tables = self.tables.write().await;
        let slot = tables
            .servers
            .get_mut(&server.id)
            .ok_or_else(|| missing("server", server.id))?;
        let cursor = slot.last_ip;
        *slot = server.clone();
        slot.last_ip = cursor;
        Ok(())
    }

    async fn get_server(&self, id: ServerId) -> Result<Option<Server>> {
        Ok(self.tables.read().await.servers.get(&id).cloned())
    }

    async fn list_servers(&self) -> Result<Vec<Server>> {
        Ok(self.tables.read().await.servers.values().cloned().collect())
    }

    async fn find_server_by_host(&self, host: &str, exclude: ServerId) -> Result<Option<Server>> {
        Ok(self
            .tables
            .read()
            .await
            .servers
            .values()
            .find(|s| s.id != exclude && s.ip == host)
            .cloned())
    }

    async fn delete_server(&self, id: ServerId) -> Result<Server> {
        let mut tables = self.tables.write().await;
        let server = tables.servers.remove(&id).ok_or_else(|| missing("server", id))?;
        for client in tables.clients.values_mut() {
            if client.server_id == Some(id) {
                client.server_id = None;
            }
        }
        Ok(server)
    }

    async fn set_cursor(&self, id: ServerId, cursor: Ipv4Addr) -> Result<()> {
        let mut tables = self.tables.write().await;
        let server = tables.servers.get_mut(&id).ok_or_else(|| missing("server", id))?;
        server.last_ip = Some(cursor);
        Ok(())
    }

    async fn insert_group(&self, mut group: Group) -> Result<Group> {
        let mut tables = self.tables.write().await;
        group.id = tables.allocate_id();
        tables.groups.insert(group.id, group.clone());
        Ok(group)
    }

    async fn update_group(&self, group: &Group) -> Result<()> {
        let mut tables = self.tables.write().await;
        let slot = tables
            .groups
            .get_mut(&group.id)
            .ok_or_else(|| missing("group", group.id))?;
        *slot = group.clone();
        Ok(())
    }

    async fn get_group(&self, id: GroupId) -> Result<Option<Group>> {
        Ok(self.tables.read().await.groups.get(&id).cloned())
    }

    async fn list_groups(&self) -> Result<Vec<Group>> {
        Ok(self.tables.read().await.groups.values().cloned().collect())
    }

    async fn create_client(&self, mut client: Client, cursor: Ipv4Addr) -> Result<Client> {
        let mut tables = self.tables.write().await;
        let server_id = client
            .server_id
            .ok_or_else(|| FleetError::Validation("Client must belong to a server".to_string()))?;
        if !tables.groups.contains_key(&client.group_id) {
            return Err(missing("group", client.group_id));
        }
        let server = tables
            .servers
            .get_mut(&server_id)
            .ok_or_else(|| missing("server", server_id))?;
        server.last_ip = Some(cursor);

        client.id = tables.allocate_id();
        tables.clients.insert(client.id, client.clone());
        debug!("Stored client {} ({}) at {}", client.id, client.name, client.ip);
        Ok(client)
    }

    async fn update_client(&self, client: &Client) -> Result<()> {
        let mut tables = self.tables.write().await;
        let slot = tables
            .clients
            .get_mut(&client.id)
            .ok_or_else(|| missing("client", client.id))?;
        *slot = client.clone();
        Ok(())
    }

    async fn get_client(&self, id: ClientId) -> Result<Option<Client>> {
        Ok(self.tables.read().await.clients.get(&id).cloned())
    }

    async fn find_client_by_token(&self, token: &str) -> Result<Option<Client>> {
        Ok(self
            .tables
            .read()
            .await
            .clients
            .values()
            .find(|c| c.token == token)
            .cloned())
    }

    async fn list_clients(&self, server_id: ServerId) -> Result<Vec<Client>> {
        Ok(self
            .tables
            .read()
            .await
            .clients
            .values()
            .filter(|c| c.server_id == Some(server_id))
            .cloned()
            .collect())
    }

    async fn list_orphaned_clients(&self) -> Result<Vec<Client>> {
        Ok(self
            .tables
            .read()
            .await
            .clients
            .values()
            .filter(|c| c.server_id.is_none())
            .cloned()
            .collect())
    }

    async fn delete_client(&self, id: ClientId) -> Result<Client> {
        self.tables
            .write()
            .await
            .clients
            .remove(&id)
            .ok_or_else(|| missing("client", id))
    }

    async fn increment_download_count(&self, id: ClientId) -> Result<u64> {
        let mut tables = self.tables.write().await;
        let client = tables.clients.get_mut(&id).ok_or_else(|| missing("client", id))?;
        client.download_count += 1;
        Ok(client.download_count)
    }
}
