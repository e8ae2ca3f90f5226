//! Fleet orchestration
//!
//! `Fleet` is the entry point for every entity mutation. It validates input,
//! persists records, assigns keys, addresses and tokens, and then hands the
//! affected server to the reconcile queue. A failed remote step never undoes
//! the local mutation; it comes back as an [`ApplyReport`].

use super::queue::{ReconcileQueue, ServerStats};
use crate::allocator::AddressAllocator;
use crate::config::{ControllerConfig, Inventory};
use crate::error::{FleetError, Result};
use crate::model::{
    generate_token, Client, ClientId, ClientUpdate, Group, GroupId, GroupUpdate, NewClient,
    NewServer, Server, ServerId, ServerUpdate, Store,
};
use crate::monitoring::{ClientTelemetry, StatsCollector, TelemetryCache};
use crate::remote::{ApplyOptions, ApplyReport, Connector, CredentialStore, RemoteApplier};
use crate::security::{require_privileged, Actor};
use crate::wireguard::{render_client_config, render_server_config, KeyPair};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Token draws before giving up on finding an unused one
const MAX_TOKEN_ATTEMPTS: usize = 64;

/// An entity after a mutation, with the outcome of the remote step if one ran
#[derive(Debug, Clone, Serialize)]
pub struct Reconciled<T> {
    /// The entity as persisted
    pub entity: T,
    /// Remote outcome, `None` when nothing was pushed
    pub report: Option<ApplyReport>,
}

impl<T> Reconciled<T> {
    fn local(entity: T) -> Self {
        Self {
            entity,
            report: None,
        }
    }
}

/// Counts of entities created by an inventory import
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    /// Servers created
    pub servers: usize,
    /// Groups created
    pub groups: usize,
    /// Clients created
    pub clients: usize,
}

/// Provisioning and reconciliation engine
pub struct Fleet {
    store: Arc<dyn Store>,
    allocator: AddressAllocator,
    queue: ReconcileQueue,
    credentials: CredentialStore,
    cache: Arc<dyn TelemetryCache>,
    settings: ControllerConfig,
}

impl Fleet {
    /// Build a fleet over `store`, reaching servers through `connector`
    pub fn new(
        store: Arc<dyn Store>,
        connector: Arc<dyn Connector>,
        cache: Arc<dyn TelemetryCache>,
        settings: ControllerConfig,
    ) -> Self {
        let credentials = CredentialStore::new(settings.keys_dir.clone());
        Self::with_credentials(store, connector, cache, settings, credentials)
    }

    /// Build a fleet whose management identities live in `credentials`.
    /// The same store provisions identities and supplies them to sessions.
    pub fn with_credentials(
        store: Arc<dyn Store>,
        connector: Arc<dyn Connector>,
        cache: Arc<dyn TelemetryCache>,
        settings: ControllerConfig,
        credentials: CredentialStore,
    ) -> Self {
        let applier = RemoteApplier::new(connector.clone(), credentials.clone(), settings.clone());
        let collector = StatsCollector::new(
            connector,
            cache.clone(),
            settings.telemetry_ttl,
            settings.operation_timeout,
        );
        let queue = ReconcileQueue::new(store.clone(), applier, collector, settings.retry);

        Self {
            store,
            allocator: AddressAllocator::new(),
            queue,
            credentials,
            cache,
            settings,
        }
    }

    /// Entity store
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Telemetry cache
    pub fn cache(&self) -> &Arc<dyn TelemetryCache> {
        &self.cache
    }

    /// Management identities
    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    async fn server(&self, id: ServerId) -> Result<Server> {
        self.store
            .get_server(id)
            .await?
            .ok_or_else(|| FleetError::NotFound(format!("server {}", id)))
    }

    async fn group(&self, id: GroupId) -> Result<Group> {
        self.store
            .get_group(id)
            .await?
            .ok_or_else(|| FleetError::NotFound(format!("group {}", id)))
    }

    async fn client(&self, id: ClientId) -> Result<Client> {
        self.store
            .get_client(id)
            .await?
            .ok_or_else(|| FleetError::NotFound(format!("client {}", id)))
    }

    async fn reconcile(
        &self,
        server_id: ServerId,
        changed: Option<Client>,
        options: ApplyOptions,
    ) -> ApplyReport {
        let result = self.queue.apply(server_id, changed, options).await;
        ApplyReport::from(&result)
    }

    // ---- servers ----

    /// Create a server with a fresh key pair and management identity
    pub async fn create_server(&self, actor: &Actor, input: NewServer) -> Result<Reconciled<Server>> {
        require_privileged(actor, "create servers")?;
        let server = input.into_server(KeyPair::generate())?;
        let server = self.store.insert_server(server).await?;

        if let Err(e) = self.provision_credentials(server.id).await {
            warn!("Dropping server {} ({}): {}", server.id, server.name, e);
            self.store.delete_server(server.id).await?;
            return Err(e);
        }
        info!("Created server {} ({}) on {}", server.id, server.name, server.network);

        if server.is_enabled {
            return Ok(Reconciled::local(server));
        }
        let report = self.reconcile(server.id, None, ApplyOptions::stop()).await;
        Ok(Reconciled {
            entity: server,
            report: Some(report),
        })
    }

    /// Make sure a server has a management identity, reusing the one of
    /// another server on the same host
    pub async fn provision_credentials(&self, server_id: ServerId) -> Result<()> {
        let server = self.server(server_id).await?;
        if self.credentials.exists(server_id) {
            return Ok(());
        }
        let sibling = self.store.find_server_by_host(&server.ip, server_id).await?;
        self.credentials
            .provision(server_id, sibling.map(|s| s.id))
            .await?;
        info!(
            "Authorize the controller on {} with: {}",
            server.ip,
            self.credentials
                .ssh_copy_id_hint(&server, &self.settings.ssh_user)
        );
        Ok(())
    }

    /// Update a server; a disabled server gets its service stopped
    pub async fn update_server(
        &self,
        actor: &Actor,
        id: ServerId,
        update: ServerUpdate,
    ) -> Result<Reconciled<Server>> {
        require_privileged(actor, "update servers")?;
        let server = {
            let _guard = self.allocator.hold(id).await;
            let mut server = self.server(id).await?;
            update.apply_to(&mut server)?;
            self.store.update_server(&server).await?;
            server
        };
        info!("Updated server {} ({})", server.id, server.name);

        if server.is_enabled {
            return Ok(Reconciled::local(server));
        }
        let report = self.reconcile(id, None, ApplyOptions::stop()).await;
        Ok(Reconciled {
            entity: server,
            report: Some(report),
        })
    }

    /// Delete a server. Its clients stay, without a server.
    pub async fn delete_server(&self, actor: &Actor, id: ServerId) -> Result<Server> {
        require_privileged(actor, "delete servers")?;
        let server = self.store.delete_server(id).await?;
        self.queue.forget(id).await;
        info!("Deleted server {} ({}); its clients are now orphaned", id, server.name);
        Ok(server)
    }

    /// Push the full config and restart the service. A disabled server is
    /// enabled afterwards whatever the outcome.
    pub async fn restart_server(&self, actor: &Actor, id: ServerId) -> Result<Reconciled<Server>> {
        require_privileged(actor, "restart servers")?;
        let report = self.reconcile(id, None, ApplyOptions::restart()).await;

        let server = {
            let _guard = self.allocator.hold(id).await;
            let mut server = self.server(id).await?;
            if !server.is_enabled {
                server.is_enabled = true;
                self.store.update_server(&server).await?;
                info!("Server {} re-enabled after restart", id);
            }
            server
        };
        Ok(Reconciled {
            entity: server,
            report: Some(report),
        })
    }

    /// Reinstall the config without a peer change or service action
    pub async fn sync_server(
        &self,
        actor: &Actor,
        id: ServerId,
        options: ApplyOptions,
    ) -> Result<ApplyReport> {
        require_privileged(actor, "apply server configs")?;
        self.server(id).await?;
        Ok(self.reconcile(id, None, options).await)
    }

    /// Rendered config of a server as it would be installed
    pub async fn server_config(&self, actor: &Actor, id: ServerId) -> Result<String> {
        require_privileged(actor, "read server configs")?;
        let server = self.server(id).await?;
        let clients = self.store.list_clients(id).await?;
        Ok(render_server_config(&server, &clients).to_string())
    }

    // ---- groups ----

    /// Create a group with a validated allow-list
    pub async fn create_group(
        &self,
        actor: &Actor,
        name: &str,
        description: &str,
        ips: &str,
    ) -> Result<Group> {
        require_privileged(actor, "create groups")?;
        let group = self
            .store
            .insert_group(Group::new(name, description, ips)?)
            .await?;
        info!("Created group {} ({})", group.id, group.name);
        Ok(group)
    }

    /// Update a group
    pub async fn update_group(&self, actor: &Actor, id: GroupId, update: GroupUpdate) -> Result<Group> {
        require_privileged(actor, "update groups")?;
        let mut group = self.group(id).await?;
        update.apply_to(&mut group)?;
        self.store.update_group(&group).await?;
        debug!("Updated group {}", id);
        Ok(group)
    }

    // ---- clients ----

    async fn unused_token(&self) -> Result<String> {
        for _ in 0..MAX_TOKEN_ATTEMPTS {
            let token = generate_token();
            if self.store.find_client_by_token(&token).await?.is_none() {
                return Ok(token);
            }
        }
        Err(FleetError::InvalidState(format!(
            "no unused download token after {} attempts",
            MAX_TOKEN_ATTEMPTS
        )))
    }

    /// Create a client: allocate its address, keys and token, then add it
    /// to its server
    pub async fn create_client(&self, actor: &Actor, input: NewClient) -> Result<Reconciled<Client>> {
        require_privileged(actor, "create clients")?;
        let server_id = input.server_id;
        self.group(input.group_id).await?;
        self.server(server_id).await?;

        let token = self.unused_token().await?;
        let keys = KeyPair::generate();
        let client = self
            .allocator
            .allocate_client(self.store.as_ref(), server_id, move |ip| {
                input.into_client(keys, ip, token)
            })
            .await?;
        info!(
            "Created client {} ({}) at {} on server {}",
            client.id, client.name, client.ip, server_id
        );

        let report = self
            .reconcile(server_id, Some(client.clone()), ApplyOptions::default())
            .await;
        Ok(Reconciled {
            entity: client,
            report: Some(report),
        })
    }

    /// Update a client and upsert or remove its peer
    pub async fn update_client(
        &self,
        actor: &Actor,
        id: ClientId,
        update: ClientUpdate,
    ) -> Result<Reconciled<Client>> {
        require_privileged(actor, "update clients")?;
        let mut client = self.client(id).await?;
        if let Some(group_id) = update.group_id {
            self.group(group_id).await?;
        }
        update.apply_to(&mut client)?;
        self.store.update_client(&client).await?;
        info!("Updated client {} ({}), enabled={}", client.id, client.name, client.is_enabled);

        let Some(server_id) = client.server_id else {
            debug!("Client {} has no server; nothing to reconcile", id);
            return Ok(Reconciled::local(client));
        };
        let report = self
            .reconcile(server_id, Some(client.clone()), ApplyOptions::default())
            .await;
        Ok(Reconciled {
            entity: client,
            report: Some(report),
        })
    }

    /// Delete a client and remove its peer from the server
    pub async fn delete_client(&self, actor: &Actor, id: ClientId) -> Result<Reconciled<Client>> {
        require_privileged(actor, "delete clients")?;
        let client = self.store.delete_client(id).await?;
        info!("Deleted client {} ({})", client.id, client.name);

        let Some(server_id) = client.server_id else {
            return Ok(Reconciled::local(client));
        };
        let mut removed = client.clone();
        removed.is_enabled = false;
        let report = self
            .reconcile(server_id, Some(removed), ApplyOptions::default())
            .await;
        Ok(Reconciled {
            entity: client,
            report: Some(report),
        })
    }

    /// Config document of a client, for operators
    pub async fn client_config(&self, actor: &Actor, id: ClientId) -> Result<String> {
        require_privileged(actor, "read client configs")?;
        let client = self.client(id).await?;
        let server_id = client.server_id.ok_or_else(|| {
            FleetError::InvalidState(format!("client {} has no server", id))
        })?;
        let server = self.server(server_id).await?;
        Ok(render_client_config(&client, &server).to_string())
    }

    // ---- telemetry ----

    /// Refresh the telemetry of every peer on a server
    pub async fn refresh_stats(&self, actor: &Actor, server_id: ServerId) -> Result<ServerStats> {
        require_privileged(actor, "read server statistics")?;
        self.queue.collect(server_id).await
    }

    /// Cached telemetry of one client, `-` where unknown
    pub async fn client_telemetry(&self, id: ClientId) -> Result<ClientTelemetry> {
        let client = self.client(id).await?;
        Ok(ClientTelemetry::for_client(&client, self.cache.as_ref()))
    }

    // ---- inventory ----

    /// Seed the store from a configuration inventory. Nothing is pushed to
    /// servers; the inventory describes state that already exists.
    pub async fn import_inventory(&self, actor: &Actor, inventory: &Inventory) -> Result<ImportSummary> {
        require_privileged(actor, "import inventory")?;
        inventory.validate()?;
        let mut summary = ImportSummary::default();

        let mut servers: HashMap<&str, ServerId> = HashMap::new();
        for entry in &inventory.servers {
            let keys = match &entry.private_key {
                Some(private) => KeyPair::from_private(private.clone()),
                None => KeyPair::generate(),
            };
            let mut server = entry.server.clone().into_server(keys)?;
            server.last_ip = entry.last_ip;
            let server = self.store.insert_server(server).await?;
            servers.insert(entry.server.name.as_str(), server.id);
            summary.servers += 1;
        }

        let mut groups: HashMap<&str, GroupId> = HashMap::new();
        for entry in &inventory.groups {
            let group = self
                .store
                .insert_group(Group::new(entry.name.clone(), entry.description.clone(), &entry.ips)?)
                .await?;
            groups.insert(entry.name.as_str(), group.id);
            summary.groups += 1;
        }

        for entry in &inventory.clients {
            let (Some(&group_id), Some(&server_id)) = (
                groups.get(entry.group.as_str()),
                servers.get(entry.server.as_str()),
            ) else {
                // validate() has already resolved every reference
                continue;
            };

            let mut input = NewClient::new(entry.name.clone(), group_id, server_id);
            input.description = entry.description.clone();
            input.is_enabled = entry.is_enabled;
            input.allowed = entry.allowed.clone();
            input.enable_download = entry.enable_download;

            let keys = match &entry.private_key {
                Some(private) => KeyPair::from_private(private.clone()),
                None => KeyPair::generate(),
            };
            let token = match &entry.token {
                Some(token) => token.clone(),
                None => self.unused_token().await?,
            };
            let download_count = entry.download_count;

            let client = match entry.ip {
                Some(ip) => {
                    let mut client = input.into_client(keys, ip, token)?;
                    client.download_count = download_count;
                    self.allocator
                        .insert_assigned(self.store.as_ref(), server_id, client)
                        .await?
                }
                None => {
                    self.allocator
                        .allocate_client(self.store.as_ref(), server_id, move |ip| {
                            let mut client = input.into_client(keys, ip, token)?;
                            client.download_count = download_count;
                            Ok(client)
                        })
                        .await?
                }
            };
            debug!("Imported client {} ({}) at {}", client.id, client.name, client.ip);
            summary.clients += 1;
        }

        if summary == ImportSummary::default() {
            warn!("Inventory is empty");
        } else {
            info!(
                "Imported {} servers, {} groups, {} clients",
                summary.servers, summary.groups, summary.clients
            );
        }
        Ok(summary)
    }
}
