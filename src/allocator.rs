//! Client address allocation
//!
//! Each server hands out addresses from its subnet by advancing a cursor
//! (`Server::last_ip`). Reading the cursor, computing the next address and
//! persisting it happen under one per-server lock, so two concurrent client
//! creations can never receive the same address.

use crate::error::{FleetError, Result};
use crate::model::{Client, ServerId, Store};
use ipnetwork::Ipv4Network;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

/// Async mutexes keyed by server id, created on first use
#[derive(Debug, Default)]
pub struct ServerLocks {
    locks: Mutex<HashMap<ServerId, Arc<Mutex<()>>>>,
}

impl ServerLocks {
    /// Create an empty lock table
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `server_id`
    pub async fn lock(&self, server_id: ServerId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(server_id).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// Address following `cursor`, or the first host when nothing was issued.
///
/// There is no upper bound check: past the broadcast address this keeps
/// counting out of the subnet.
pub fn next_address(network: Ipv4Network, cursor: Option<Ipv4Addr>) -> Ipv4Addr {
    let base = match cursor {
        Some(last) => u32::from(last),
        None => u32::from(network.network()),
    };
    Ipv4Addr::from(base.wrapping_add(1))
}

/// Serializes cursor updates per server
#[derive(Debug, Default)]
pub struct AddressAllocator {
    locks: ServerLocks,
}

impl AddressAllocator {
    /// Create an allocator
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold the allocation lock of `server_id`, for writes to the server
    /// record that must not interleave with an allocation
    pub async fn hold(&self, server_id: ServerId) -> OwnedMutexGuard<()> {
        self.locks.lock(server_id).await
    }

    /// Issue the next address on `server_id` and persist the cursor
    pub async fn allocate(&self, store: &dyn Store, server_id: ServerId) -> Result<Ipv4Addr> {
        let _guard = self.locks.lock(server_id).await;
        let network_and_cursor = load_cursor(store, server_id).await?;
        let ip = issue(server_id, network_and_cursor);
        store.set_cursor(server_id, ip).await?;
        Ok(ip)
    }

    /// Issue the next address on `server_id` and create the client built by
    /// `build` in the same store transaction as the cursor update.
    pub async fn allocate_client<F>(
        &self,
        store: &dyn Store,
        server_id: ServerId,
        build: F,
    ) -> Result<Client>
    where
        F: FnOnce(Ipv4Addr) -> Result<Client> + Send,
    {
        let _guard = self.locks.lock(server_id).await;
        let network_and_cursor = load_cursor(store, server_id).await?;
        let ip = issue(server_id, network_and_cursor);
        let client = build(ip)?;
        store.create_client(client, ip).await
    }

    /// Store a client whose address was assigned elsewhere. The address must
    /// not be held by another client of the server. The cursor only moves
    /// forward, so later allocations land past every imported address.
    pub async fn insert_assigned(
        &self,
        store: &dyn Store,
        server_id: ServerId,
        client: Client,
    ) -> Result<Client> {
        let _guard = self.locks.lock(server_id).await;
        let (network, cursor) = load_cursor(store, server_id).await?;
        if !network.contains(client.ip) {
            return Err(FleetError::Validation(format!(
                "address {} is outside {}",
                client.ip, network
            )));
        }
        let held = store.list_clients(server_id).await?;
        if let Some(holder) = held.iter().find(|c| c.ip == client.ip) {
            return Err(FleetError::Validation(format!(
                "address {} on server {} is already held by client {}",
                client.ip, server_id, holder.name
            )));
        }
        let cursor = match cursor {
            Some(last) if last > client.ip => last,
            _ => client.ip,
        };
        store.create_client(client, cursor).await
    }
}

async fn load_cursor(
    store: &dyn Store,
    server_id: ServerId,
) -> Result<(Ipv4Network, Option<Ipv4Addr>)> {
    let server = store
        .get_server(server_id)
        .await?
        .ok_or_else(|| FleetError::NotFound(format!("server {}", server_id)))?;
    Ok((server.network, server.last_ip))
}

fn issue(server_id: ServerId, (network, cursor): (Ipv4Network, Option<Ipv4Addr>)) -> Ipv4Addr {
    let ip = next_address(network, cursor);
    if !network.contains(ip) || ip == network.broadcast() {
        warn!(
            "Server {} subnet {} is exhausted, issuing out-of-range address {}",
            server_id, network, ip
        );
    }
    debug!("Server {} allocated {}", server_id, ip);
    ip
}
