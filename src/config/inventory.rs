//! Fleet inventory declared in the configuration file
//!
//! Clients refer to their group and server by name. Keys, addresses and
//! tokens may be supplied to carry over an existing deployment; anything
//! left out is generated on import.

use crate::config::validation;
use crate::error::{FleetError, Result};
use crate::model::NewServer;
use crate::wireguard::PrivateKey;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::Ipv4Addr;

/// Entities to seed the store with
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Inventory {
    /// Servers
    #[serde(default)]
    pub servers: Vec<ServerEntry>,
    /// Groups
    #[serde(default)]
    pub groups: Vec<GroupEntry>,
    /// Clients
    #[serde(default)]
    pub clients: Vec<ClientEntry>,
}

/// A server to import
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEntry {
    /// Server settings
    #[serde(flatten)]
    pub server: NewServer,
    /// Existing WireGuard private key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<PrivateKey>,
    /// Highest address already handed out
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_ip: Option<Ipv4Addr>,
}

/// A group to import
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupEntry {
    /// Group name
    pub name: String,
    /// Description
    #[serde(default)]
    pub description: String,
    /// Comma-separated allow-list
    #[serde(default)]
    pub ips: String,
}

/// A client to import
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientEntry {
    /// Client name
    pub name: String,
    /// Description
    #[serde(default)]
    pub description: String,
    /// Name of the owning group
    pub group: String,
    /// Name of the owning server
    pub server: String,
    /// Whether the peer is enabled
    #[serde(default = "default_true")]
    pub is_enabled: bool,
    /// Extra allowed ranges
    #[serde(default)]
    pub allowed: String,
    /// Whether the download link works
    #[serde(default)]
    pub enable_download: bool,
    /// Existing private key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<PrivateKey>,
    /// Existing address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<Ipv4Addr>,
    /// Existing download token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Downloads so far
    #[serde(default)]
    pub download_count: u64,
}

impl Inventory {
    /// Check names are unique and every reference resolves
    pub fn validate(&self) -> Result<()> {
        let mut servers = HashSet::new();
        for entry in &self.servers {
            if !servers.insert(entry.server.name.as_str()) {
                return Err(duplicate("server", &entry.server.name));
            }
        }

        let mut groups = HashSet::new();
        for entry in &self.groups {
            validation::normalize_allow_list(&entry.ips)?;
            if !groups.insert(entry.name.as_str()) {
                return Err(duplicate("group", &entry.name));
            }
        }

        let mut tokens = HashSet::new();
        let mut addresses = HashSet::new();
        for entry in &self.clients {
            if !groups.contains(entry.group.as_str()) {
                return Err(FleetError::Validation(format!(
                    "client '{}' refers to unknown group '{}'",
                    entry.name, entry.group
                )));
            }
            if !servers.contains(entry.server.as_str()) {
                return Err(FleetError::Validation(format!(
                    "client '{}' refers to unknown server '{}'",
                    entry.name, entry.server
                )));
            }
            if let Some(token) = &entry.token {
                validation::validate_download_token(token)?;
                if !tokens.insert(token.as_str()) {
                    return Err(duplicate("token", token));
                }
            }
            if let Some(ip) = entry.ip {
                if !addresses.insert((entry.server.as_str(), ip)) {
                    return Err(FleetError::Validation(format!(
                        "address {} is assigned twice on server '{}'",
                        ip, entry.server
                    )));
                }
            }
        }

        Ok(())
    }
}

fn duplicate(kind: &str, name: &str) -> FleetError {
    FleetError::Validation(format!("duplicate {} '{}'", kind, name))
}

fn default_true() -> bool {
    true
}
