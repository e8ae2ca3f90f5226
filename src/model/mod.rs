//! Fleet entity model
//!
//! Servers, groups and clients as plain records. Key material, addresses and
//! tokens are assigned by the control layer; the store only persists them.

mod store;

pub use store::{MemoryStore, Store};

use crate::config::validation;
use crate::error::Result;
use crate::wireguard::KeyPair;
use chrono::{DateTime, Utc};
use ipnetwork::Ipv4Network;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Server identifier
pub type ServerId = u64;
/// Group identifier
pub type GroupId = u64;
/// Client identifier
pub type ClientId = u64;

/// Default WireGuard listen port
pub const DEFAULT_PORT: u16 = 41800;
/// Default server subnet
pub const DEFAULT_NETWORK: &str = "10.10.10.0/24";
/// Default interface name
pub const DEFAULT_INTERFACE: &str = "wg0";
/// Default persistent keepalive advertised to client peers
pub const DEFAULT_KEEPALIVE: u16 = 20;
/// Default route handed to clients
pub const DEFAULT_ROUTE: &str = "0.0.0.0/0";

/// Number of hex characters in a download token
pub const TOKEN_LEN: usize = 6;

/// A WireGuard server managed over its management channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    /// Identifier, assigned by the store
    pub id: ServerId,
    /// Display name
    pub name: String,
    /// Reachable address (IP or hostname)
    pub ip: String,
    /// WireGuard listen port
    pub port: u16,
    /// Virtual subnet handed out to clients
    pub network: Ipv4Network,
    /// Server key pair
    pub keys: KeyPair,
    /// WireGuard interface name
    pub interface: String,
    /// Keepalive interval written into every client peer
    pub persistent_keepalive: u16,
    /// AllowedIPs handed to clients
    pub route: String,
    /// Highest address issued so far
    pub last_ip: Option<Ipv4Addr>,
    /// Whether the server is active
    pub is_enabled: bool,
}

impl Server {
    /// First usable host of the subnet, used as the server's own address
    pub fn interface_address(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network.network()).wrapping_add(1))
    }

    /// Route for client configs, falling back to the default route
    pub fn client_route(&self) -> &str {
        if self.route.trim().is_empty() {
            DEFAULT_ROUTE
        } else {
            &self.route
        }
    }

    /// `host:port` endpoint advertised to clients
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// Input for creating a server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewServer {
    /// Display name
    pub name: String,
    /// Reachable address (IP or hostname)
    #[serde(default = "default_ip")]
    pub ip: String,
    /// WireGuard listen port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Subnet in CIDR notation
    #[serde(default = "default_network")]
    pub network: String,
    /// Interface name
    #[serde(default = "default_interface")]
    pub interface: String,
    /// Persistent keepalive in seconds
    #[serde(default = "default_keepalive")]
    pub persistent_keepalive: u16,
    /// Route handed to clients
    #[serde(default = "default_route")]
    pub route: String,
    /// Whether the server starts enabled
    #[serde(default = "default_true")]
    pub is_enabled: bool,
}

impl NewServer {
    /// Create server input with defaults for everything but name and host
    pub fn new(name: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ip: ip.into(),
            port: DEFAULT_PORT,
            network: DEFAULT_NETWORK.to_string(),
            interface: DEFAULT_INTERFACE.to_string(),
            persistent_keepalive: DEFAULT_KEEPALIVE,
            route: DEFAULT_ROUTE.to_string(),
            is_enabled: true,
        }
    }

    /// Validate the input and build a server record with the given keys.
    /// The id is left at 0 for the store to assign.
    pub fn into_server(self, keys: KeyPair) -> Result<Server> {
        validation::validate_name("Server", &self.name)?;
        validation::validate_host(&self.ip)?;
        validation::validate_port(self.port)?;
        validation::validate_interface_name(&self.interface)?;
        validation::validate_keepalive(self.persistent_keepalive)?;
        let network = validation::parse_network(&self.network)?;
        let route = match validation::normalize_extra_allowed(&self.route)? {
            Some(route) => route,
            None => DEFAULT_ROUTE.to_string(),
        };

        Ok(Server {
            id: 0,
            name: self.name,
            ip: self.ip,
            port: self.port,
            network,
            keys,
            interface: self.interface,
            persistent_keepalive: self.persistent_keepalive,
            route,
            last_ip: None,
            is_enabled: self.is_enabled,
        })
    }
}

/// Mutable server fields. Keys, subnet and cursor are fixed at creation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerUpdate {
    /// New display name
    pub name: Option<String>,
    /// New reachable address
    pub ip: Option<String>,
    /// New listen port
    pub port: Option<u16>,
    /// New keepalive interval
    pub persistent_keepalive: Option<u16>,
    /// New client route
    pub route: Option<String>,
    /// Enable or disable
    pub is_enabled: Option<bool>,
}

impl ServerUpdate {
    /// Validate and apply the update onto a server record
    pub fn apply_to(self, server: &mut Server) -> Result<()> {
        if let Some(name) = self.name {
            validation::validate_name("Server", &name)?;
            server.name = name;
        }
        if let Some(ip) = self.ip {
            validation::validate_host(&ip)?;
            server.ip = ip;
        }
        if let Some(port) = self.port {
            validation::validate_port(port)?;
            server.port = port;
        }
        if let Some(keepalive) = self.persistent_keepalive {
            validation::validate_keepalive(keepalive)?;
            server.persistent_keepalive = keepalive;
        }
        if let Some(route) = self.route {
            server.route = validation::normalize_extra_allowed(&route)?
                .unwrap_or_else(|| DEFAULT_ROUTE.to_string());
        }
        if let Some(enabled) = self.is_enabled {
            server.is_enabled = enabled;
        }
        Ok(())
    }
}

/// A client group with its allow-list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    /// Identifier, assigned by the store
    pub id: GroupId,
    /// Display name
    pub name: String,
    /// Free-text description
    pub description: String,
    /// Normalized allow-list (one token per line)
    pub ips: String,
}

impl Group {
    /// Validate input and build a group record (id 0 until stored)
    pub fn new(name: impl Into<String>, description: impl Into<String>, ips: &str) -> Result<Self> {
        let name = name.into();
        validation::validate_name("Group", &name)?;
        Ok(Self {
            id: 0,
            name,
            description: description.into(),
            ips: validation::normalize_allow_list(ips)?,
        })
    }

    /// Whether the allow-list admits everything
    pub fn allows_all(&self) -> bool {
        self.ips == validation::ALLOW_ALL
    }
}

/// Mutable group fields
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupUpdate {
    /// New name
    pub name: Option<String>,
    /// New description
    pub description: Option<String>,
    /// New allow-list, normalized on apply
    pub ips: Option<String>,
}

impl GroupUpdate {
    /// Validate and apply the update onto a group record
    pub fn apply_to(self, group: &mut Group) -> Result<()> {
        if let Some(name) = self.name {
            validation::validate_name("Group", &name)?;
            group.name = name;
        }
        if let Some(description) = self.description {
            group.description = description;
        }
        if let Some(ips) = self.ips {
            group.ips = validation::normalize_allow_list(&ips)?;
        }
        Ok(())
    }
}

/// A VPN client peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    /// Identifier, assigned by the store
    pub id: ClientId,
    /// Display name
    pub name: String,
    /// Free-text description
    #[serde(default)]
    pub description: String,
    /// Owning group
    pub group_id: GroupId,
    /// Owning server, `None` once the server is removed
    pub server_id: Option<ServerId>,
    /// Whether the peer is active
    pub is_enabled: bool,
    /// Peer key pair
    pub keys: KeyPair,
    /// Address inside the server subnet
    pub ip: Ipv4Addr,
    /// Extra allowed ranges appended after the `/32`
    pub allowed: Option<String>,
    /// Download token
    pub token: String,
    /// Whether the token link works
    pub enable_download: bool,
    /// Successful token downloads
    pub download_count: u64,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
}

impl Client {
    /// Value of the `AllowedIPs` line for this client's peer block
    pub fn allowed_ips(&self) -> String {
        match &self.allowed {
            Some(extra) if !extra.is_empty() => format!("{}/32,{}", self.ip, extra),
            _ => format!("{}/32", self.ip),
        }
    }

    /// Download file name
    pub fn config_filename(&self) -> String {
        format!("vpn-wg-{}.conf", self.id)
    }
}

/// Input for creating a client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewClient {
    /// Display name
    pub name: String,
    /// Free-text description
    #[serde(default)]
    pub description: String,
    /// Owning group
    pub group_id: GroupId,
    /// Owning server
    pub server_id: ServerId,
    /// Whether the peer starts enabled
    #[serde(default = "default_true")]
    pub is_enabled: bool,
    /// Extra allowed ranges, comma-separated
    #[serde(default)]
    pub allowed: String,
    /// Whether the token link works
    #[serde(default)]
    pub enable_download: bool,
}

impl NewClient {
    /// Client input with defaults
    pub fn new(name: impl Into<String>, group_id: GroupId, server_id: ServerId) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            group_id,
            server_id,
            is_enabled: true,
            allowed: String::new(),
            enable_download: false,
        }
    }

    /// Validate the input and build a client record around allocated state
    pub fn into_client(self, keys: KeyPair, ip: Ipv4Addr, token: String) -> Result<Client> {
        validation::validate_name("Client", &self.name)?;
        let allowed = validation::normalize_extra_allowed(&self.allowed)?;
        let now = Utc::now();

        Ok(Client {
            id: 0,
            name: self.name,
            description: self.description,
            group_id: self.group_id,
            server_id: Some(self.server_id),
            is_enabled: self.is_enabled,
            keys,
            ip,
            allowed,
            token,
            enable_download: self.enable_download,
            download_count: 0,
            created_at: now,
            updated_at: now,
        })
    }
}

/// Mutable client fields. Keys, address, token and server are fixed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientUpdate {
    /// New display name
    pub name: Option<String>,
    /// New description
    pub description: Option<String>,
    /// New group
    pub group_id: Option<GroupId>,
    /// Enable or disable the peer
    pub is_enabled: Option<bool>,
    /// Replace the extra allowed ranges
    pub allowed: Option<String>,
    /// Toggle the download link
    pub enable_download: Option<bool>,
}

impl ClientUpdate {
    /// Validate and apply the update onto a client record
    pub fn apply_to(self, client: &mut Client) -> Result<()> {
        if let Some(name) = self.name {
            validation::validate_name("Client", &name)?;
            client.name = name;
        }
        if let Some(description) = self.description {
            client.description = description;
        }
        if let Some(group_id) = self.group_id {
            client.group_id = group_id;
        }
        if let Some(enabled) = self.is_enabled {
            client.is_enabled = enabled;
        }
        if let Some(allowed) = self.allowed {
            client.allowed = validation::normalize_extra_allowed(&allowed)?;
        }
        if let Some(enable_download) = self.enable_download {
            client.enable_download = enable_download;
        }
        client.updated_at = Utc::now();
        Ok(())
    }
}

/// Generate a random download token (6 lowercase hex characters)
pub fn generate_token() -> String {
    let value: u32 = rand::thread_rng().gen_range(0..(1 << (4 * TOKEN_LEN)));
    format!("{:0width$x}", value, width = TOKEN_LEN)
}

fn default_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_network() -> String {
    DEFAULT_NETWORK.to_string()
}

fn default_interface() -> String {
    DEFAULT_INTERFACE.to_string()
}

fn default_keepalive() -> u16 {
    DEFAULT_KEEPALIVE
}

fn default_route() -> String {
    DEFAULT_ROUTE.to_string()
}

fn default_true() -> bool {
    true
}
