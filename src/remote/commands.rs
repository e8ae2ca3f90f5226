//! Remote command lines
//!
//! Every value interpolated here has been validated on write (interface
//! names, keys, addresses), so only paths from configuration get quoted.

use crate::model::{Client, Server};
use crate::wireguard::PublicKey;

/// Command dumping live peer state of every interface
pub const DUMP_COMMAND: &str = "wg show all dump";

/// wg-quick service action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    /// Restart the interface
    Restart,
    /// Bring the interface down
    Stop,
}

impl ServiceAction {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Restart => "restart",
            Self::Stop => "stop",
        }
    }
}

/// Add or update `client` as a live peer on `server`
pub fn peer_upsert(server: &Server, client: &Client) -> String {
    format!(
        "wg set {} peer {} allowed-ips {} persistent-keepalive {}",
        server.interface,
        client.keys.public,
        client.allowed_ips(),
        server.persistent_keepalive
    )
}

/// Remove the peer `public_key` from `interface`
pub fn peer_remove(interface: &str, public_key: &PublicKey) -> String {
    format!("wg set {} peer {} remove", interface, public_key)
}

/// Run a wg-quick service action
pub fn service(interface: &str, action: ServiceAction) -> String {
    format!("service wg-quick@{} {}", interface, action.as_str())
}

/// Set the mode of a remote file
pub fn chmod(path: &str, mode: u32) -> String {
    format!("chmod {:o} {}", mode, shell_quote(path))
}

/// Remote location of an interface's config
pub fn remote_config_path(remote_config_dir: &str, interface: &str) -> String {
    format!(
        "{}/{}.conf",
        remote_config_dir.trim_end_matches('/'),
        interface
    )
}

/// Single-quote `value` for a POSIX shell
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
