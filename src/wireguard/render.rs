//! Peer configuration rendering
//!
//! Turns entity snapshots into wg-quick documents. Rendering is pure: no I/O
//! and no mutation of the inputs.

use crate::model::{Client, Server};
use std::fmt;

/// DNS servers pushed to clients
pub const CLIENT_DNS: &str = "1.1.1.1,8.8.8.8";

/// An ordered `key = value` section with optional comment lines
#[derive(Debug, Clone, PartialEq, Eq)]
struct Section {
    header: &'static str,
    lines: Vec<String>,
}

impl Section {
    fn new(header: &'static str) -> Self {
        Self {
            header,
            lines: Vec::new(),
        }
    }

    fn comment(mut self, key: &str, value: impl fmt::Display) -> Self {
        self.lines.push(format!("# {} = {}", key, value));
        self
    }

    fn field(mut self, key: &str, value: impl fmt::Display) -> Self {
        self.lines.push(format!("{} = {}", key, value));
        self
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[{}]", self.header)?;
        for line in &self.lines {
            writeln!(f, "{}", line)?;
        }
        Ok(())
    }
}

/// `[Interface]` block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceBlock(Section);

impl fmt::Display for InterfaceBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// `[Peer]` block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerBlock(Section);

impl fmt::Display for PeerBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Configuration handed to a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientDocument {
    /// The client's own interface
    pub interface: InterfaceBlock,
    /// The server peer
    pub peer: PeerBlock,
}

impl fmt::Display for ClientDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\n{}", self.interface, self.peer)
    }
}

/// Configuration installed on a server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerDocument {
    /// The server interface
    pub interface: InterfaceBlock,
    /// One peer per enabled client
    pub peers: Vec<PeerBlock>,
}

impl fmt::Display for ServerDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.interface)?;
        for peer in &self.peers {
            write!(f, "\n{}", peer)?;
        }
        Ok(())
    }
}

/// Render the document a client imports to reach `server`
pub fn render_client_config(client: &Client, server: &Server) -> ClientDocument {
    let interface = Section::new("Interface")
        .field("Address", format_args!("{}/32", client.ip))
        .field("PrivateKey", client.keys.private.to_base64())
        .field("DNS", CLIENT_DNS);

    let peer = Section::new("Peer")
        .field("Endpoint", server.endpoint())
        .field("PublicKey", server.keys.public)
        .field("AllowedIPs", server.client_route());

    ClientDocument {
        interface: InterfaceBlock(interface),
        peer: PeerBlock(peer),
    }
}

/// Peer block for one client on its server
pub fn render_client_peer(client: &Client, server: &Server) -> PeerBlock {
    PeerBlock(
        Section::new("Peer")
            .comment("Name", &client.name)
            .field("PublicKey", client.keys.public)
            .field("AllowedIPs", client.allowed_ips())
            .field("PersistentKeepalive", server.persistent_keepalive),
    )
}

/// Render the server document. Only enabled clients attached to `server`
/// become peers, in the order given.
pub fn render_server_config(server: &Server, clients: &[Client]) -> ServerDocument {
    let interface = Section::new("Interface")
        .field(
            "Address",
            format_args!("{}/{}", server.interface_address(), server.network.prefix()),
        )
        .field("PrivateKey", server.keys.private.to_base64())
        .field("ListenPort", server.port)
        .field("Table", "off");

    let peers = clients
        .iter()
        .filter(|c| c.is_enabled && c.server_id == Some(server.id))
        .map(|c| render_client_peer(c, server))
        .collect();

    ServerDocument {
        interface: InterfaceBlock(interface),
        peers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NewClient, NewServer};
    use crate::wireguard::{KeyPair, PrivateKey};
    use std::net::Ipv4Addr;

    fn fixed_keys(byte: u8) -> KeyPair {
        KeyPair::from_private(PrivateKey::from_bytes([byte; 32]))
    }

    fn server() -> Server {
        let mut server = NewServer::new("edge", "203.0.113.7")
            .into_server(fixed_keys(1))
            .unwrap();
        server.id = 7;
        server
    }

    fn client(id: u64, name: &str, last_octet: u8, enabled: bool) -> Client {
        let mut input = NewClient::new(name, 1, 7);
        input.is_enabled = enabled;
        let mut client = input
            .into_client(
                fixed_keys(last_octet),
                Ipv4Addr::new(10, 10, 10, last_octet),
                "a1b2c3".into(),
            )
            .unwrap();
        client.id = id;
        client
    }

    #[test]
    fn test_client_document_exact() {
        let server = server();
        let client = client(3, "laptop", 2, true);
        let doc = render_client_config(&client, &server).to_string();

        let expected = format!(
            "[Interface]\n\
             Address = 10.10.10.2/32\n\
             PrivateKey = {}\n\
             DNS = 1.1.1.1,8.8.8.8\n\
             \n\
             [Peer]\n\
             Endpoint = 203.0.113.7:41800\n\
             PublicKey = {}\n\
             AllowedIPs = 0.0.0.0/0\n",
            client.keys.private.to_base64(),
            server.keys.public.to_base64()
        );
        assert_eq!(doc, expected);
    }

    #[test]
    fn test_client_document_uses_server_route() {
        let mut server = server();
        server.route = "10.10.10.0/24,192.168.0.0/16".into();
        let doc = render_client_config(&client(3, "laptop", 2, true), &server).to_string();
        assert!(doc.ends_with("AllowedIPs = 10.10.10.0/24,192.168.0.0/16\n"));

        server.route = String::new();
        let doc = render_client_config(&client(3, "laptop", 2, true), &server).to_string();
        assert!(doc.ends_with("AllowedIPs = 0.0.0.0/0\n"));
    }

    #[test]
    fn test_server_document_exact() {
        let server = server();
        let mut with_extra = client(4, "router", 3, true);
        with_extra.allowed = Some("192.168.50.0/24".into());
        let doc = render_server_config(&server, &[with_extra.clone()]).to_string();

        let expected = format!(
            "[Interface]\n\
             Address = 10.10.10.1/24\n\
             PrivateKey = {}\n\
             ListenPort = 41800\n\
             Table = off\n\
             \n\
             [Peer]\n\
             # Name = router\n\
             PublicKey = {}\n\
             AllowedIPs = 10.10.10.3/32,192.168.50.0/24\n\
             PersistentKeepalive = 20\n",
            server.keys.private.to_base64(),
            with_extra.keys.public.to_base64()
        );
        assert_eq!(doc, expected);
    }

    #[test]
    fn test_server_document_skips_disabled_clients() {
        let server = server();
        let clients = vec![client(3, "on", 2, true), client(4, "off", 3, false)];
        let doc = render_server_config(&server, &clients);

        assert_eq!(doc.peers.len(), 1);
        let text = doc.to_string();
        assert_eq!(text.matches("[Peer]").count(), 1);
        assert!(text.contains("# Name = on"));
        assert!(!text.contains("# Name = off"));
    }

    #[test]
    fn test_server_document_skips_foreign_clients() {
        let server = server();
        let mut foreign = client(5, "elsewhere", 4, true);
        foreign.server_id = Some(99);
        let mut orphan = client(6, "orphan", 5, true);
        orphan.server_id = None;

        let doc = render_server_config(&server, &[foreign, orphan]);
        assert!(doc.peers.is_empty());
    }

    #[test]
    fn test_rendering_does_not_mutate() {
        let server = server();
        let clients = vec![client(3, "on", 2, true)];
        let before = (server.clone(), clients.clone());
        let first = render_server_config(&server, &clients);
        let second = render_server_config(&server, &clients);
        assert_eq!(first, second);
        assert_eq!(before, (server, clients));
    }
}
