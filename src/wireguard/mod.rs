//! WireGuard key material and configuration documents
//!
//! This module handles Curve25519 key pairs and renders the wg-quick
//! documents installed on servers and handed to clients.

mod keys;
mod render;

pub use keys::{derive_public, KeyError, KeyPair, PrivateKey, PublicKey, KEY_LEN};
pub use render::{
    render_client_config, render_client_peer, render_server_config, ClientDocument,
    InterfaceBlock, PeerBlock, ServerDocument, CLIENT_DNS,
};
