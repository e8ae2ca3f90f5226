//! wg-fleet: provisioning and reconciliation for a fleet of WireGuard servers
//!
//! The controller keeps a declarative model of servers, groups and clients
//! consistent with the live WireGuard daemons on remote hosts. It generates
//! key pairs, hands out client addresses without collisions, renders
//! wg-quick documents, pushes them over an ssh management channel, and reads
//! live peer statistics back into a short-lived cache.
//!
//! # Architecture
//!
//! Every mutation goes through [`control::Fleet`]. Local state is validated
//! and persisted first; remote reconciliation then runs on a per-server
//! worker so that one host never sees two sessions at once while different
//! hosts proceed in parallel. Remote failures are reported, never rolled
//! back.
//!
//! # Modules
//!
//! - `wireguard`: key pairs and config rendering
//! - `allocator`: per-server address allocation
//! - `model`: entity records and the `Store` trait
//! - `remote`: management sessions, credentials and the applier
//! - `monitoring`: peer statistics and the telemetry cache
//! - `control`: orchestration, reconcile queue and downloads
//! - `config`: TOML configuration and input validation
//! - `security`: capability checks and file permissions
//! - `error`: Error types and handling

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod allocator;
pub mod config;
pub mod control;
pub mod error;
pub mod model;
pub mod monitoring;
pub mod remote;
pub mod security;
pub mod wireguard;

// Re-export commonly used types
pub use error::{ApplyError, FleetError, Result};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
