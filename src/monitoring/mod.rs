//! Monitoring and live telemetry
//!
//! This module collects per-peer state from servers and keeps it in a
//! short-lived cache keyed by peer public key. Telemetry is best-effort:
//! readers get `-` for anything not (or no longer) cached.

use crate::model::Client;
use crate::wireguard::PublicKey;
use dashmap::DashMap;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::debug;

mod collector;
mod peer_stats;

pub use collector::{parse_dump, StatsCollector, DUMP_COMMAND};
pub use peer_stats::{
    describe_last_seen, describe_traffic, format_bytes, PeerStats, DUMP_PEER_FIELDS,
};

/// Default lifetime of a telemetry entry
pub const DEFAULT_TELEMETRY_TTL: Duration = Duration::from_secs(300);

/// Placeholder rendered when no telemetry is available
pub const UNKNOWN: &str = "-";

/// Shared ephemeral store of peer telemetry
pub trait TelemetryCache: Send + Sync {
    /// Cached stats for a peer, if present and not expired
    fn get(&self, key: &PublicKey) -> Option<PeerStats>;

    /// Store stats for a peer, replacing any previous entry
    fn set(&self, key: PublicKey, value: PeerStats, ttl: Duration);

    /// Drop expired entries, returning how many were removed
    fn purge_expired(&self) -> usize;
}

/// In-process telemetry cache with per-entry expiry
#[derive(Debug, Default)]
pub struct MemoryTelemetryCache {
    entries: DashMap<PublicKey, (PeerStats, Instant)>,
}

impl MemoryTelemetryCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries, including ones not yet purged
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl TelemetryCache for MemoryTelemetryCache {
    fn get(&self, key: &PublicKey) -> Option<PeerStats> {
        {
            let entry = self.entries.get(key)?;
            let (stats, expires) = entry.value();
            if *expires > Instant::now() {
                return Some(stats.clone());
            }
        }
        // a concurrent set may have refreshed the entry since the read
        self.entries
            .remove_if(key, |_, (_, expires)| *expires <= Instant::now());
        None
    }

    fn set(&self, key: PublicKey, value: PeerStats, ttl: Duration) {
        self.entries.insert(key, (value, Instant::now() + ttl));
    }

    fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, (_, expires)| *expires > now);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!("Purged {} expired telemetry entries", removed);
        }
        removed
    }
}

/// Presentation view of a client's live state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientTelemetry {
    /// Handshake recency
    pub last_seen: String,
    /// Traffic counters
    pub traffic: String,
    /// Remote address without port
    pub remote_ip: String,
}

impl ClientTelemetry {
    /// Look up a client's telemetry, falling back to `-` placeholders
    pub fn for_client(client: &Client, cache: &dyn TelemetryCache) -> Self {
        match cache.get(&client.keys.public) {
            Some(stats) => Self {
                remote_ip: stats.remote_ip().unwrap_or_else(|| UNKNOWN.to_string()),
                last_seen: stats.last_seen,
                traffic: stats.traffic,
            },
            None => Self::unknown(),
        }
    }

    /// View with every field unknown
    pub fn unknown() -> Self {
        Self {
            last_seen: UNKNOWN.to_string(),
            traffic: UNKNOWN.to_string(),
            remote_ip: UNKNOWN.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewClient;
    use crate::wireguard::KeyPair;
    use chrono::Utc;
    use std::net::Ipv4Addr;

    fn stats_for(key: &PublicKey) -> PeerStats {
        let line = format!(
            "wg0\t{}\t(none)\t198.51.100.4:51820\t10.10.10.2/32\t0\t10\t20\t20",
            key
        );
        PeerStats::parse_dump_line(&line, Utc::now()).unwrap()
    }

    #[test]
    fn test_cache_set_and_get() {
        let cache = MemoryTelemetryCache::new();
        let key = KeyPair::generate().public;
        assert!(cache.get(&key).is_none());

        cache.set(key, stats_for(&key), DEFAULT_TELEMETRY_TTL);
        assert_eq!(cache.get(&key).unwrap().rx_bytes, 10);
    }

    #[test]
    fn test_cache_expiry() {
        let cache = MemoryTelemetryCache::new();
        let key = KeyPair::generate().public;
        cache.set(key, stats_for(&key), Duration::ZERO);

        assert!(cache.get(&key).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_purge_expired() {
        let cache = MemoryTelemetryCache::new();
        let stale = KeyPair::generate().public;
        let fresh = KeyPair::generate().public;
        cache.set(stale, stats_for(&stale), Duration::ZERO);
        cache.set(fresh, stats_for(&fresh), DEFAULT_TELEMETRY_TTL);

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_client_telemetry_view() {
        let cache = MemoryTelemetryCache::new();
        let client = NewClient::new("laptop", 1, 1)
            .into_client(KeyPair::generate(), Ipv4Addr::new(10, 10, 10, 2), "abcdef".into())
            .unwrap();

        assert_eq!(
            ClientTelemetry::for_client(&client, &cache),
            ClientTelemetry::unknown()
        );

        cache.set(
            client.keys.public,
            stats_for(&client.keys.public),
            DEFAULT_TELEMETRY_TTL,
        );
        let view = ClientTelemetry::for_client(&client, &cache);
        assert_eq!(view.remote_ip, "198.51.100.4");
        assert_eq!(view.last_seen, "never");
        assert_eq!(view.traffic, "10 B received, 20 B sent");
    }
}
