//! Per-peer live statistics
//!
//! This module parses `wg show all dump` records into peer statistics and
//! derives the human-readable strings shown next to each client.

use crate::error::{FleetError, Result};
use crate::wireguard::PublicKey;
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::net::SocketAddr;
use std::time::Duration;

/// Number of tab-separated fields in a peer line of `wg show all dump`
pub const DUMP_PEER_FIELDS: usize = 9;

/// Placeholder the dump uses for absent values
const NONE_FIELD: &str = "(none)";

/// Peer statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerStats {
    /// Interface the peer is attached to
    pub interface: String,
    /// Peer's public key
    pub public_key: PublicKey,
    /// Last known remote socket address
    pub endpoint: Option<String>,
    /// Allowed IPs as reported by the daemon
    pub allowed_ips: Option<String>,
    /// Last handshake time, `None` if the peer never completed one
    pub last_handshake: Option<DateTime<Utc>>,
    /// Total bytes received from this peer
    pub rx_bytes: u64,
    /// Total bytes transmitted to this peer
    pub tx_bytes: u64,
    /// Persistent keepalive interval, `None` when off
    pub persistent_keepalive: Option<u16>,
    /// Human-readable handshake recency
    pub last_seen: String,
    /// Human-readable traffic counters
    pub traffic: String,
}

impl PeerStats {
    /// Parse one dump line. `now` anchors the derived `last_seen` string.
    pub fn parse_dump_line(line: &str, now: DateTime<Utc>) -> Result<Self> {
        let fields: Vec<&str> = line.trim_end_matches(['\r', '\n']).split('\t').collect();
        if fields.len() != DUMP_PEER_FIELDS {
            return Err(FleetError::Parse(format!(
                "expected {} fields, got {}",
                DUMP_PEER_FIELDS,
                fields.len()
            )));
        }

        let public_key = PublicKey::from_base64(fields[1])
            .map_err(|e| FleetError::Parse(format!("peer key: {}", e)))?;
        let handshake_epoch = parse_counter("latest handshake", fields[5])?;
        let rx_bytes = parse_counter("rx bytes", fields[6])?;
        let tx_bytes = parse_counter("tx bytes", fields[7])?;
        let persistent_keepalive = match fields[8] {
            "off" | "0" => None,
            value => Some(value.parse::<u16>().map_err(|_| {
                FleetError::Parse(format!("invalid keepalive '{}'", value))
            })?),
        };

        let last_handshake = if handshake_epoch == 0 {
            None
        } else {
            let secs = i64::try_from(handshake_epoch)
                .map_err(|_| FleetError::Parse(format!("handshake {} out of range", handshake_epoch)))?;
            Some(
                Utc.timestamp_opt(secs, 0)
                    .single()
                    .ok_or_else(|| FleetError::Parse(format!("handshake {} out of range", secs)))?,
            )
        };

        Ok(Self {
            interface: fields[0].to_string(),
            public_key,
            endpoint: optional_field(fields[3]),
            allowed_ips: optional_field(fields[4]),
            last_handshake,
            rx_bytes,
            tx_bytes,
            persistent_keepalive,
            last_seen: describe_last_seen(last_handshake, now),
            traffic: describe_traffic(rx_bytes, tx_bytes),
        })
    }

    /// Host part of the remote endpoint
    pub fn remote_ip(&self) -> Option<String> {
        let endpoint = self.endpoint.as_deref()?;
        match endpoint.parse::<SocketAddr>() {
            Ok(addr) => Some(addr.ip().to_string()),
            Err(_) => endpoint.split(':').next().map(str::to_string),
        }
    }

    /// Check if the peer had a recent handshake (within last 3 minutes)
    pub fn has_recent_handshake(&self, now: DateTime<Utc>) -> bool {
        match self.last_handshake {
            Some(last) => now.signed_duration_since(last) < chrono::Duration::seconds(180),
            None => false,
        }
    }
}

fn optional_field(value: &str) -> Option<String> {
    if value == NONE_FIELD || value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn parse_counter(name: &str, value: &str) -> Result<u64> {
    value
        .parse()
        .map_err(|_| FleetError::Parse(format!("invalid {} '{}'", name, value)))
}

/// `"1 minute, 5 seconds ago"` style recency, `"never"` without a handshake
pub fn describe_last_seen(last_handshake: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    let Some(last) = last_handshake else {
        return "never".to_string();
    };

    let elapsed = now
        .signed_duration_since(last)
        .to_std()
        .unwrap_or(Duration::ZERO);
    if elapsed.as_secs() == 0 {
        return "Now".to_string();
    }
    format!("{} ago", format_duration(elapsed))
}

fn format_duration(elapsed: Duration) -> String {
    const UNITS: &[(u64, &str)] = &[
        (365 * 24 * 3600, "year"),
        (24 * 3600, "day"),
        (3600, "hour"),
        (60, "minute"),
        (1, "second"),
    ];

    let mut remaining = elapsed.as_secs();
    let mut parts = Vec::new();
    for (size, name) in UNITS {
        let count = remaining / size;
        if count > 0 {
            remaining %= size;
            let plural = if count == 1 { "" } else { "s" };
            parts.push(format!("{} {}{}", count, name, plural));
        }
    }
    parts.join(", ")
}

/// `"1.50 KB received, 512 B sent"`
pub fn describe_traffic(rx_bytes: u64, tx_bytes: u64) -> String {
    format!("{} received, {} sent", format_bytes(rx_bytes), format_bytes(tx_bytes))
}

/// Format bytes in human-readable form
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", bytes, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wireguard::PrivateKey;

    fn line(key: &PublicKey, handshake: i64) -> String {
        format!(
            "wg0\t{}\t(none)\t198.51.100.4:51820\t10.10.10.2/32\t{}\t1536\t2048\t20",
            key, handshake
        )
    }

    #[test]
    fn test_parse_full_line() {
        let key = PrivateKey::generate().public_key();
        let now = Utc.timestamp_opt(1_700_000_065, 0).unwrap();
        let stats = PeerStats::parse_dump_line(&line(&key, 1_700_000_000), now).unwrap();

        assert_eq!(stats.interface, "wg0");
        assert_eq!(stats.public_key, key);
        assert_eq!(stats.endpoint.as_deref(), Some("198.51.100.4:51820"));
        assert_eq!(stats.allowed_ips.as_deref(), Some("10.10.10.2/32"));
        assert_eq!(stats.rx_bytes, 1536);
        assert_eq!(stats.tx_bytes, 2048);
        assert_eq!(stats.persistent_keepalive, Some(20));
        assert_eq!(stats.last_seen, "1 minute, 5 seconds ago");
        assert_eq!(stats.traffic, "1.50 KB received, 2.00 KB sent");
        assert_eq!(stats.remote_ip().as_deref(), Some("198.51.100.4"));
        assert!(stats.has_recent_handshake(now));
    }

    #[test]
    fn test_parse_peer_without_endpoint() {
        let key = PrivateKey::generate().public_key();
        let text = format!("wg0\t{}\t(none)\t(none)\t(none)\t0\t0\t0\toff", key);
        let stats = PeerStats::parse_dump_line(&text, Utc::now()).unwrap();

        assert_eq!(stats.endpoint, None);
        assert_eq!(stats.allowed_ips, None);
        assert_eq!(stats.last_handshake, None);
        assert_eq!(stats.persistent_keepalive, None);
        assert_eq!(stats.last_seen, "never");
        assert_eq!(stats.remote_ip(), None);
    }

    #[test]
    fn test_parse_rejects_wrong_field_count() {
        let key = PrivateKey::generate().public_key();
        // interface line of `wg show all dump` has 5 fields
        let interface_line = format!("wg0\tprivate\t{}\t41800\toff", key);
        assert!(matches!(
            PeerStats::parse_dump_line(&interface_line, Utc::now()),
            Err(FleetError::Parse(_))
        ));

        let eight = format!("wg0\t{}\t(none)\t(none)\t(none)\t0\t0\t0", key);
        assert!(PeerStats::parse_dump_line(&eight, Utc::now()).is_err());
    }

    #[test]
    fn test_parse_rejects_bad_counters() {
        let key = PrivateKey::generate().public_key();
        let text = format!("wg0\t{}\t(none)\t(none)\t(none)\tlater\t0\t0\toff", key);
        assert!(PeerStats::parse_dump_line(&text, Utc::now()).is_err());
        assert!(PeerStats::parse_dump_line(
            "wg0\tnot-a-key\t(none)\t(none)\t(none)\t0\t0\t0\toff",
            Utc::now()
        )
        .is_err());
    }

    #[test]
    fn test_remote_ip_ipv6() {
        let key = PrivateKey::generate().public_key();
        let text = format!("wg0\t{}\t(none)\t[2001:db8::1]:51820\t(none)\t0\t0\t0\toff", key);
        let stats = PeerStats::parse_dump_line(&text, Utc::now()).unwrap();
        assert_eq!(stats.remote_ip().as_deref(), Some("2001:db8::1"));
    }

    #[test]
    fn test_describe_last_seen() {
        let now = Utc.timestamp_opt(1_700_100_000, 0).unwrap();
        assert_eq!(describe_last_seen(Some(now), now), "Now");
        let earlier = now - chrono::Duration::seconds(2 * 86400 + 3600 + 1);
        assert_eq!(
            describe_last_seen(Some(earlier), now),
            "2 days, 1 hour, 1 second ago"
        );
        // clock skew: handshake in the future
        let later = now + chrono::Duration::seconds(30);
        assert_eq!(describe_last_seen(Some(later), now), "Now");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
        assert_eq!(format_bytes(1024 * 1024 * 1024), "1.00 GB");
    }
}
