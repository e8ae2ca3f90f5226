//! Live statistics collection
//!
//! Reads `wg show all dump` from a server and refreshes the telemetry cache.

use super::{PeerStats, TelemetryCache};
use crate::error::ApplyError;
use crate::model::Server;
use crate::remote::{open_session, Connector, RemoteTarget};
use crate::wireguard::PublicKey;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub use crate::remote::commands::DUMP_COMMAND;

/// Parse dump output, skipping interface lines and malformed records
pub fn parse_dump(output: &str, now: DateTime<Utc>) -> Vec<PeerStats> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match PeerStats::parse_dump_line(line, now) {
            Ok(stats) => Some(stats),
            Err(e) => {
                debug!("Skipping dump line: {}", e);
                None
            }
        })
        .collect()
}

/// Pulls peer statistics from servers into the telemetry cache
pub struct StatsCollector {
    connector: Arc<dyn Connector>,
    cache: Arc<dyn TelemetryCache>,
    ttl: Duration,
    operation_timeout: Duration,
}

impl StatsCollector {
    /// Create a collector writing entries with `ttl` into `cache`
    pub fn new(
        connector: Arc<dyn Connector>,
        cache: Arc<dyn TelemetryCache>,
        ttl: Duration,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            connector,
            cache,
            ttl,
            operation_timeout,
        }
    }

    /// Shared telemetry cache
    pub fn cache(&self) -> &Arc<dyn TelemetryCache> {
        &self.cache
    }

    /// Query the server behind `target` and cache every peer it reports
    pub async fn collect(
        &self,
        server: &Server,
        target: &RemoteTarget,
    ) -> Result<HashMap<PublicKey, PeerStats>, ApplyError> {
        let output = tokio::time::timeout(self.operation_timeout, self.dump(target))
            .await
            .map_err(|_| {
                ApplyError::Timeout(format!(
                    "stats from server {} exceeded {}s",
                    server.id,
                    self.operation_timeout.as_secs()
                ))
            })??;

        self.cache.purge_expired();
        let records = parse_dump(&output, Utc::now());
        let mut peers = HashMap::with_capacity(records.len());
        for stats in records {
            self.cache.set(stats.public_key, stats.clone(), self.ttl);
            peers.insert(stats.public_key, stats);
        }

        info!("Collected stats for {} peers from server {}", peers.len(), server.id);
        Ok(peers)
    }

    async fn dump(&self, target: &RemoteTarget) -> Result<String, ApplyError> {
        let mut session = open_session(self.connector.as_ref(), target).await?;
        let result = session.exec(DUMP_COMMAND).await;
        session.close().await;
        Ok(result?.check(DUMP_COMMAND)?.stdout)
    }
}
