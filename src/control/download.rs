//! Client config downloads by token
//!
//! The token link is the only unauthenticated way to read a client config.
//! Unknown tokens, disabled downloads and orphaned clients all look the same
//! to the caller: not found.

use crate::error::{FleetError, Result};
use crate::model::Store;
use crate::wireguard::render_client_config;
use std::sync::Arc;
use tracing::{debug, info};

/// Content type of a config download
pub const CONFIG_CONTENT_TYPE: &str = "application/octet-stream";

/// A rendered config ready to be sent as an attachment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigDownload {
    /// Attachment file name
    pub filename: String,
    /// MIME type
    pub content_type: &'static str,
    /// Document body
    pub body: String,
}

/// Resolves download tokens against the store
#[derive(Clone)]
pub struct DownloadService {
    store: Arc<dyn Store>,
}

impl DownloadService {
    /// Create a service reading from `store`
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Render the config behind `token` and count the download
    pub async fn download(&self, token: &str) -> Result<ConfigDownload> {
        let not_found = || FleetError::NotFound("Config not found".to_string());

        let client = self
            .store
            .find_client_by_token(token)
            .await?
            .filter(|c| c.token == token && c.enable_download)
            .ok_or_else(|| {
                debug!("Rejected download token");
                not_found()
            })?;
        let server_id = client.server_id.ok_or_else(not_found)?;
        let server = self
            .store
            .get_server(server_id)
            .await?
            .ok_or_else(not_found)?;

        let body = render_client_config(&client, &server).to_string();
        let count = self.store.increment_download_count(client.id).await?;
        info!("Client {} config downloaded ({} total)", client.id, count);

        Ok(ConfigDownload {
            filename: client.config_filename(),
            content_type: CONFIG_CONTENT_TYPE,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Group, MemoryStore, NewClient, NewServer};
    use crate::wireguard::KeyPair;
    use std::net::Ipv4Addr;

    async fn seeded(enable_download: bool) -> (Arc<MemoryStore>, u64) {
        let store = Arc::new(MemoryStore::new());
        let server = store
            .insert_server(
                NewServer::new("edge", "203.0.113.7")
                    .into_server(KeyPair::generate())
                    .unwrap(),
            )
            .await
            .unwrap();
        let group = store
            .insert_group(Group::new("staff", "", "").unwrap())
            .await
            .unwrap();
        let mut input = NewClient::new("laptop", group.id, server.id);
        input.enable_download = enable_download;
        let ip = Ipv4Addr::new(10, 10, 10, 2);
        let client = store
            .create_client(
                input
                    .into_client(KeyPair::generate(), ip, "c0ffee".into())
                    .unwrap(),
                ip,
            )
            .await
            .unwrap();
        (store, client.id)
    }

    #[tokio::test]
    async fn test_download_counts_once() {
        let (store, id) = seeded(true).await;
        let service = DownloadService::new(store.clone());

        let download = service.download("c0ffee").await.unwrap();
        assert_eq!(download.filename, format!("vpn-wg-{}.conf", id));
        assert_eq!(download.content_type, "application/octet-stream");
        assert!(download.body.starts_with("[Interface]\nAddress = 10.10.10.2/32\n"));
        assert_eq!(store.get_client(id).await.unwrap().unwrap().download_count, 1);
    }

    #[tokio::test]
    async fn test_unknown_token() {
        let (store, id) = seeded(true).await;
        let service = DownloadService::new(store.clone());
        assert!(matches!(
            service.download("000000").await,
            Err(FleetError::NotFound(_))
        ));
        assert_eq!(store.get_client(id).await.unwrap().unwrap().download_count, 0);
    }

    #[tokio::test]
    async fn test_disabled_download() {
        let (store, id) = seeded(false).await;
        let service = DownloadService::new(store.clone());
        assert!(matches!(
            service.download("c0ffee").await,
            Err(FleetError::NotFound(_))
        ));
        assert_eq!(store.get_client(id).await.unwrap().unwrap().download_count, 0);
    }

    #[tokio::test]
    async fn test_orphaned_client() {
        let (store, _) = seeded(true).await;
        let server = store.list_servers().await.unwrap().remove(0);
        store.delete_server(server.id).await.unwrap();

        let service = DownloadService::new(store);
        assert!(service.download("c0ffee").await.is_err());
    }
}
