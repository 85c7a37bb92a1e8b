//! HTTPS [`CloudBackend`] speaking JSON to the snapshot API.
//!
//! ## Routes (relative to the configured endpoint)
//! ```text
//! GET  auth/verify              bearer check          200 / 401 / 403
//! PUT  snapshots/{device_id}    store a snapshot      2xx
//! GET  snapshots/{device_id}    latest for a device   200 / 404
//! GET  snapshots                summaries             200
//! GET  storage                  { used, available }   200
//! GET  health                   reachability          2xx
//! ```

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tokio::sync::RwLock;
use tracing::debug;
use url::Url;

use super::{CloudBackend, StorageInfo};
use crate::error::{SyncError, SyncResult};
use tally_core::{CloudSyncData, SnapshotSummary};

/// reqwest-based client for the snapshot API.
pub struct HttpBackend {
    client: Client,
    endpoint: RwLock<Url>,
    token: RwLock<Option<String>>,
    timeout: Duration,
}

impl HttpBackend {
    pub fn new(endpoint: &str, timeout: Duration) -> SyncResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::InvalidConfig(format!("HTTP client: {}", e)))?;

        Ok(HttpBackend {
            client,
            endpoint: RwLock::new(Self::base_url(endpoint)?),
            token: RwLock::new(None),
            timeout,
        })
    }

    /// Parses the endpoint so that relative joins append to its path.
    fn base_url(endpoint: &str) -> SyncResult<Url> {
        let mut url = Url::parse(endpoint)?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(SyncError::InvalidUrl(format!(
                "Endpoint must start with http:// or https://, got: {}",
                endpoint
            )));
        }
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        Ok(url)
    }

    async fn url(&self, path: &str) -> SyncResult<Url> {
        Ok(self.endpoint.read().await.join(path)?)
    }

    /// `snapshots/<device_id>` with the id escaped as one path segment.
    fn snapshot_url(base: &Url, device_id: &str) -> SyncResult<Url> {
        let mut url = base.clone();
        url.path_segments_mut()
            .map_err(|_| SyncError::InvalidUrl(format!("{} cannot carry a path", base)))?
            .pop_if_empty()
            .push("snapshots")
            .push(device_id);
        Ok(url)
    }

    async fn authorized(&self, builder: RequestBuilder) -> SyncResult<RequestBuilder> {
        match self.token.read().await.as_deref() {
            Some(token) => Ok(builder.bearer_auth(token)),
            None => Err(SyncError::NotAuthenticated),
        }
    }

    async fn send(&self, builder: RequestBuilder) -> SyncResult<Response> {
        builder.send().await.map_err(|e| self.request_error(e))
    }

    fn request_error(&self, err: reqwest::Error) -> SyncError {
        if err.is_timeout() {
            SyncError::Timeout(self.timeout.as_secs())
        } else {
            SyncError::from(err)
        }
    }

    async fn ensure_success(response: Response) -> SyncResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            return Err(SyncError::NotAuthenticated);
        }

        let message = response.text().await.unwrap_or_default();
        Err(SyncError::Http {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl CloudBackend for HttpBackend {
    async fn authenticate(&self, token: &str, endpoint: Option<&str>) -> SyncResult<bool> {
        if let Some(endpoint) = endpoint {
            *self.endpoint.write().await = Self::base_url(endpoint)?;
        }

        let url = self.url("auth/verify").await?;
        let response = self.send(self.client.get(url).bearer_auth(token)).await?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                *self.token.write().await = None;
                Ok(false)
            }
            status if status.is_success() => {
                *self.token.write().await = Some(token.to_string());
                Ok(true)
            }
            status => Err(SyncError::Http {
                status: status.as_u16(),
                message: "authentication check failed".into(),
            }),
        }
    }

    async fn put_snapshot(&self, snapshot: &CloudSyncData) -> SyncResult<()> {
        let url = Self::snapshot_url(&*self.endpoint.read().await, &snapshot.device_id)?;
        let request = self.authorized(self.client.put(url).json(snapshot)).await?;

        Self::ensure_success(self.send(request).await?).await?;
        debug!(device_id = %snapshot.device_id, "PUT snapshot accepted");
        Ok(())
    }

    async fn get_snapshot(&self, device_id: &str) -> SyncResult<Option<CloudSyncData>> {
        let url = Self::snapshot_url(&*self.endpoint.read().await, device_id)?;
        let request = self.authorized(self.client.get(url)).await?;
        let response = self.send(request).await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::ensure_success(response).await?;
        Ok(Some(response.json::<CloudSyncData>().await?))
    }

    async fn list_snapshots(&self) -> SyncResult<Vec<SnapshotSummary>> {
        let url = self.url("snapshots").await?;
        let request = self.authorized(self.client.get(url)).await?;
        let response = Self::ensure_success(self.send(request).await?).await?;
        Ok(response.json::<Vec<SnapshotSummary>>().await?)
    }

    async fn storage_info(&self) -> SyncResult<StorageInfo> {
        let url = self.url("storage").await?;
        let request = self.authorized(self.client.get(url)).await?;
        let response = Self::ensure_success(self.send(request).await?).await?;
        Ok(response.json::<StorageInfo>().await?)
    }

    async fn ping(&self) -> SyncResult<()> {
        let url = self.url("health").await?;
        Self::ensure_success(self.send(self.client.get(url)).await?).await?;
        Ok(())
    }
}
