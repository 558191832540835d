//! ============================================================================
//! Device Client - HTTP Push/Probe for Door Controllers
//! ============================================================================
//! - GET <address>: liveness/status probe
//! - POST <address>/update {"acl": [...]}: replace the device's access list
//! ============================================================================

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use crate::retry::{Classify, ErrorKind};
use crate::types::{AclUpdateRequest, Resource, SyncError};

#[async_trait]
pub trait DeviceClient: Send + Sync {
    /// Probe the device and return the response body
    async fn probe(&self, resource: &Resource) -> Result<String, SyncError>;

    async fn push_acl(&self, resource: &Resource, request: &AclUpdateRequest) -> Result<(), SyncError>;
}

impl Classify for SyncError {
    fn error_kind(&self) -> ErrorKind {
        match self {
            SyncError::Unreachable(_) => ErrorKind::Retryable,
            _ => ErrorKind::Permanent,
        }
    }
}

pub struct HttpDeviceClient {
    client: reqwest::Client,
}

impl HttpDeviceClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }

    fn base_url(resource: &Resource) -> Result<url::Url, SyncError> {
        url::Url::parse(resource.address.trim()).map_err(|e| {
            SyncError::MalformedInput(format!(
                "resource {} has invalid address '{}': {}",
                resource.name, resource.address, e
            ))
        })
    }

    async fn check(resource: &Resource, response: reqwest::Response) -> Result<String, SyncError> {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if status.is_server_error() {
            return Err(SyncError::Unreachable(format!(
                "{} answered {}: {}",
                resource.name, status, body
            )));
        }
        if !status.is_success() {
            return Err(SyncError::Rejected(format!(
                "{} answered {}: {}",
                resource.name, status, body
            )));
        }
        Ok(body)
    }
}

impl Default for HttpDeviceClient {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl DeviceClient for HttpDeviceClient {
    async fn probe(&self, resource: &Resource) -> Result<String, SyncError> {
        let url = Self::base_url(resource)?;
        debug!("Probing {} at {}", resource.name, url);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| SyncError::Unreachable(format!("{}: {}", resource.name, e)))?;

        Self::check(resource, response).await
    }

    async fn push_acl(&self, resource: &Resource, request: &AclUpdateRequest) -> Result<(), SyncError> {
        Self::base_url(resource)?;
        let url = format!("{}/update", resource.address.trim().trim_end_matches('/'));
        debug!("Pushing {} entries to {} at {}", request.acl.len(), resource.name, url);

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(|e| SyncError::Unreachable(format!("{}: {}", resource.name, e)))?;

        let body = Self::check(resource, response).await?;
        debug!("{} update response: {}", resource.name, body);
        Ok(())
    }
}
