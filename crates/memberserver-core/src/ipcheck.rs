//! ============================================================================
//! Public IP Change Monitor
//! ============================================================================
//! The site's devices and port forwards break when the ISP hands out a new
//! address. Once a day the server asks an external echo service for its
//! public IP, tells the admin when it changes, and then remembers it in the
//! store. The first observation only seeds the cache.
//! ============================================================================

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::db::Store;
use crate::notify::{Notification, NotificationKind, Notifier};

/// Settings key holding the last known public address
pub const PUBLIC_IP_SETTING: &str = "public_ip_address";

/// Default echo service
pub const DEFAULT_IP_CHECK_URL: &str = "https://icanhazip.com/";

/// Source of the current public address
#[async_trait]
pub trait IpSource: Send + Sync {
    async fn current_ip(&self) -> Result<String>;
}

/// Fetches the address from a plain-text echo service
pub struct HttpIpSource {
    client: reqwest::Client,
    url: String,
}

impl HttpIpSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            url: url.into(),
        }
    }
}

#[async_trait]
impl IpSource for HttpIpSource {
    async fn current_ip(&self) -> Result<String> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| anyhow!("Can't get IP address: {}", e))?;

        if !response.status().is_success() {
            return Err(anyhow!("IP check service returned {}", response.status()));
        }

        let body = response
            .text()
            .await
            .map_err(|e| anyhow!("Failed to read IP check response: {}", e))?;
        Ok(body.trim().to_string())
    }
}

/// What a check observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpCheck {
    /// Nothing cached yet; the address was stored
    FirstSeen(String),
    Unchanged(String),
    Changed { previous: String, current: String },
}

pub struct IpChangeMonitor {
    store: Arc<dyn Store>,
    source: Arc<dyn IpSource>,
    notifier: Arc<dyn Notifier>,
}

impl IpChangeMonitor {
    pub fn new(store: Arc<dyn Store>, source: Arc<dyn IpSource>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            store,
            source,
            notifier,
        }
    }

    pub async fn check(&self) -> Result<IpCheck> {
        let current = self.source.current_ip().await?;
        if current.is_empty() {
            return Err(anyhow!("IP check service returned an empty body"));
        }
        debug!("ip addr: {}", current);

        let previous = self
            .store
            .get_setting(PUBLIC_IP_SETTING)?
            .map(|s| s.trim().to_string())
            .unwrap_or_default();

        if previous.is_empty() {
            self.store.put_setting(PUBLIC_IP_SETTING, &current)?;
            info!("Recorded public IP address {}", current);
            return Ok(IpCheck::FirstSeen(current));
        }
        if previous == current {
            return Ok(IpCheck::Unchanged(current));
        }

        info!("Public IP address changed: {} -> {}", previous, current);
        let notification = Notification::new(
            NotificationKind::IpChanged,
            "IP Address Changed",
            format!("The public IP address is now {} (was {})", current, previous),
        );
        self.notifier.notify(&notification).await?;

        // Only remember the new address once the admin has been told
        self.store.put_setting(PUBLIC_IP_SETTING, &current)?;
        Ok(IpCheck::Changed { previous, current })
    }
}
