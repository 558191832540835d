//! ============================================================================
//! Slack Webhook Notifier
//! ============================================================================
//! Posts `{"text": ...}` to a Slack incoming webhook. No bot token needed.
//! ============================================================================

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use super::{Notification, Notifier};

pub struct SlackWebhookNotifier {
    client: reqwest::Client,
    webhook_url: String,
}

impl SlackWebhookNotifier {
    pub fn new(webhook_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            webhook_url,
        }
    }
}

#[derive(Debug, Serialize)]
struct WebhookMessage<'a> {
    text: &'a str,
}

#[async_trait]
impl Notifier for SlackWebhookNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        debug!("Posting to Slack webhook: {}", notification.subject);

        let response = self
            .client
            .post(&self.webhook_url)
            .header("Content-Type", "application/json; charset=utf-8")
            .json(&WebhookMessage {
                text: &notification.body,
            })
            .send()
            .await
            .map_err(|e| anyhow!("Failed to post to Slack: {}", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Slack webhook error {}: {}", status, body));
        }

        Ok(())
    }
}
