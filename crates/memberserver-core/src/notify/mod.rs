//! ============================================================================
//! Notify Module - Outbound Admin Notifications
//! ============================================================================
//! Everything the server wants a human to see goes through [`Notifier`]:
//! - SlackWebhookNotifier: access events to an incoming webhook
//! - EmailNotifier: admin alerts (IP changes) via Resend API
//! - LogNotifier: tracing only, used when nothing else is configured
//! - FanoutNotifier: delivers to several notifiers at once
//! ============================================================================

mod email;
mod slack;

pub use email::EmailNotifier;
pub use slack::SlackWebhookNotifier;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

/// What a notification is about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    /// A device reported an access attempt
    AccessEvent,
    /// The public IP address of the host changed
    IpChanged,
    /// A new member registered through the payment provider
    NewMember,
}

impl NotificationKind {
    /// Admin kinds are also mailed to the administrator
    pub fn is_admin(&self) -> bool {
        matches!(self, NotificationKind::IpChanged | NotificationKind::NewMember)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub subject: String,
    pub body: String,
}

impl Notification {
    pub fn new(kind: NotificationKind, subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            kind,
            subject: subject.into(),
            body: body.into(),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<()>;
}

// ============================================================================
// Log Notifier
// ============================================================================

pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        info!(
            "[notify:{:?}] {}: {}",
            notification.kind, notification.subject, notification.body
        );
        Ok(())
    }
}

// ============================================================================
// Fanout Notifier
// ============================================================================

/// Delivers to every child. One failing channel does not stop the others;
/// an error is returned only if every child failed.
pub struct FanoutNotifier {
    children: Vec<Arc<dyn Notifier>>,
}

impl FanoutNotifier {
    pub fn new(children: Vec<Arc<dyn Notifier>>) -> Self {
        Self { children }
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}

#[async_trait]
impl Notifier for FanoutNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        let mut failed = 0;
        for child in &self.children {
            if let Err(e) = child.notify(notification).await {
                warn!("Notification '{}' failed: {}", notification.subject, e);
                failed += 1;
            }
        }

        if failed > 0 && failed == self.children.len() {
            return Err(anyhow!("All {} notification channels failed", failed));
        }
        Ok(())
    }
}
