//! ============================================================================
//! Device Message Handlers - Topic Dispatch Table
//! ============================================================================
//! Each resource publishes on four topics under its name. The table below is
//! built once per resource when it is initialized and maps each topic suffix
//! to the sync manager operation that handles it.
//! ============================================================================

use async_trait::async_trait;
use std::sync::{Arc, Weak};
use tracing::{debug, error, warn};

use super::ResourceSyncManager;
use crate::bus::{BusMessage, MessageHandler};
use crate::types::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceTopic {
    /// `<name>/send`: access events
    Send,
    /// `<name>/result`: ACL hash health reports
    Result,
    /// `<name>/sync`: heartbeats
    Sync,
    /// `<name>/cleanup`: request a full reconciliation pass
    Cleanup,
}

impl DeviceTopic {
    pub const ALL: [DeviceTopic; 4] = [
        DeviceTopic::Send,
        DeviceTopic::Result,
        DeviceTopic::Sync,
        DeviceTopic::Cleanup,
    ];

    pub fn suffix(&self) -> &'static str {
        match self {
            DeviceTopic::Send => "send",
            DeviceTopic::Result => "result",
            DeviceTopic::Sync => "sync",
            DeviceTopic::Cleanup => "cleanup",
        }
    }

    pub fn topic_for(&self, resource_name: &str) -> String {
        format!("{}/{}", resource_name, self.suffix())
    }

    /// Split `<name>/<suffix>` into its parts
    pub fn parse(topic: &str) -> Option<(&str, DeviceTopic)> {
        let (name, suffix) = topic.rsplit_once('/')?;
        let kind = Self::ALL.into_iter().find(|k| k.suffix() == suffix)?;
        if name.is_empty() {
            return None;
        }
        Some((name, kind))
    }
}

/// Bus handler for one topic of one resource
pub struct DeviceMessageHandler {
    manager: Weak<ResourceSyncManager>,
    resource: String,
    topic: DeviceTopic,
}

impl DeviceMessageHandler {
    async fn dispatch(&self, manager: &ResourceSyncManager, payload: &[u8]) -> Result<(), SyncError> {
        match self.topic {
            DeviceTopic::Send => manager.on_access_event(&self.resource, payload).await.map(|_| ()),
            DeviceTopic::Result => manager.on_health_report(payload).await.map(|_| ()),
            DeviceTopic::Sync => manager.on_heartbeat(payload).await,
            DeviceTopic::Cleanup => {
                let cancel = manager.shutdown_token();
                manager.reconcile_all(&cancel).await.map(|_| ())
            }
        }
    }
}

#[async_trait]
impl MessageHandler for DeviceMessageHandler {
    async fn handle(&self, message: BusMessage) {
        let Some(manager) = self.manager.upgrade() else {
            debug!("Sync manager gone, ignoring {}", message.topic);
            return;
        };

        if let Err(e) = self.dispatch(&manager, &message.payload).await {
            match e {
                SyncError::MalformedInput(_) => {
                    warn!("Dropping message on {}: {}", message.topic, e)
                }
                SyncError::NotFound(_) => warn!("{} ({})", e, message.topic),
                _ => error!("Handler for {} failed: {}", message.topic, e),
            }
        }
    }
}

/// Build the topic -> handler table for one resource
pub fn handler_table(
    manager: &Arc<ResourceSyncManager>,
    resource_name: &str,
) -> Vec<(String, Arc<dyn MessageHandler>)> {
    DeviceTopic::ALL
        .into_iter()
        .map(|topic| {
            let handler: Arc<dyn MessageHandler> = Arc::new(DeviceMessageHandler {
                manager: Arc::downgrade(manager),
                resource: resource_name.to_string(),
                topic,
            });
            (topic.topic_for(resource_name), handler)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_names() {
        assert_eq!(DeviceTopic::Send.topic_for("frontdoor"), "frontdoor/send");
        assert_eq!(DeviceTopic::Cleanup.topic_for("frontdoor"), "frontdoor/cleanup");
    }

    #[test]
    fn test_parse_topic() {
        assert_eq!(
            DeviceTopic::parse("frontdoor/result"),
            Some(("frontdoor", DeviceTopic::Result))
        );
        assert_eq!(
            DeviceTopic::parse("shop/laser/sync"),
            Some(("shop/laser", DeviceTopic::Sync))
        );
        assert_eq!(DeviceTopic::parse("frontdoor/unknown"), None);
        assert_eq!(DeviceTopic::parse("/send"), None);
        assert_eq!(DeviceTopic::parse("send"), None);
    }
}
