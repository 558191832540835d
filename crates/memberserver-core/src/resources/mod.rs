//! ============================================================================
//! Resource Sync Manager - Keeping Door Controllers in Step with the Store
//! ============================================================================
//! Owns everything device-facing:
//! - Subscribing the four device topics per resource
//! - Canonical ACL hashing and push/probe over HTTP
//! - The Unknown / InSync / OutOfDate state machine per resource
//! - Handlers for access events, health reports, heartbeats and cleanup
//!
//! Per-resource state lives in an arena keyed by resource id. Every operation
//! that reads the ACL and acts on it (hash, push) does so while holding that
//! resource's lock, reading the ACL exactly once.
//! ============================================================================

pub mod acl;
mod client;
mod handlers;
mod state;

pub use acl::{acl_hash, canonical_acl};
pub use client::{DeviceClient, HttpDeviceClient};
pub use handlers::{handler_table, DeviceMessageHandler, DeviceTopic};
pub use state::ResourceState;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::MessageBus;
use crate::db::Store;
use crate::membership::MembershipObserver;
use crate::notify::{Notification, NotificationKind, Notifier};
use crate::retry::{retry_async, RetryConfig};
use crate::types::{
    AccessEvent, AccessEventPayload, AclResponse, AclUpdateRequest, HeartBeat, Member, Resource,
    SyncError, SyncStatus,
};

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Push immediately when a device reports a stale hash
    pub auto_push_on_mismatch: bool,
    pub retry: RetryConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            auto_push_on_mismatch: true,
            retry: RetryConfig::default(),
        }
    }
}

/// Outcome of a push pass over several resources
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PushReport {
    /// (resource name, pushed hash)
    pub pushed: Vec<(String, String)>,
    pub failed: Vec<String>,
    pub skipped: usize,
}

/// Probe bodies from newer firmware carry the current hash
#[derive(Debug, Deserialize)]
struct ProbeReport {
    hash: String,
}

pub struct ResourceSyncManager {
    store: Arc<dyn Store>,
    bus: Arc<dyn MessageBus>,
    devices: Arc<dyn DeviceClient>,
    notifier: Arc<dyn Notifier>,
    config: SyncConfig,
    states: DashMap<String, Arc<Mutex<ResourceState>>>,
    /// Resource ids whose topics are already subscribed
    subscribed: DashMap<String, ()>,
    shutdown: CancellationToken,
}

impl ResourceSyncManager {
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<dyn MessageBus>,
        devices: Arc<dyn DeviceClient>,
        notifier: Arc<dyn Notifier>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            bus,
            devices,
            notifier,
            config,
            states: DashMap::new(),
            subscribed: DashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancelled when the server shuts down; bounds bus-triggered passes
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn state_for(&self, resource_id: &str) -> Arc<Mutex<ResourceState>> {
        self.states
            .entry(resource_id.to_string())
            .or_default()
            .value()
            .clone()
    }

    /// Snapshot of one resource's sync state
    pub async fn state_of(&self, resource_id: &str) -> Option<ResourceState> {
        let state = self.states.get(resource_id)?.value().clone();
        let snapshot = state.lock().await.clone();
        Some(snapshot)
    }

    pub async fn status_of(&self, resource_id: &str) -> SyncStatus {
        self.state_of(resource_id)
            .await
            .map(|s| s.status)
            .unwrap_or_default()
    }

    fn current_acl(&self, resource: &Resource) -> Result<Vec<String>, SyncError> {
        Ok(canonical_acl(self.store.resource_acl(&resource.id)?))
    }

    fn resource_by_name(&self, name: &str) -> Result<Resource, SyncError> {
        self.store
            .get_resource_by_name(name)?
            .ok_or_else(|| SyncError::NotFound(format!("resource '{}'", name)))
    }

    // ========================================================================
    // Startup
    // ========================================================================

    /// Subscribe the device topics of every known resource, then check each
    /// resource's status. Resources already subscribed are not subscribed
    /// again. Returns the number of newly subscribed resources.
    pub async fn init_resources(self: &Arc<Self>) -> Result<usize, SyncError> {
        let resources = self.store.list_resources()?;
        let mut added = 0;

        for resource in &resources {
            if self.subscribed.contains_key(&resource.id) {
                continue;
            }

            let mut ok = true;
            for (topic, handler) in handler_table(self, &resource.name) {
                if let Err(e) = self.bus.subscribe(&topic, handler).await {
                    error!("Failed to subscribe {}: {}", topic, e);
                    ok = false;
                }
            }

            if ok {
                self.subscribed.insert(resource.id.clone(), ());
                added += 1;
                debug!("Subscribed device topics for {}", resource.name);
            }
        }

        info!("Initialized {} of {} resources", added, resources.len());
        self.check_all_status().await;
        Ok(added)
    }

    // ========================================================================
    // Status / Push
    // ========================================================================

    /// Hash the current ACL and probe the device. A probe body carrying
    /// `{"hash": ...}` counts as a health report; any other body moves a
    /// resource out of Unknown to OutOfDate.
    pub async fn check_status(&self, resource: &Resource) -> Result<SyncStatus, SyncError> {
        let state = self.state_for(&resource.id);
        let mut state = state.lock().await;

        let acl = self.current_acl(resource)?;
        let expected = acl_hash(&acl);
        state.observe_expected(&expected);
        debug!("{} expected ACL hash {} ({} entries)", resource.name, expected, acl.len());

        let body = match retry_async(&self.config.retry, &format!("probe {}", resource.name), || {
            self.devices.probe(resource)
        })
        .await
        {
            Ok(body) => body,
            Err(e) => {
                state.last_error = Some(e.to_string());
                return Err(e);
            }
        };

        match serde_json::from_str::<ProbeReport>(&body) {
            Ok(report) => {
                let status = state.observe_report(&report.hash, &expected);
                if status == SyncStatus::OutOfDate && self.config.auto_push_on_mismatch {
                    self.push_locked(resource, &mut state, acl).await?;
                }
            }
            Err(_) => {
                debug!("{} probe body: {}", resource.name, body.trim());
                state.observe_unhashed_status();
            }
        }

        Ok(state.status)
    }

    /// Check every resource; one unreachable device never stops the rest.
    /// Returns the number of failed checks.
    pub async fn check_all_status(&self) -> usize {
        let resources = match self.store.list_resources() {
            Ok(r) => r,
            Err(e) => {
                error!("Failed to list resources: {}", e);
                return 0;
            }
        };

        let mut failed = 0;
        for resource in &resources {
            if let Err(e) = self.check_status(resource).await {
                warn!("Status check for {} failed: {}", resource.name, e);
                failed += 1;
            }
        }
        failed
    }

    /// Recompute the canonical ACL and push it. Returns the pushed hash.
    pub async fn push_acl(&self, resource: &Resource) -> Result<String, SyncError> {
        let state = self.state_for(&resource.id);
        let mut state = state.lock().await;
        let acl = self.current_acl(resource)?;
        self.push_locked(resource, &mut state, acl).await
    }

    async fn push_locked(
        &self,
        resource: &Resource,
        state: &mut ResourceState,
        acl: Vec<String>,
    ) -> Result<String, SyncError> {
        let hash = acl_hash(&acl);
        let request = AclUpdateRequest { acl };

        let result = retry_async(&self.config.retry, &format!("push {}", resource.name), || {
            self.devices.push_acl(resource, &request)
        })
        .await;

        match result {
            Ok(()) => {
                state.record_push(&hash, chrono::Utc::now().timestamp());
                info!(
                    "Pushed {} ACL entries to {} (hash {})",
                    request.acl.len(),
                    resource.name,
                    hash
                );
                Ok(hash)
            }
            Err(e) => {
                state.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    async fn push_each(
        &self,
        cancel: &CancellationToken,
        only_stale: bool,
    ) -> Result<PushReport, SyncError> {
        let mut report = PushReport::default();

        for resource in self.store.list_resources()? {
            if cancel.is_cancelled() {
                info!("Push pass cancelled");
                break;
            }

            if only_stale {
                let state = self.state_for(&resource.id);
                if !state.lock().await.needs_push() {
                    report.skipped += 1;
                    continue;
                }
            }

            match self.push_acl(&resource).await {
                Ok(hash) => report.pushed.push((resource.name.clone(), hash)),
                Err(e) => {
                    warn!("Push to {} failed: {}", resource.name, e);
                    report.failed.push(resource.name.clone());
                }
            }
        }

        Ok(report)
    }

    /// Cleanup pass: push every resource's freshly computed ACL, which drops
    /// any RFID that is no longer valid. Unchanged membership yields the same
    /// lists on every run.
    pub async fn reconcile_all(&self, cancel: &CancellationToken) -> Result<PushReport, SyncError> {
        let report = self.push_each(cancel, false).await?;
        info!(
            "Reconciled ACLs: {} pushed, {} failed",
            report.pushed.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Push to every resource that is not confirmed InSync
    pub async fn update_resources(&self, cancel: &CancellationToken) -> Result<PushReport, SyncError> {
        let report = self.push_each(cancel, true).await?;
        debug!(
            "Updated resources: {} pushed, {} failed, {} in sync",
            report.pushed.len(),
            report.failed.len(),
            report.skipped
        );
        Ok(report)
    }

    /// Mark resources OutOfDate after a membership change
    pub async fn invalidate(&self, resource_ids: &[String]) {
        for id in resource_ids {
            let state = self.state_for(id);
            state.lock().await.invalidate();
        }
    }

    pub async fn invalidate_all(&self) {
        let ids: Vec<String> = self.states.iter().map(|e| e.key().clone()).collect();
        self.invalidate(&ids).await;
    }

    // ========================================================================
    // Device Message Handlers
    // ========================================================================

    /// `<name>/result`: compare the device's hash with the store's
    pub async fn on_health_report(&self, payload: &[u8]) -> Result<SyncStatus, SyncError> {
        let report: AclResponse = serde_json::from_slice(payload)
            .map_err(|e| SyncError::MalformedInput(format!("health report: {}", e)))?;
        debug!("Health report from {}: {}", report.name, report.hash);

        let resource = self.resource_by_name(&report.name)?;
        let state = self.state_for(&resource.id);
        let mut state = state.lock().await;

        let acl = self.current_acl(&resource)?;
        let expected = acl_hash(&acl);
        let status = state.observe_report(&report.hash, &expected);

        if status == SyncStatus::OutOfDate {
            if self.config.auto_push_on_mismatch {
                info!("[{}] is out of date, pushing current ACL", resource.name);
                if let Err(e) = self.push_locked(&resource, &mut state, acl).await {
                    warn!("Push to {} failed: {}", resource.name, e);
                }
            } else {
                info!("[{}] is out of date, automatic push disabled", resource.name);
            }
        }

        Ok(state.status)
    }

    /// `<name>/send`: persist the access event and forward a summary
    pub async fn on_access_event(&self, resource_name: &str, payload: &[u8]) -> Result<AccessEvent, SyncError> {
        let payload: AccessEventPayload = serde_json::from_slice(payload)
            .map_err(|e| SyncError::MalformedInput(format!("access event: {}", e)))?;

        let mut username = payload.username.trim().to_string();
        if username.is_empty() {
            if let Some(member) = self.store.get_member_by_rfid(&payload.rfid)? {
                username = member.name;
            }
        }

        let event = AccessEvent {
            id: uuid::Uuid::new_v4().to_string(),
            resource: resource_name.to_string(),
            rfid: payload.rfid,
            username,
            timestamp: payload.time,
            is_known: payload.is_known,
            event_type: payload.event_type,
        };

        self.store.log_access_event(&event)?;
        debug!("Access event: {}", event.summary());

        let notification = Notification::new(NotificationKind::AccessEvent, resource_name, event.summary());
        if let Err(e) = self.notifier.notify(&notification).await {
            warn!("Failed to forward access event: {}", e);
        }

        Ok(event)
    }

    /// `<name>/sync`: record liveness
    pub async fn on_heartbeat(&self, payload: &[u8]) -> Result<(), SyncError> {
        let heartbeat: HeartBeat = serde_json::from_slice(payload)
            .map_err(|e| SyncError::MalformedInput(format!("heartbeat: {}", e)))?;

        let resource = self.resource_by_name(&heartbeat.resource_name)?;
        let now = chrono::Utc::now().timestamp();
        self.store.record_heartbeat(&resource.name, now)?;

        let state = self.state_for(&resource.id);
        state.lock().await.last_seen = Some(now);
        Ok(())
    }
}

#[async_trait]
impl MembershipObserver for ResourceSyncManager {
    async fn membership_changed(&self, member: &Member) {
        match self.store.member_resources(&member.id) {
            Ok(ids) => {
                debug!("{} changed, invalidating {} resources", member.email, ids.len());
                self.invalidate(&ids).await;
            }
            Err(e) => {
                warn!("Failed to read grants for {}: {}, invalidating all", member.email, e);
                self.invalidate_all().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;
    use crate::db::MemberDb;
    use crate::testing::{seed_member, temp_store, FakeDevices, RecordingNotifier};
    use crate::types::MemberTier;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: Arc<MemberDb>,
        bus: Arc<LocalBus>,
        devices: Arc<FakeDevices>,
        notifier: Arc<RecordingNotifier>,
        manager: Arc<ResourceSyncManager>,
        door: Resource,
    }

    fn fixture_with(config: SyncConfig) -> Fixture {
        let (dir, store) = temp_store();
        let bus = Arc::new(LocalBus::new());
        let devices = Arc::new(FakeDevices::default());
        let notifier = Arc::new(RecordingNotifier::default());

        let door = Resource::new("front-door", "http://10.0.0.20");
        store.upsert_resource(&door).unwrap();

        let manager = Arc::new(ResourceSyncManager::new(
            store.clone(),
            bus.clone(),
            devices.clone(),
            notifier.clone(),
            config,
        ));

        Fixture {
            _dir: dir,
            store,
            bus,
            devices,
            notifier,
            manager,
            door,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(SyncConfig {
            auto_push_on_mismatch: true,
            retry: RetryConfig::none(),
        })
    }

    fn grant(f: &Fixture, name: &str, rfid: &str, tier: MemberTier) -> Member {
        let member = seed_member(f.store.as_ref(), name, &format!("{}@example.org", name), rfid, tier);
        f.store.grant(&member.id, &f.door.id).unwrap();
        member
    }

    fn report(name: &str, hash: &str) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({"name": name, "hash": hash})).unwrap()
    }

    #[tokio::test]
    async fn test_mismatched_report_pushes_then_confirms() {
        let f = fixture();
        grant(&f, "ada", "f3ec6234", MemberTier::Standard);
        grant(&f, "bob", "00aa11bb", MemberTier::Premium);

        let h2 = acl_hash(&canonical_acl(vec!["f3ec6234".into(), "00aa11bb".into()]));
        let h1 = acl_hash(&canonical_acl(vec!["f3ec6234".into()]));

        let status = f.manager.on_health_report(&report("front-door", &h1)).await.unwrap();
        assert_eq!(status, SyncStatus::OutOfDate);

        let pushes = f.devices.pushes();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].0, "front-door");
        assert_eq!(pushes[0].1, vec!["00aa11bb".to_string(), "f3ec6234".to_string()]);

        let status = f.manager.on_health_report(&report("front-door", &h2)).await.unwrap();
        assert_eq!(status, SyncStatus::InSync);
        assert_eq!(f.devices.pushes().len(), 1);
    }

    #[tokio::test]
    async fn test_mismatch_without_auto_push() {
        let f = fixture_with(SyncConfig {
            auto_push_on_mismatch: false,
            retry: RetryConfig::none(),
        });
        grant(&f, "ada", "f3ec6234", MemberTier::Standard);

        let status = f.manager.on_health_report(&report("front-door", "deadbeef")).await.unwrap();
        assert_eq!(status, SyncStatus::OutOfDate);
        assert!(f.devices.pushes().is_empty());
    }

    #[tokio::test]
    async fn test_matching_first_report_is_in_sync() {
        let f = fixture();
        grant(&f, "ada", "f3ec6234", MemberTier::Standard);
        let hash = acl_hash(&["f3ec6234".to_string()]);

        let status = f.manager.on_health_report(&report("front-door", &hash)).await.unwrap();
        assert_eq!(status, SyncStatus::InSync);
        assert!(f.devices.pushes().is_empty());
    }

    #[tokio::test]
    async fn test_report_for_unknown_resource() {
        let f = fixture();
        let err = f.manager.on_health_report(&report("back-door", "x")).await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_unreachable_push_leaves_out_of_date() {
        let f = fixture();
        grant(&f, "ada", "f3ec6234", MemberTier::Standard);
        f.devices.set_unreachable("front-door", true);

        let status = f.manager.on_health_report(&report("front-door", "stale")).await.unwrap();
        assert_eq!(status, SyncStatus::OutOfDate);
        let state = f.manager.state_of(&f.door.id).await.unwrap();
        assert!(state.last_error.is_some());
        assert_eq!(state.pushed_hash, None);
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let f = fixture();
        grant(&f, "ada", "f3ec6234", MemberTier::Standard);
        grant(&f, "bob", "00aa11bb", MemberTier::Inactive);
        grant(&f, "cyd", "9c0ffee0", MemberTier::Credited);

        let cancel = CancellationToken::new();
        let first = f.manager.reconcile_all(&cancel).await.unwrap();
        let second = f.manager.reconcile_all(&cancel).await.unwrap();
        assert_eq!(first, second);

        let pushes = f.devices.pushes();
        assert_eq!(pushes.len(), 2);
        assert_eq!(pushes[0].1, pushes[1].1);
        assert_eq!(pushes[0].1, vec!["9c0ffee0".to_string(), "f3ec6234".to_string()]);
    }

    #[tokio::test]
    async fn test_update_resources_skips_in_sync() {
        let f = fixture();
        grant(&f, "ada", "f3ec6234", MemberTier::Standard);
        let other = Resource::new("back-door", "http://10.0.0.21");
        f.store.upsert_resource(&other).unwrap();

        let hash = acl_hash(&["f3ec6234".to_string()]);
        f.manager.on_health_report(&report("front-door", &hash)).await.unwrap();

        let report = f.manager.update_resources(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.pushed.len(), 1);
        assert_eq!(report.pushed[0].0, "back-door");
    }

    #[tokio::test]
    async fn test_membership_change_invalidates() {
        let f = fixture();
        let ada = grant(&f, "ada", "f3ec6234", MemberTier::Standard);
        let hash = acl_hash(&["f3ec6234".to_string()]);
        f.manager.on_health_report(&report("front-door", &hash)).await.unwrap();
        assert_eq!(f.manager.status_of(&f.door.id).await, SyncStatus::InSync);

        f.manager.membership_changed(&ada).await;
        assert_eq!(f.manager.status_of(&f.door.id).await, SyncStatus::OutOfDate);
    }

    #[tokio::test]
    async fn test_check_status_reads_probe_hash() {
        let f = fixture();
        grant(&f, "ada", "f3ec6234", MemberTier::Standard);
        let hash = acl_hash(&["f3ec6234".to_string()]);

        let door = f.door.clone();
        f.devices.set_probe_body("front-door", &format!(r#"{{"hash":"{}"}}"#, hash));
        assert_eq!(f.manager.check_status(&door).await.unwrap(), SyncStatus::InSync);
        assert!(f.devices.pushes().is_empty());
    }

    #[tokio::test]
    async fn test_unhashed_status_marks_out_of_date() {
        let f = fixture();
        grant(&f, "ada", "f3ec6234", MemberTier::Standard);
        let door = f.door.clone();

        f.devices.set_probe_body("front-door", "OK");
        assert_eq!(f.manager.check_status(&door).await.unwrap(), SyncStatus::OutOfDate);
        assert!(f.devices.pushes().is_empty());

        // Still stale until a push is confirmed, and the next pass picks it up
        assert_eq!(f.manager.check_status(&door).await.unwrap(), SyncStatus::OutOfDate);
        let report = f.manager.update_resources(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.pushed.len(), 1);
    }

    #[tokio::test]
    async fn test_check_all_continues_past_unreachable() {
        let f = fixture();
        let other = Resource::new("back-door", "http://10.0.0.21");
        f.store.upsert_resource(&other).unwrap();
        f.devices.set_unreachable("front-door", true);

        assert_eq!(f.manager.check_all_status().await, 1);
        let mut probed = f.devices.probes();
        probed.sort();
        assert_eq!(probed, vec!["back-door".to_string(), "front-door".to_string()]);
    }

    #[tokio::test]
    async fn test_access_event_resolves_username() {
        let f = fixture();
        grant(&f, "ada", "f3ec6234", MemberTier::Standard);

        let payload = br#"{"type":"access","time":1631240207,"isKnown":"true","username":"","uid":"f3ec6234","door":"front-door"}"#;
        let event = f.manager.on_access_event("front-door", payload).await.unwrap();
        assert_eq!(event.username, "ada");
        assert!(event.is_known);

        let stored = f.store.list_access_events(10).unwrap();
        assert_eq!(stored, vec![event.clone()]);

        let sent = f.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].body, "name: ada, rfid: f3ec6234, door: front-door, time: 1631240207");
    }

    #[tokio::test]
    async fn test_heartbeat_updates_last_seen() {
        let f = fixture();
        f.manager.on_heartbeat(br#"{"door":"front-door"}"#).await.unwrap();

        let state = f.manager.state_of(&f.door.id).await.unwrap();
        assert!(state.last_seen.is_some());
        let stored = f.store.get_resource(&f.door.id).unwrap().unwrap();
        assert!(stored.last_heartbeat.is_some());

        let err = f.manager.on_heartbeat(br#"{"door":"nowhere"}"#).await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_malformed_send_is_dropped_and_subscription_survives() {
        let f = fixture();
        grant(&f, "ada", "f3ec6234", MemberTier::Standard);
        f.manager.init_resources().await.unwrap();

        f.bus.publish("front-door/send", b"{not json".to_vec()).await.unwrap();
        f.bus.drain().await;
        assert!(f.store.list_access_events(10).unwrap().is_empty());
        assert!(f.notifier.sent().is_empty());

        let good = br#"{"type":"access","time":5,"isKnown":true,"username":"ada","uid":"f3ec6234","door":"front-door"}"#;
        f.bus.publish("front-door/send", good.to_vec()).await.unwrap();
        f.bus.drain().await;
        assert_eq!(f.store.list_access_events(10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_init_subscribes_four_topics_once() {
        let f = fixture();
        assert_eq!(f.manager.init_resources().await.unwrap(), 1);
        assert_eq!(f.manager.init_resources().await.unwrap(), 0);

        assert_eq!(
            f.bus.topics(),
            vec![
                "front-door/cleanup".to_string(),
                "front-door/result".to_string(),
                "front-door/send".to_string(),
                "front-door/sync".to_string(),
            ]
        );
        // Each init checks status
        assert_eq!(f.devices.probes().len(), 2);
    }

    #[tokio::test]
    async fn test_bus_health_report_round_trip() {
        let f = fixture();
        grant(&f, "ada", "f3ec6234", MemberTier::Standard);
        f.manager.init_resources().await.unwrap();

        f.bus.publish("front-door/result", report("front-door", "stale")).await.unwrap();
        f.bus.drain().await;
        assert_eq!(f.manager.status_of(&f.door.id).await, SyncStatus::OutOfDate);
        assert_eq!(f.devices.pushes().len(), 1);

        let hash = acl_hash(&["f3ec6234".to_string()]);
        f.bus.publish("front-door/result", report("front-door", &hash)).await.unwrap();
        f.bus.drain().await;
        assert_eq!(f.manager.status_of(&f.door.id).await, SyncStatus::InSync);
    }
}
