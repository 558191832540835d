//! In-memory stand-ins for the network collaborators, shared by unit tests.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use crate::db::{MemberDb, Store};
use crate::ipcheck::IpSource;
use crate::notify::{Notification, Notifier};
use crate::payments::{PaymentError, PaymentProvider, SubscriptionSnapshot, SubscriptionStatus};
use crate::resources::DeviceClient;
use crate::types::{AclUpdateRequest, Member, MemberTier, Resource, SyncError};

/// Fresh store in a throwaway directory. Keep the `TempDir` alive.
pub fn temp_store() -> (TempDir, Arc<MemberDb>) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("members.redb");
    let db = MemberDb::open(Some(path.to_str().unwrap())).unwrap();
    (dir, Arc::new(db))
}

pub fn seed_member(store: &dyn Store, name: &str, email: &str, rfid: &str, tier: MemberTier) -> Member {
    let mut member = Member::new(name, email, tier);
    if !rfid.is_empty() {
        member.rfid = Some(rfid.to_string());
    }
    store.upsert_member(&member).unwrap();
    member
}

// ============================================================================
// Devices
// ============================================================================

#[derive(Default)]
pub struct FakeDevices {
    pushes: Mutex<Vec<(String, Vec<String>)>>,
    probes: Mutex<Vec<String>>,
    probe_bodies: Mutex<HashMap<String, String>>,
    unreachable: Mutex<HashSet<String>>,
}

impl FakeDevices {
    /// (resource name, pushed ACL) in push order
    pub fn pushes(&self) -> Vec<(String, Vec<String>)> {
        self.pushes.lock().unwrap().clone()
    }

    /// Names of every probed resource, including failed probes
    pub fn probes(&self) -> Vec<String> {
        self.probes.lock().unwrap().clone()
    }

    pub fn set_probe_body(&self, name: &str, body: &str) {
        self.probe_bodies
            .lock()
            .unwrap()
            .insert(name.to_string(), body.to_string());
    }

    pub fn set_unreachable(&self, name: &str, unreachable: bool) {
        let mut set = self.unreachable.lock().unwrap();
        if unreachable {
            set.insert(name.to_string());
        } else {
            set.remove(name);
        }
    }

    fn is_unreachable(&self, name: &str) -> bool {
        self.unreachable.lock().unwrap().contains(name)
    }
}

#[async_trait]
impl DeviceClient for FakeDevices {
    async fn probe(&self, resource: &Resource) -> Result<String, SyncError> {
        self.probes.lock().unwrap().push(resource.name.clone());
        if self.is_unreachable(&resource.name) {
            return Err(SyncError::Unreachable(resource.name.clone()));
        }
        Ok(self
            .probe_bodies
            .lock()
            .unwrap()
            .get(&resource.name)
            .cloned()
            .unwrap_or_else(|| "ok".to_string()))
    }

    async fn push_acl(&self, resource: &Resource, request: &AclUpdateRequest) -> Result<(), SyncError> {
        if self.is_unreachable(&resource.name) {
            return Err(SyncError::Unreachable(resource.name.clone()));
        }
        self.pushes
            .lock()
            .unwrap()
            .push((resource.name.clone(), request.acl.clone()));
        Ok(())
    }
}

// ============================================================================
// Payments
// ============================================================================

#[derive(Default)]
pub struct FakePayments {
    subscriptions: Mutex<HashMap<String, Option<SubscriptionSnapshot>>>,
    calls: AtomicUsize,
}

impl FakePayments {
    pub fn set(&self, subscription_id: &str, status: SubscriptionStatus, amount: &str) {
        self.subscriptions.lock().unwrap().insert(
            subscription_id.to_string(),
            Some(SubscriptionSnapshot {
                status,
                last_payment_amount: amount.to_string(),
            }),
        );
    }

    /// Lookups of this subscription fail permanently
    pub fn fail(&self, subscription_id: &str) {
        self.subscriptions
            .lock()
            .unwrap()
            .insert(subscription_id.to_string(), None);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentProvider for FakePayments {
    async fn get_subscription(&self, subscription_id: &str) -> Result<SubscriptionSnapshot, PaymentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.subscriptions.lock().unwrap().get(subscription_id) {
            Some(Some(snapshot)) => Ok(snapshot.clone()),
            _ => Err(PaymentError::Status {
                status: 404,
                body: "RESOURCE_NOT_FOUND".to_string(),
            }),
        }
    }
}

// ============================================================================
// Notifications / IP
// ============================================================================

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
    failing: AtomicBool,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }

    /// While failing, deliveries error out and are not recorded
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("channel down"));
        }
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

/// Answers with the given addresses in order, then fails
pub struct FixedIpSource {
    answers: Mutex<VecDeque<String>>,
}

impl FixedIpSource {
    pub fn new(answers: &[&str]) -> Self {
        Self {
            answers: Mutex::new(answers.iter().map(|s| s.to_string()).collect()),
        }
    }
}

#[async_trait]
impl IpSource for FixedIpSource {
    async fn current_ip(&self) -> Result<String> {
        self.answers
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow!("connection refused"))
    }
}
