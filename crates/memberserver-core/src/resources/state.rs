//! Per-resource synchronization state.
//!
//! One [`ResourceState`] per resource, each behind its own lock in the sync
//! manager's arena. All status transitions live here.

use super::acl::same_hash;
use crate::types::SyncStatus;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceState {
    pub status: SyncStatus,
    /// Store-side hash computed on the last status check or push
    pub expected_hash: Option<String>,
    /// Hash the device last reported
    pub reported_hash: Option<String>,
    /// Hash carried by the last successful push since the last invalidation
    pub pushed_hash: Option<String>,
    /// Unix seconds of the last heartbeat
    pub last_seen: Option<i64>,
    /// Unix seconds of the last successful push
    pub last_push: Option<i64>,
    pub last_error: Option<String>,
}

impl ResourceState {
    /// Apply a device-reported hash against the current store-side hash.
    ///
    /// A mismatch always means OutOfDate. A match confirms InSync from
    /// Unknown, keeps InSync, and lifts OutOfDate only when the last push
    /// carried exactly this hash.
    pub fn observe_report(&mut self, reported: &str, expected: &str) -> SyncStatus {
        self.expected_hash = Some(expected.to_string());
        self.reported_hash = Some(reported.trim().to_lowercase());

        self.status = if !same_hash(reported, expected) {
            SyncStatus::OutOfDate
        } else {
            match self.status {
                SyncStatus::Unknown | SyncStatus::InSync => SyncStatus::InSync,
                SyncStatus::OutOfDate => {
                    if self.pushed_hash.as_deref() == Some(expected) {
                        SyncStatus::InSync
                    } else {
                        SyncStatus::OutOfDate
                    }
                }
            }
        };
        self.status
    }

    /// Record the store-side hash from a status check. If the device's last
    /// report no longer matches, the device is stale.
    pub fn observe_expected(&mut self, expected: &str) -> SyncStatus {
        self.expected_hash = Some(expected.to_string());
        if let Some(reported) = &self.reported_hash {
            if !same_hash(reported, expected) {
                self.status = SyncStatus::OutOfDate;
            }
        }
        self.status
    }

    /// The device answered but did not say which list it holds. Nothing is
    /// confirmed, so a first check leaves Unknown for OutOfDate.
    pub fn observe_unhashed_status(&mut self) -> SyncStatus {
        if self.status == SyncStatus::Unknown {
            self.status = SyncStatus::OutOfDate;
        }
        self.status
    }

    /// A push was accepted. Status is untouched until the device confirms.
    pub fn record_push(&mut self, hash: &str, at: i64) {
        self.expected_hash = Some(hash.to_string());
        self.pushed_hash = Some(hash.to_string());
        self.last_push = Some(at);
        self.last_error = None;
    }

    /// Membership changed after the last confirmation
    pub fn invalidate(&mut self) {
        if self.status == SyncStatus::InSync {
            self.status = SyncStatus::OutOfDate;
        }
        self.pushed_hash = None;
    }

    pub fn needs_push(&self) -> bool {
        self.status != SyncStatus::InSync
    }
}
