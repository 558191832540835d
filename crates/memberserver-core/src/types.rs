//! ============================================================================
//! Core Types for Memberserver
//! ============================================================================
//! Defines members, resources, access events and the JSON payloads exchanged
//! with door controllers over the message bus and HTTP.
//! ============================================================================

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

// ============================================================================
// Members
// ============================================================================

/// Membership tier derived from payment history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MemberTier {
    /// No access - lapsed or never paid
    #[default]
    Inactive,
    Standard,
    Classic,
    Premium,
    /// Granted by an administrator, never overwritten by payment state
    Credited,
}

impl MemberTier {
    pub const ALL: [MemberTier; 5] = [
        MemberTier::Inactive,
        MemberTier::Standard,
        MemberTier::Classic,
        MemberTier::Premium,
        MemberTier::Credited,
    ];

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "inactive" => Some(Self::Inactive),
            "standard" => Some(Self::Standard),
            "classic" => Some(Self::Classic),
            "premium" => Some(Self::Premium),
            "credited" => Some(Self::Credited),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Standard => "standard",
            Self::Classic => "classic",
            Self::Premium => "premium",
            Self::Credited => "credited",
        }
    }

    /// Whether members of this tier belong on resource access lists
    pub fn grants_access(&self) -> bool {
        *self != MemberTier::Inactive
    }
}

impl fmt::Display for MemberTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A member of the organization.
/// Resource grants are kept in their own table, not on the member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub id: String,
    pub name: String,
    pub email: String,
    /// Assigned RFID fob, if any
    pub rfid: Option<String>,
    pub tier: MemberTier,
    /// Payment provider subscription id
    pub subscription_id: Option<String>,
    pub created_at: i64,
}

impl Member {
    /// Create a new member with a fresh id
    pub fn new(name: impl Into<String>, email: impl Into<String>, tier: MemberTier) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            email: email.into(),
            rfid: None,
            tier,
            subscription_id: None,
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Subscription id usable against the payment provider.
    /// Legacy imports stored the literal "none" for members without one.
    pub fn billing_subscription(&self) -> Option<&str> {
        self.subscription_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("none"))
    }

    /// RFID that should appear on access lists, if the member holds one
    pub fn active_rfid(&self) -> Option<&str> {
        if !self.tier.grants_access() {
            return None;
        }
        self.rfid.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }
}

/// "Subscription created" event emitted by the payment provider webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionCreated {
    pub subscription_id: String,
    pub name: String,
    pub email: String,
}

// ============================================================================
// Resources
// ============================================================================

/// A network-addressable door controller or RFID reader
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    /// Topic prefix and display name, e.g. "frontdoor"
    pub name: String,
    /// Base URL of the device's HTTP API
    pub address: String,
    /// Granted automatically to newly registered members
    pub is_default: bool,
    /// Unix seconds of the last heartbeat received
    pub last_heartbeat: Option<i64>,
}

impl Resource {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            address: address.into(),
            is_default: false,
            last_heartbeat: None,
        }
    }
}

/// Synchronization status of a resource's access list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// No status check or health report seen yet
    #[default]
    Unknown,
    /// Device confirmed the current access list hash
    InSync,
    /// Device list is stale or membership changed since the last confirmation
    OutOfDate,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStatus::Unknown => write!(f, "unknown"),
            SyncStatus::InSync => write!(f, "in-sync"),
            SyncStatus::OutOfDate => write!(f, "out-of-date"),
        }
    }
}

// ============================================================================
// Access Events
// ============================================================================

/// Access attempt reported by a device. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessEvent {
    pub id: String,
    pub resource: String,
    pub rfid: String,
    pub username: String,
    /// Unix seconds as reported by the device
    pub timestamp: i64,
    pub is_known: bool,
    pub event_type: String,
}

impl AccessEvent {
    /// Human-readable one-line summary for notifications
    pub fn summary(&self) -> String {
        format!(
            "name: {}, rfid: {}, door: {}, time: {}",
            self.username, self.rfid, self.resource, self.timestamp
        )
    }
}

// ============================================================================
// Device Wire Payloads
// ============================================================================

/// Body of `POST <address>/update`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AclUpdateRequest {
    pub acl: Vec<String>,
}

/// Health report published on `<name>/result`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AclResponse {
    pub name: String,
    pub hash: String,
}

/// Heartbeat published on `<name>/sync`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartBeat {
    #[serde(rename = "door")]
    pub resource_name: String,
}

/// Access log entry published on `<name>/send`
/// e.g. {"cmd":"log","type":"access","time":1631240207,"isKnown":"true","username":"Stanley Hash","uid":"f3ec6234","door":"frontdoor"}
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessEventPayload {
    #[serde(rename = "type", default)]
    pub event_type: String,
    pub time: i64,
    #[serde(rename = "isKnown", default, deserialize_with = "bool_or_string")]
    pub is_known: bool,
    #[serde(default)]
    pub username: String,
    #[serde(rename = "uid")]
    pub rfid: String,
    #[serde(default)]
    pub door: String,
}

/// Firmware sends `isKnown` as either a JSON bool or "true"/"false".
fn bool_or_string<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Text(String),
    }

    match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => Ok(b),
        Flag::Text(s) => match s.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" | "" => Ok(false),
            other => Err(serde::de::Error::custom(format!(
                "invalid isKnown value: {}",
                other
            ))),
        },
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Error taxonomy for resource synchronization and device handlers
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Resource unreachable: {0}")]
    Unreachable(String),

    #[error("Device rejected request: {0}")]
    Rejected(String),

    #[error("Malformed payload: {0}")]
    MalformedInput(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}
