// ============================================================================
// MemberDb - Embedded Database (redb)
// ============================================================================
// Persistent storage for members, resources, grants, access events and
// small settings such as the cached public IP address.
// Default path: ~/.memberserver/members.redb (override via MEMBERSERVER_DB_PATH)
// ============================================================================

pub mod types;

pub use types::DbStats;

use anyhow::{anyhow, bail, Result};
use redb::{Database, ReadableTable, TableDefinition, TableHandle};
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::types::{AccessEvent, Member, MemberTier, Resource};

type RecordTable = TableDefinition<'static, &'static str, &'static [u8]>;

// Table definitions
const MEMBERS: RecordTable = TableDefinition::new("members");
const RESOURCES: RecordTable = TableDefinition::new("resources");
/// Key: `<resource_id>/<member_id>`, empty value
const GRANTS: RecordTable = TableDefinition::new("grants");
/// Key: zero-padded unix seconds + event id, so iteration is chronological
const ACCESS_EVENTS: RecordTable = TableDefinition::new("access_events");
const SETTINGS: TableDefinition<&str, &str> = TableDefinition::new("settings");

/// Persistence boundary used by the scheduler, evaluator and sync manager.
///
/// Implementations must answer `resource_acl` from a single consistent
/// snapshot of members and grants.
pub trait Store: Send + Sync {
    fn list_members(&self) -> Result<Vec<Member>>;
    fn get_member(&self, member_id: &str) -> Result<Option<Member>>;
    fn get_member_by_email(&self, email: &str) -> Result<Option<Member>>;
    fn get_member_by_rfid(&self, rfid: &str) -> Result<Option<Member>>;
    fn upsert_member(&self, member: &Member) -> Result<()>;
    /// Set a member's tier in one write. Returns whether the stored tier
    /// changed. A credited member keeps its tier.
    fn set_member_tier(&self, member_id: &str, tier: MemberTier) -> Result<bool>;
    fn assign_rfid(&self, email: &str, rfid: &str) -> Result<Member>;

    fn list_resources(&self) -> Result<Vec<Resource>>;
    fn get_resource(&self, resource_id: &str) -> Result<Option<Resource>>;
    fn get_resource_by_name(&self, name: &str) -> Result<Option<Resource>>;
    fn upsert_resource(&self, resource: &Resource) -> Result<()>;
    /// Record a heartbeat. Returns false when no resource has that name.
    fn record_heartbeat(&self, resource_name: &str, at: i64) -> Result<bool>;

    fn grant(&self, member_id: &str, resource_id: &str) -> Result<()>;
    fn revoke(&self, member_id: &str, resource_id: &str) -> Result<bool>;
    fn member_resources(&self, member_id: &str) -> Result<Vec<String>>;
    /// RFIDs currently permitted at a resource, in storage order
    fn resource_acl(&self, resource_id: &str) -> Result<Vec<String>>;

    fn log_access_event(&self, event: &AccessEvent) -> Result<()>;
    /// Most recent events first
    fn list_access_events(&self, limit: usize) -> Result<Vec<AccessEvent>>;

    fn get_setting(&self, key: &str) -> Result<Option<String>>;
    fn put_setting(&self, key: &str, value: &str) -> Result<()>;
}

/// Embedded database for the member server
pub struct MemberDb {
    db: Database,
    path: PathBuf,
}

impl MemberDb {
    /// Open (or create) the database at the given path.
    /// If `path` is None, uses MEMBERSERVER_DB_PATH env var or ~/.memberserver/members.redb
    pub fn open(path: Option<&str>) -> Result<Self> {
        let db_path = if let Some(p) = path {
            PathBuf::from(p)
        } else if let Ok(env_path) = std::env::var("MEMBERSERVER_DB_PATH") {
            PathBuf::from(env_path)
        } else {
            let home = dirs::home_dir().ok_or_else(|| anyhow!("Cannot determine home directory"))?;
            let data_dir = home.join(".memberserver");
            std::fs::create_dir_all(&data_dir)
                .map_err(|e| anyhow!("Failed to create .memberserver directory: {}", e))?;
            data_dir.join("members.redb")
        };

        info!("Opening database at: {}", db_path.display());

        let db = Database::create(&db_path)
            .map_err(|e| anyhow!("Failed to open database: {}", e))?;

        // Ensure tables exist by doing a write transaction
        let write_txn = db
            .begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        {
            for table in [MEMBERS, RESOURCES, GRANTS, ACCESS_EVENTS] {
                let _ = write_txn
                    .open_table(table)
                    .map_err(|e| anyhow!("Failed to create {} table: {}", table.name(), e))?;
            }
            let _ = write_txn
                .open_table(SETTINGS)
                .map_err(|e| anyhow!("Failed to create settings table: {}", e))?;
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit init: {}", e))?;

        info!("Database ready");

        Ok(Self { db, path: db_path })
    }

    /// Get the database file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    // ========================================================================
    // Record Helpers
    // ========================================================================

    fn put_record<T: Serialize>(&self, table: RecordTable, key: &str, record: &T) -> Result<()> {
        let value = bincode::serialize(record)
            .map_err(|e| anyhow!("Failed to serialize {} record: {}", table.name(), e))?;

        let write_txn = self.db.begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        {
            let mut t = write_txn.open_table(table)
                .map_err(|e| anyhow!("Failed to open {} table: {}", table.name(), e))?;
            t.insert(key, value.as_slice())
                .map_err(|e| anyhow!("Failed to insert into {}: {}", table.name(), e))?;
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit: {}", e))?;
        Ok(())
    }

    fn get_record<T: DeserializeOwned>(&self, table: RecordTable, key: &str) -> Result<Option<T>> {
        let read_txn = self.db.begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let t = read_txn.open_table(table)
            .map_err(|e| anyhow!("Failed to open {} table: {}", table.name(), e))?;

        match t.get(key).map_err(|e| anyhow!("Failed to get {}: {}", key, e))? {
            Some(value) => {
                let record: T = bincode::deserialize(value.value())
                    .map_err(|e| anyhow!("Failed to deserialize {} record: {}", table.name(), e))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn list_records<T: DeserializeOwned>(&self, table: RecordTable) -> Result<Vec<T>> {
        let read_txn = self.db.begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let t = read_txn.open_table(table)
            .map_err(|e| anyhow!("Failed to open {} table: {}", table.name(), e))?;

        let mut results = Vec::new();
        let iter = t.range::<&str>(..)
            .map_err(|e| anyhow!("Failed to iterate {}: {}", table.name(), e))?;
        for entry in iter {
            let (_key, value) = entry.map_err(|e| anyhow!("Failed to read entry: {}", e))?;
            let record: T = bincode::deserialize(value.value())
                .map_err(|e| anyhow!("Failed to deserialize {} record: {}", table.name(), e))?;
            results.push(record);
        }
        Ok(results)
    }

    fn grant_keys(&self) -> Result<Vec<String>> {
        let read_txn = self.db.begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let t = read_txn.open_table(GRANTS)
            .map_err(|e| anyhow!("Failed to open grants table: {}", e))?;

        let mut keys = Vec::new();
        for entry in t.range::<&str>(..).map_err(|e| anyhow!("Failed to iterate grants: {}", e))? {
            let (key, _) = entry.map_err(|e| anyhow!("Failed to read entry: {}", e))?;
            keys.push(key.value().to_string());
        }
        Ok(keys)
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    pub fn stats(&self) -> Result<DbStats> {
        let members = self.list_members()?;
        let mut stats = DbStats {
            total_members: members.len(),
            total_resources: self.list_resources()?.len(),
            total_grants: self.grant_keys()?.len(),
            ..DbStats::default()
        };
        for member in &members {
            *stats.members_by_tier.entry(member.tier.to_string()).or_insert(0) += 1;
        }

        let read_txn = self.db.begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn.open_table(ACCESS_EVENTS)
            .map_err(|e| anyhow!("Failed to open access_events table: {}", e))?;
        stats.total_access_events = table.range::<&str>(..)
            .map_err(|e| anyhow!("Failed to iterate access events: {}", e))?
            .count();

        Ok(stats)
    }
}

fn grant_key(resource_id: &str, member_id: &str) -> String {
    format!("{}/{}", resource_id, member_id)
}

fn event_key(event: &AccessEvent) -> String {
    format!("{:020}:{}", event.timestamp.max(0), event.id)
}

impl Store for MemberDb {
    // ========================================================================
    // Member Operations
    // ========================================================================

    fn list_members(&self) -> Result<Vec<Member>> {
        self.list_records(MEMBERS)
    }

    fn get_member(&self, member_id: &str) -> Result<Option<Member>> {
        self.get_record(MEMBERS, member_id)
    }

    fn get_member_by_email(&self, email: &str) -> Result<Option<Member>> {
        let email = email.trim();
        Ok(self
            .list_members()?
            .into_iter()
            .find(|m| m.email.eq_ignore_ascii_case(email)))
    }

    fn get_member_by_rfid(&self, rfid: &str) -> Result<Option<Member>> {
        let rfid = rfid.trim();
        if rfid.is_empty() {
            return Ok(None);
        }
        Ok(self
            .list_members()?
            .into_iter()
            .find(|m| m.rfid.as_deref().map(str::trim) == Some(rfid)))
    }

    fn upsert_member(&self, member: &Member) -> Result<()> {
        self.put_record(MEMBERS, &member.id, member)?;
        debug!("Stored member: {} <{}>", member.id, member.email);
        Ok(())
    }

    fn set_member_tier(&self, member_id: &str, tier: MemberTier) -> Result<bool> {
        let write_txn = self.db.begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        let previous = {
            let mut table = write_txn.open_table(MEMBERS)
                .map_err(|e| anyhow!("Failed to open members table: {}", e))?;

            let mut member: Member = match table.get(member_id)
                .map_err(|e| anyhow!("Failed to get member {}: {}", member_id, e))?
            {
                Some(value) => bincode::deserialize(value.value())
                    .map_err(|e| anyhow!("Failed to deserialize member: {}", e))?,
                None => bail!("Member not found: {}", member_id),
            };

            if member.tier == tier {
                return Ok(false);
            }
            if member.tier == MemberTier::Credited {
                debug!("Member {} is credited, keeping tier over {}", member_id, tier);
                return Ok(false);
            }

            let previous = member.tier;
            member.tier = tier;
            let value = bincode::serialize(&member)
                .map_err(|e| anyhow!("Failed to serialize member: {}", e))?;
            table.insert(member_id, value.as_slice())
                .map_err(|e| anyhow!("Failed to update member {}: {}", member_id, e))?;
            previous
        };
        write_txn.commit().map_err(|e| anyhow!("Failed to commit: {}", e))?;

        debug!("Updated member {} tier {} -> {}", member_id, previous, tier);
        Ok(true)
    }

    fn assign_rfid(&self, email: &str, rfid: &str) -> Result<Member> {
        let rfid = rfid.trim();
        if rfid.is_empty() {
            bail!("RFID must not be empty");
        }

        let mut member = self
            .get_member_by_email(email)?
            .ok_or_else(|| anyhow!("No member with email {}", email))?;

        if let Some(holder) = self.get_member_by_rfid(rfid)? {
            if holder.id != member.id {
                bail!("RFID {} is already assigned to {}", rfid, holder.email);
            }
        }

        member.rfid = Some(rfid.to_string());
        self.upsert_member(&member)?;
        info!("Assigned RFID to {}", member.email);
        Ok(member)
    }

    // ========================================================================
    // Resource Operations
    // ========================================================================

    fn list_resources(&self) -> Result<Vec<Resource>> {
        self.list_records(RESOURCES)
    }

    fn get_resource(&self, resource_id: &str) -> Result<Option<Resource>> {
        self.get_record(RESOURCES, resource_id)
    }

    fn get_resource_by_name(&self, name: &str) -> Result<Option<Resource>> {
        Ok(self.list_resources()?.into_iter().find(|r| r.name == name))
    }

    fn upsert_resource(&self, resource: &Resource) -> Result<()> {
        self.put_record(RESOURCES, &resource.id, resource)?;
        debug!("Stored resource: {} ({})", resource.name, resource.id);
        Ok(())
    }

    fn record_heartbeat(&self, resource_name: &str, at: i64) -> Result<bool> {
        let Some(mut resource) = self.get_resource_by_name(resource_name)? else {
            return Ok(false);
        };
        resource.last_heartbeat = Some(at);
        self.put_record(RESOURCES, &resource.id, &resource)?;
        Ok(true)
    }

    // ========================================================================
    // Grant Operations
    // ========================================================================

    fn grant(&self, member_id: &str, resource_id: &str) -> Result<()> {
        let key = grant_key(resource_id, member_id);
        let empty: &[u8] = &[];

        let write_txn = self.db.begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        {
            let mut table = write_txn.open_table(GRANTS)
                .map_err(|e| anyhow!("Failed to open grants table: {}", e))?;
            table.insert(key.as_str(), empty)
                .map_err(|e| anyhow!("Failed to insert grant: {}", e))?;
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit: {}", e))?;

        debug!("Granted member {} at resource {}", member_id, resource_id);
        Ok(())
    }

    fn revoke(&self, member_id: &str, resource_id: &str) -> Result<bool> {
        let key = grant_key(resource_id, member_id);

        let write_txn = self.db.begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        let removed;
        {
            let mut table = write_txn.open_table(GRANTS)
                .map_err(|e| anyhow!("Failed to open grants table: {}", e))?;
            removed = table.remove(key.as_str())
                .map_err(|e| anyhow!("Failed to remove grant: {}", e))?
                .is_some();
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit delete: {}", e))?;

        if removed {
            debug!("Revoked member {} at resource {}", member_id, resource_id);
        }
        Ok(removed)
    }

    fn member_resources(&self, member_id: &str) -> Result<Vec<String>> {
        let suffix = format!("/{}", member_id);
        Ok(self
            .grant_keys()?
            .into_iter()
            .filter_map(|k| k.strip_suffix(&suffix).map(str::to_string))
            .collect())
    }

    fn resource_acl(&self, resource_id: &str) -> Result<Vec<String>> {
        let prefix = format!("{}/", resource_id);

        // One read transaction: grants and members come from the same snapshot
        let read_txn = self.db.begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let grants = read_txn.open_table(GRANTS)
            .map_err(|e| anyhow!("Failed to open grants table: {}", e))?;
        let members = read_txn.open_table(MEMBERS)
            .map_err(|e| anyhow!("Failed to open members table: {}", e))?;

        let mut acl = Vec::new();
        let iter = grants.range::<&str>(prefix.as_str()..)
            .map_err(|e| anyhow!("Failed to iterate grants: {}", e))?;
        for entry in iter {
            let (key, _) = entry.map_err(|e| anyhow!("Failed to read entry: {}", e))?;
            let Some(member_id) = key.value().strip_prefix(prefix.as_str()) else {
                break;
            };
            let Some(value) = members.get(member_id)
                .map_err(|e| anyhow!("Failed to get member {}: {}", member_id, e))?
            else {
                debug!("Grant references missing member {}", member_id);
                continue;
            };
            let member: Member = bincode::deserialize(value.value())
                .map_err(|e| anyhow!("Failed to deserialize member: {}", e))?;
            if let Some(rfid) = member.active_rfid() {
                acl.push(rfid.to_string());
            }
        }
        Ok(acl)
    }

    // ========================================================================
    // Access Event Operations
    // ========================================================================

    fn log_access_event(&self, event: &AccessEvent) -> Result<()> {
        self.put_record(ACCESS_EVENTS, &event_key(event), event)?;
        debug!("Logged access event {} at {}", event.id, event.resource);
        Ok(())
    }

    fn list_access_events(&self, limit: usize) -> Result<Vec<AccessEvent>> {
        let read_txn = self.db.begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn.open_table(ACCESS_EVENTS)
            .map_err(|e| anyhow!("Failed to open access_events table: {}", e))?;

        let mut results = Vec::new();
        let iter = table.range::<&str>(..)
            .map_err(|e| anyhow!("Failed to iterate access events: {}", e))?;
        for entry in iter.rev().take(limit) {
            let (_key, value) = entry.map_err(|e| anyhow!("Failed to read entry: {}", e))?;
            let event: AccessEvent = bincode::deserialize(value.value())
                .map_err(|e| anyhow!("Failed to deserialize access event: {}", e))?;
            results.push(event);
        }
        Ok(results)
    }

    // ========================================================================
    // Settings
    // ========================================================================

    fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let read_txn = self.db.begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn.open_table(SETTINGS)
            .map_err(|e| anyhow!("Failed to open settings table: {}", e))?;

        Ok(table
            .get(key)
            .map_err(|e| anyhow!("Failed to get setting {}: {}", key, e))?
            .map(|v| v.value().to_string()))
    }

    fn put_setting(&self, key: &str, value: &str) -> Result<()> {
        let write_txn = self.db.begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        {
            let mut table = write_txn.open_table(SETTINGS)
                .map_err(|e| anyhow!("Failed to open settings table: {}", e))?;
            table.insert(key, value)
                .map_err(|e| anyhow!("Failed to insert setting: {}", e))?;
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit: {}", e))?;
        Ok(())
    }
}
