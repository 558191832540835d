//! ============================================================================
//! Database Types - Aggregates reported by the member store
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Record counts for the `stats` command
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DbStats {
    pub total_members: usize,
    /// Tier name -> member count
    pub members_by_tier: BTreeMap<String, usize>,
    pub total_resources: usize,
    pub total_grants: usize,
    pub total_access_events: usize,
}
