//! ============================================================================
//! MEMBERSERVER-CORE: Membership and Door Access Backend
//! ============================================================================
//! This crate handles all backend logic for the member server:
//! - Periodic task scheduling with non-overlapping ticks
//! - Membership tier evaluation against PayPal subscriptions
//! - Access list sync to door controllers over HTTP and the message bus
//! - Member/resource store on redb
//! ============================================================================

pub mod bus;
pub mod config;
pub mod db;
pub mod ipcheck;
pub mod membership;
pub mod notify;
pub mod payments;
pub mod resources;
pub mod retry;
pub mod scheduler;
pub mod server;
pub mod types;

#[cfg(test)]
mod testing;

// Re-export main types for convenience
pub use types::*;
pub use bus::{LocalBus, MessageBus, WsBus};
pub use config::Config;
pub use db::{MemberDb, Store};
pub use membership::{MembershipEvaluator, TierThresholds};
pub use resources::ResourceSyncManager;
pub use scheduler::{Task, TaskScheduler};
pub use server::MemberServer;
