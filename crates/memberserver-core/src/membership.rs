//! ============================================================================
//! Membership Evaluator - Tier Reconciliation Against the Payment Provider
//! ============================================================================
//! Walks every member, asks the payment provider about their subscription and
//! maps (status, last payment) onto a tier:
//!
//!   ACTIVE + premium amount  -> Premium
//!   ACTIVE + classic amount  -> Classic
//!   ACTIVE + anything else   -> Standard
//!   CANCELLED / SUSPENDED    -> Inactive
//!   anything else            -> unchanged
//!
//! Credited members are never touched. Provider failures skip the member for
//! this pass rather than demoting them.
//! ============================================================================

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::db::Store;
use crate::notify::{Notification, NotificationKind, Notifier};
use crate::payments::{PaymentProvider, SubscriptionStatus};
use crate::retry::{retry_async, RetryConfig};
use crate::types::{Member, MemberTier, SubscriptionCreated};

/// Told whenever a member's access-relevant data changes
#[async_trait]
pub trait MembershipObserver: Send + Sync {
    async fn membership_changed(&self, member: &Member);
}

/// Whole-currency-unit payment amounts that identify the paid tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierThresholds {
    pub premium: i64,
    pub classic: i64,
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self {
            premium: 50,
            classic: 30,
        }
    }
}

/// Map provider state to a tier. `None` leaves the member unchanged.
pub fn tier_for(status: &SubscriptionStatus, amount: i64, thresholds: &TierThresholds) -> Option<MemberTier> {
    match status {
        SubscriptionStatus::Active if amount == thresholds.premium => Some(MemberTier::Premium),
        SubscriptionStatus::Active if amount == thresholds.classic => Some(MemberTier::Classic),
        SubscriptionStatus::Active => Some(MemberTier::Standard),
        SubscriptionStatus::Canceled | SubscriptionStatus::Suspended => Some(MemberTier::Inactive),
        SubscriptionStatus::Other(_) => None,
    }
}

/// Parse a decimal amount ("50.00") and truncate to whole units
pub fn parse_amount(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let value: f64 = raw.parse().ok()?;
    if !value.is_finite() {
        return None;
    }
    Some(value.trunc() as i64)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvaluationReport {
    pub checked: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub failed: usize,
    pub cancelled: bool,
}

enum Outcome {
    Skipped,
    Failed,
    Unchanged,
    Updated,
}

pub struct MembershipEvaluator {
    store: Arc<dyn Store>,
    payments: Option<Arc<dyn PaymentProvider>>,
    thresholds: TierThresholds,
    retry: RetryConfig,
    observers: Vec<Arc<dyn MembershipObserver>>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl MembershipEvaluator {
    pub fn new(
        store: Arc<dyn Store>,
        payments: Option<Arc<dyn PaymentProvider>>,
        thresholds: TierThresholds,
    ) -> Self {
        Self {
            store,
            payments,
            thresholds,
            retry: RetryConfig::default(),
            observers: Vec::new(),
            notifier: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn MembershipObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    async fn changed(&self, member: &Member) {
        for observer in &self.observers {
            observer.membership_changed(member).await;
        }
    }

    // ========================================================================
    // Tier Evaluation
    // ========================================================================

    /// Reconcile every member's tier with the payment provider
    pub async fn evaluate_all(&self, cancel: &CancellationToken) -> Result<EvaluationReport> {
        let Some(provider) = self.payments.as_ref() else {
            debug!("Payment provider not configured, skipping subscription check");
            return Ok(EvaluationReport::default());
        };

        let members = self.store.list_members()?;
        let mut report = EvaluationReport::default();

        for member in &members {
            if cancel.is_cancelled() {
                info!("Subscription check cancelled after {} members", report.checked);
                report.cancelled = true;
                break;
            }

            report.checked += 1;
            match self.evaluate_member(provider.as_ref(), member).await {
                Outcome::Skipped => report.skipped += 1,
                Outcome::Failed => report.failed += 1,
                Outcome::Unchanged => report.unchanged += 1,
                Outcome::Updated => report.updated += 1,
            }
        }

        info!(
            "Subscription check: {} checked, {} updated, {} skipped, {} failed",
            report.checked, report.updated, report.skipped, report.failed
        );
        Ok(report)
    }

    async fn evaluate_member(&self, provider: &dyn PaymentProvider, member: &Member) -> Outcome {
        if member.tier == MemberTier::Credited {
            return Outcome::Skipped;
        }

        let Some(subscription_id) = member.billing_subscription() else {
            info!("No subscription id for {}", member.name);
            return Outcome::Skipped;
        };

        let lookup = retry_async(&self.retry, &format!("subscription {}", subscription_id), || {
            provider.get_subscription(subscription_id)
        })
        .await;

        let snapshot = match lookup {
            Ok(s) => s,
            Err(e) => {
                warn!("Subscription lookup for {} failed: {}", member.email, e);
                return Outcome::Failed;
            }
        };

        let Some(amount) = parse_amount(&snapshot.last_payment_amount) else {
            warn!(
                "Unusable payment amount for {}: '{}'",
                member.email, snapshot.last_payment_amount
            );
            return Outcome::Failed;
        };

        let Some(tier) = tier_for(&snapshot.status, amount, &self.thresholds) else {
            debug!("{} subscription is {}, tier unchanged", member.email, snapshot.status);
            return Outcome::Unchanged;
        };

        match self.store.set_member_tier(&member.id, tier) {
            Ok(true) => {
                info!("{}: {} -> {}", member.email, member.tier, tier);
                let mut updated = member.clone();
                updated.tier = tier;
                self.changed(&updated).await;
                Outcome::Updated
            }
            Ok(false) => Outcome::Unchanged,
            Err(e) => {
                warn!("Failed to set tier for {}: {}", member.email, e);
                Outcome::Failed
            }
        }
    }

    // ========================================================================
    // Registration
    // ========================================================================

    fn grant_defaults(&self, member: &Member) -> Result<usize> {
        let mut granted = 0;
        for resource in self.store.list_resources()? {
            if resource.is_default {
                self.store.grant(&member.id, &resource.id)?;
                granted += 1;
            }
        }
        Ok(granted)
    }

    /// Manually add a member and grant the default resources
    pub async fn add_member(
        &self,
        name: &str,
        email: &str,
        tier: MemberTier,
        subscription_id: Option<String>,
    ) -> Result<Member> {
        let email = email.trim();
        if email.is_empty() {
            return Err(anyhow!("Member email is required"));
        }
        if self.store.get_member_by_email(email)?.is_some() {
            return Err(anyhow!("Member with email {} already exists", email));
        }

        let mut member = Member::new(name.trim(), email, tier);
        member.subscription_id = subscription_id;
        self.store.upsert_member(&member)?;
        let granted = self.grant_defaults(&member)?;

        info!("Added member {} ({}), {} default resources", member.email, member.tier, granted);
        self.changed(&member).await;
        Ok(member)
    }

    /// Handle a "subscription created" event from the payment provider.
    ///
    /// New members start at Standard so an RFID can be assigned before the
    /// first payment clears. Existing members get the subscription id, a name
    /// if they had none, and are lifted out of Inactive.
    pub async fn register_subscriber(&self, event: &SubscriptionCreated) -> Result<Member> {
        let email = event.email.trim();
        if email.is_empty() {
            return Err(anyhow!("Subscription {} has no email", event.subscription_id));
        }

        let member = match self.store.get_member_by_email(email)? {
            Some(mut existing) => {
                if existing.name.trim().is_empty() {
                    existing.name = event.name.trim().to_string();
                }
                existing.subscription_id = Some(event.subscription_id.clone());
                if existing.tier == MemberTier::Inactive {
                    existing.tier = MemberTier::Standard;
                }
                self.store.upsert_member(&existing)?;
                info!("Updated subscriber {} ({})", existing.email, event.subscription_id);
                existing
            }
            None => {
                let mut member = Member::new(event.name.trim(), email, MemberTier::Standard);
                member.subscription_id = Some(event.subscription_id.clone());
                self.store.upsert_member(&member)?;
                let granted = self.grant_defaults(&member)?;
                info!("Registered new member {}, {} default resources", member.email, granted);

                if let Some(notifier) = &self.notifier {
                    let note = Notification::new(
                        NotificationKind::NewMember,
                        "New Member",
                        format!("{} <{}> subscribed ({})", member.name, member.email, event.subscription_id),
                    );
                    if let Err(e) = notifier.notify(&note).await {
                        warn!("Failed to announce new member: {}", e);
                    }
                }
                member
            }
        };

        self.changed(&member).await;
        Ok(member)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{seed_member, temp_store, FakePayments, RecordingNotifier};
    use crate::types::Resource;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CountingObserver {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MembershipObserver for CountingObserver {
        async fn membership_changed(&self, member: &Member) {
            self.seen.lock().unwrap().push(member.email.clone());
        }
    }

    fn evaluator(store: Arc<dyn Store>, payments: Arc<FakePayments>) -> MembershipEvaluator {
        MembershipEvaluator::new(store, Some(payments as Arc<dyn PaymentProvider>), TierThresholds::default())
            .with_retry(RetryConfig::none())
    }

    fn subscriber(store: &dyn Store, email: &str, tier: MemberTier, sub: &str) -> Member {
        let mut m = seed_member(store, email, email, "", tier);
        m.subscription_id = Some(sub.to_string());
        store.upsert_member(&m).unwrap();
        m
    }

    #[test]
    fn test_tier_table() {
        let t = TierThresholds::default();
        let active = SubscriptionStatus::Active;
        assert_eq!(tier_for(&active, 50, &t), Some(MemberTier::Premium));
        assert_eq!(tier_for(&active, 30, &t), Some(MemberTier::Classic));
        assert_eq!(tier_for(&active, 20, &t), Some(MemberTier::Standard));
        assert_eq!(tier_for(&SubscriptionStatus::Canceled, 50, &t), Some(MemberTier::Inactive));
        assert_eq!(tier_for(&SubscriptionStatus::Suspended, 30, &t), Some(MemberTier::Inactive));
        assert_eq!(tier_for(&SubscriptionStatus::Other("EXPIRED".into()), 50, &t), None);
    }

    #[test]
    fn test_parse_amount_truncates() {
        assert_eq!(parse_amount("50.00"), Some(50));
        assert_eq!(parse_amount("30.99"), Some(30));
        assert_eq!(parse_amount(" 25 "), Some(25));
        assert_eq!(parse_amount(""), None);
        assert_eq!(parse_amount("abc"), None);
        assert_eq!(parse_amount("NaN"), None);
    }

    #[tokio::test]
    async fn test_premium_payment_promotes_standard() {
        let (_dir, store) = temp_store();
        let payments = Arc::new(FakePayments::default());
        let ada = subscriber(store.as_ref(), "ada@example.org", MemberTier::Standard, "I-ADA");
        payments.set("I-ADA", SubscriptionStatus::Active, "50.00");

        let report = evaluator(store.clone(), payments)
            .evaluate_all(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.updated, 1);
        assert_eq!(store.get_member(&ada.id).unwrap().unwrap().tier, MemberTier::Premium);
    }

    #[tokio::test]
    async fn test_credited_is_never_touched() {
        let (_dir, store) = temp_store();
        let payments = Arc::new(FakePayments::default());
        let cyd = subscriber(store.as_ref(), "cyd@example.org", MemberTier::Credited, "I-CYD");
        payments.set("I-CYD", SubscriptionStatus::Canceled, "50.00");

        let report = evaluator(store.clone(), payments.clone())
            .evaluate_all(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.skipped, 1);
        assert_eq!(payments.calls(), 0);
        assert_eq!(store.get_member(&cyd.id).unwrap().unwrap().tier, MemberTier::Credited);
    }

    #[tokio::test]
    async fn test_canceled_and_suspended_deactivate() {
        let (_dir, store) = temp_store();
        let payments = Arc::new(FakePayments::default());
        let a = subscriber(store.as_ref(), "a@example.org", MemberTier::Premium, "I-A");
        let b = subscriber(store.as_ref(), "b@example.org", MemberTier::Classic, "I-B");
        payments.set("I-A", SubscriptionStatus::Canceled, "50.00");
        payments.set("I-B", SubscriptionStatus::Suspended, "30.00");

        let observer = Arc::new(CountingObserver::default());
        let report = evaluator(store.clone(), payments)
            .with_observer(observer.clone())
            .evaluate_all(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.updated, 2);
        assert_eq!(store.get_member(&a.id).unwrap().unwrap().tier, MemberTier::Inactive);
        assert_eq!(store.get_member(&b.id).unwrap().unwrap().tier, MemberTier::Inactive);
        assert_eq!(observer.seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_evaluation_is_idempotent() {
        let (_dir, store) = temp_store();
        let payments = Arc::new(FakePayments::default());
        let ada = subscriber(store.as_ref(), "ada@example.org", MemberTier::Standard, "I-ADA");
        payments.set("I-ADA", SubscriptionStatus::Active, "30.00");

        let eval = evaluator(store.clone(), payments);
        let first = eval.evaluate_all(&CancellationToken::new()).await.unwrap();
        let second = eval.evaluate_all(&CancellationToken::new()).await.unwrap();

        assert_eq!(first.updated, 1);
        assert_eq!(second.updated, 0);
        assert_eq!(second.unchanged, 1);
        assert_eq!(store.get_member(&ada.id).unwrap().unwrap().tier, MemberTier::Classic);
    }

    #[tokio::test]
    async fn test_provider_failures_skip_member() {
        let (_dir, store) = temp_store();
        let payments = Arc::new(FakePayments::default());
        let a = subscriber(store.as_ref(), "a@example.org", MemberTier::Premium, "I-A");
        let b = subscriber(store.as_ref(), "b@example.org", MemberTier::Premium, "I-B");
        payments.fail("I-A");
        payments.set("I-B", SubscriptionStatus::Active, "");

        let report = evaluator(store.clone(), payments)
            .evaluate_all(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.failed, 2);
        assert_eq!(store.get_member(&a.id).unwrap().unwrap().tier, MemberTier::Premium);
        assert_eq!(store.get_member(&b.id).unwrap().unwrap().tier, MemberTier::Premium);
    }

    #[tokio::test]
    async fn test_missing_subscription_is_skipped() {
        let (_dir, store) = temp_store();
        let payments = Arc::new(FakePayments::default());
        subscriber(store.as_ref(), "a@example.org", MemberTier::Standard, "none");
        seed_member(store.as_ref(), "b", "b@example.org", "", MemberTier::Standard);

        let report = evaluator(store.clone(), payments.clone())
            .evaluate_all(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.skipped, 2);
        assert_eq!(payments.calls(), 0);
    }

    #[tokio::test]
    async fn test_no_provider_is_noop() {
        let (_dir, store) = temp_store();
        subscriber(store.as_ref(), "a@example.org", MemberTier::Standard, "I-A");
        let eval = MembershipEvaluator::new(store, None, TierThresholds::default());
        let report = eval.evaluate_all(&CancellationToken::new()).await.unwrap();
        assert_eq!(report, EvaluationReport::default());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let (_dir, store) = temp_store();
        let payments = Arc::new(FakePayments::default());
        subscriber(store.as_ref(), "a@example.org", MemberTier::Standard, "I-A");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = evaluator(store, payments.clone()).evaluate_all(&cancel).await.unwrap();
        assert!(report.cancelled);
        assert_eq!(report.checked, 0);
        assert_eq!(payments.calls(), 0);
    }

    #[tokio::test]
    async fn test_register_new_subscriber_grants_defaults() {
        let (_dir, store) = temp_store();
        let mut door = Resource::new("front-door", "http://10.0.0.20");
        door.is_default = true;
        store.upsert_resource(&door).unwrap();
        store.upsert_resource(&Resource::new("laser", "http://10.0.0.30")).unwrap();

        let notifier = Arc::new(RecordingNotifier::default());
        let eval = MembershipEvaluator::new(store.clone(), None, TierThresholds::default())
            .with_notifier(notifier.clone());

        let member = eval
            .register_subscriber(&SubscriptionCreated {
                subscription_id: "I-NEW".into(),
                name: "Ada".into(),
                email: "ada@example.org".into(),
            })
            .await
            .unwrap();

        assert_eq!(member.tier, MemberTier::Standard);
        assert_eq!(member.subscription_id.as_deref(), Some("I-NEW"));
        assert_eq!(store.member_resources(&member.id).unwrap(), vec![door.id.clone()]);
        assert_eq!(notifier.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_register_existing_fills_name() {
        let (_dir, store) = temp_store();
        let existing = seed_member(store.as_ref(), "", "ada@example.org", "f3ec6234", MemberTier::Inactive);
        let eval = MembershipEvaluator::new(store.clone(), None, TierThresholds::default());

        let member = eval
            .register_subscriber(&SubscriptionCreated {
                subscription_id: "I-ADA".into(),
                name: "Ada".into(),
                email: "ada@example.org".into(),
            })
            .await
            .unwrap();

        assert_eq!(member.id, existing.id);
        assert_eq!(member.name, "Ada");
        assert_eq!(member.tier, MemberTier::Standard);
        assert_eq!(store.list_members().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_add_member_rejects_duplicate_email() {
        let (_dir, store) = temp_store();
        let eval = MembershipEvaluator::new(store, None, TierThresholds::default());
        eval.add_member("Ada", "ada@example.org", MemberTier::Standard, None)
            .await
            .unwrap();
        assert!(eval
            .add_member("Ada", "ada@example.org", MemberTier::Premium, None)
            .await
            .is_err());
    }
}
