// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Plan-Change Engine
//!
//! Tests critical boundary conditions and race conditions in:
//! - Commit idempotency (CHG-I01 to CHG-I05)
//! - Payment failure handling (CHG-P01 to CHG-P03)
//! - Orchestrator validation (CHG-V01 to CHG-V04)
//! - Lifecycle transitions (CHG-L01 to CHG-L04)

use std::sync::Arc;

use async_trait::async_trait;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::catalog::{Plan, StaticPlanCatalog};
use crate::change::ChangeOrchestrator;
use crate::clock::test::FixedClock;
use crate::clock::Clock;
use crate::error::{BillingError, BillingResult};
use crate::payment::test::MockGateway;
use crate::store::test::InMemoryStore;
use crate::store::{LedgerClaim, SubscriptionStore};
use crate::subscription::{Subscription, SubscriptionStatus};
use crate::CommitOutcome;

fn t0() -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap()
}

struct Harness {
    store: Arc<InMemoryStore>,
    gateway: Arc<MockGateway>,
    clock: Arc<FixedClock>,
    orchestrator: Arc<ChangeOrchestrator>,
    subscriber: Uuid,
    free: Plan,
    family: Plan,
    premium: Plan,
    retired: Plan,
}

/// Subscriber on the Family plan (999 cents), 30-day cycle, clock at
/// day 10 (20 days remaining).
async fn harness() -> Harness {
    let free = Plan::free();
    let family = Plan::family(999);
    let premium = Plan::premium(1999);
    let mut retired = Plan::premium(2999);
    retired.is_active = false;

    let store = Arc::new(InMemoryStore::new());
    let gateway = Arc::new(MockGateway::new());
    let clock = Arc::new(FixedClock::at(t0() + Duration::days(10)));
    let catalog = Arc::new(StaticPlanCatalog::new(vec![
        free.clone(),
        family.clone(),
        premium.clone(),
        retired.clone(),
    ]));

    let subscriber = Uuid::new_v4();
    store
        .insert(&Subscription::new(
            subscriber,
            family.id,
            t0(),
            t0() + Duration::days(30),
        ))
        .await
        .unwrap();

    let orchestrator = Arc::new(ChangeOrchestrator::new(
        store.clone(),
        catalog,
        gateway.clone(),
        clock.clone(),
        "EUR".to_string(),
    ));

    Harness {
        store,
        gateway,
        clock,
        orchestrator,
        subscriber,
        free,
        family,
        premium,
        retired,
    }
}

mod idempotency_tests {
    use super::*;

    // =========================================================================
    // CHG-I01: Same key twice sequentially - one charge, same outcome
    // =========================================================================
    #[tokio::test]
    async fn replay_returns_committed_outcome_without_charging() {
        let h = harness().await;

        let first = h
            .orchestrator
            .execute_change(h.subscriber, h.premium.id, "key-1", "pm_123")
            .await
            .unwrap();

        let second = h
            .orchestrator
            .execute_change(h.subscriber, h.premium.id, "key-1", "pm_123")
            .await
            .unwrap();

        assert_eq!(first, second, "replay must return the committed outcome");
        assert_eq!(h.gateway.charge_count(), 1, "gateway charged at most once");
    }

    // =========================================================================
    // CHG-I02: Concurrent double-tap on the same key - at most one charge
    // =========================================================================
    #[tokio::test]
    async fn concurrent_double_tap_charges_at_most_once() {
        use tokio::sync::Barrier;

        let h = harness().await;
        let barrier = Arc::new(Barrier::new(2));
        let mut handles = vec![];

        for _ in 0..2 {
            let orchestrator = h.orchestrator.clone();
            let barrier = barrier.clone();
            let subscriber = h.subscriber;
            let target = h.premium.id;

            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                orchestrator
                    .execute_change(subscriber, target, "tap-tap", "pm_123")
                    .await
            }));
        }

        let mut outcomes: Vec<BillingResult<CommitOutcome>> = vec![];
        for handle in handles {
            outcomes.push(handle.await.unwrap());
        }

        let committed: Vec<_> = outcomes.iter().filter(|o| o.is_ok()).collect();
        assert!(!committed.is_empty(), "at least one tap must commit");
        assert_eq!(h.gateway.charge_count(), 1, "double tap must not double charge");

        // A loser that lost the claim race reports a retryable-after-refetch error
        for outcome in &outcomes {
            if let Err(e) = outcome {
                assert!(matches!(e, BillingError::ConcurrentModification));
            }
        }
    }

    // =========================================================================
    // CHG-I03: Second change with a fresh key sees the committed state
    // =========================================================================
    #[tokio::test]
    async fn fresh_key_after_commit_sees_new_plan() {
        let h = harness().await;

        h.orchestrator
            .execute_change(h.subscriber, h.premium.id, "key-1", "pm_123")
            .await
            .unwrap();

        // Same target again under a new key is now a no-op change
        let result = h
            .orchestrator
            .execute_change(h.subscriber, h.premium.id, "key-2", "pm_123")
            .await;

        assert!(matches!(result, Err(BillingError::NoOpChange(_))));
        assert_eq!(h.gateway.charge_count(), 1);
    }

    // =========================================================================
    // CHG-I04: A key is scoped to its (subscriber, target plan) pair
    // =========================================================================
    #[tokio::test]
    async fn key_reuse_for_a_different_change_is_rejected() {
        let h = harness().await;

        h.orchestrator
            .execute_change(h.subscriber, h.premium.id, "key-1", "pm_123")
            .await
            .unwrap();

        // Same key, different target plan: not a replay, not a new commit
        let result = h
            .orchestrator
            .execute_change(h.subscriber, h.free.id, "key-1", "pm_123")
            .await;
        assert!(matches!(result, Err(BillingError::InvalidStateTransition(_))));

        // Same key, different subscriber
        let stranger = Uuid::new_v4();
        let result = h
            .orchestrator
            .execute_change(stranger, h.premium.id, "key-1", "pm_123")
            .await;
        assert!(matches!(result, Err(BillingError::InvalidStateTransition(_))));

        assert_eq!(h.gateway.charge_count(), 1, "only the original change charged");

        // Subscription state untouched by the rejected reuses
        let current = h.store.current(h.subscriber).unwrap();
        assert_eq!(current.plan_id, h.premium.id);
    }

    // =========================================================================
    // CHG-I05: Claim is atomic - direct ledger checks
    // =========================================================================
    #[tokio::test]
    async fn ledger_claim_transitions() {
        let h = harness().await;
        let target = h.premium.id;

        assert!(matches!(
            h.store.claim_change("k", h.subscriber, target).await.unwrap(),
            LedgerClaim::Claimed
        ));
        assert!(matches!(
            h.store.claim_change("k", h.subscriber, target).await.unwrap(),
            LedgerClaim::InFlight
        ));

        h.store.release_change("k").await.unwrap();
        assert!(matches!(
            h.store.claim_change("k", h.subscriber, target).await.unwrap(),
            LedgerClaim::Claimed
        ));
    }
}

mod payment_failure_tests {
    use super::*;

    // =========================================================================
    // CHG-P01: Gateway failure leaves no state change, same key retries
    // =========================================================================
    #[tokio::test]
    async fn payment_failure_is_retryable_with_same_key() {
        let h = harness().await;
        h.gateway.fail_next(1);

        let failed = h
            .orchestrator
            .execute_change(h.subscriber, h.premium.id, "key-1", "pm_123")
            .await;
        assert!(matches!(failed, Err(BillingError::PaymentFailed(_))));

        // No state change: still on the original plan and version
        let current = h.store.current(h.subscriber).unwrap();
        assert_eq!(current.plan_id, h.family.id);
        assert_eq!(current.version, 1);

        // Retry with the same key succeeds
        let outcome = h
            .orchestrator
            .execute_change(h.subscriber, h.premium.id, "key-1", "pm_123")
            .await
            .unwrap();
        assert_eq!(outcome.new_subscription.plan_id, h.premium.id);
        assert_eq!(h.gateway.charge_count(), 2);
    }

    // =========================================================================
    // CHG-P02: Upgrade with no payment method fails before the gateway
    // =========================================================================
    #[tokio::test]
    async fn missing_payment_method_never_reaches_gateway() {
        let h = harness().await;

        let result = h
            .orchestrator
            .execute_change(h.subscriber, h.premium.id, "key-1", "")
            .await;

        assert!(matches!(result, Err(BillingError::PaymentFailed(_))));
        assert_eq!(h.gateway.charge_count(), 0);
    }

    // =========================================================================
    // CHG-P03: Payment captured but commit lost - surfaced, reconcilable
    // =========================================================================

    /// Store whose next supersede fails, simulating a lost commit race
    /// after the charge was captured.
    struct FailingCommitStore {
        inner: Arc<InMemoryStore>,
        fail_supersedes: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl SubscriptionStore for FailingCommitStore {
        async fn find_active(&self, subscriber_id: Uuid) -> BillingResult<Option<Subscription>> {
            self.inner.find_active(subscriber_id).await
        }

        async fn insert(&self, subscription: &Subscription) -> BillingResult<()> {
            self.inner.insert(subscription).await
        }

        async fn supersede_active(
            &self,
            old: &Subscription,
            new: &Subscription,
        ) -> BillingResult<()> {
            use std::sync::atomic::Ordering;
            let remaining = self.fail_supersedes.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_supersedes.store(remaining - 1, Ordering::SeqCst);
                return Err(BillingError::ConcurrentModification);
            }
            self.inner.supersede_active(old, new).await
        }

        async fn set_status(
            &self,
            subscriber_id: Uuid,
            expected_version: i64,
            status: SubscriptionStatus,
        ) -> BillingResult<()> {
            self.inner
                .set_status(subscriber_id, expected_version, status)
                .await
        }

        async fn expire_due(&self, now: OffsetDateTime) -> BillingResult<u64> {
            self.inner.expire_due(now).await
        }

        async fn claim_change(
            &self,
            idempotency_key: &str,
            subscriber_id: Uuid,
            target_plan_id: Uuid,
        ) -> BillingResult<LedgerClaim> {
            self.inner
                .claim_change(idempotency_key, subscriber_id, target_plan_id)
                .await
        }

        async fn complete_change(
            &self,
            idempotency_key: &str,
            outcome: &CommitOutcome,
        ) -> BillingResult<()> {
            self.inner.complete_change(idempotency_key, outcome).await
        }

        async fn release_change(&self, idempotency_key: &str) -> BillingResult<()> {
            self.inner.release_change(idempotency_key).await
        }

        async fn record_transaction(
            &self,
            idempotency_key: &str,
            transaction_id: &str,
        ) -> BillingResult<()> {
            self.inner
                .record_transaction(idempotency_key, transaction_id)
                .await
        }
    }

    #[tokio::test]
    async fn captured_payment_without_commit_is_retained_for_reconciliation() {
        let family = Plan::family(999);
        let premium = Plan::premium(1999);

        let inner = Arc::new(InMemoryStore::new());
        let subscriber = Uuid::new_v4();
        inner
            .insert(&Subscription::new(
                subscriber,
                family.id,
                t0(),
                t0() + Duration::days(30),
            ))
            .await
            .unwrap();

        let store = Arc::new(FailingCommitStore {
            inner: inner.clone(),
            fail_supersedes: std::sync::atomic::AtomicUsize::new(1),
        });
        let gateway = Arc::new(MockGateway::new());
        let orchestrator = ChangeOrchestrator::new(
            store,
            Arc::new(StaticPlanCatalog::new(vec![family.clone(), premium.clone()])),
            gateway.clone(),
            Arc::new(FixedClock::at(t0() + Duration::days(10))),
            "EUR".to_string(),
        );

        let result = orchestrator
            .execute_change(subscriber, premium.id, "key-1", "pm_123")
            .await;

        // Money moved, commit did not: the error is surfaced, never hidden
        assert!(matches!(result, Err(BillingError::ConcurrentModification)));
        assert_eq!(gateway.charge_count(), 1);

        // The ledger entry keeps the transaction id for reconciliation
        // and the key stays claimed (not silently retryable)
        assert_eq!(
            inner.ledger_transaction_id("key-1").as_deref(),
            Some("txn_1")
        );
        let replay = orchestrator
            .execute_change(subscriber, premium.id, "key-1", "pm_123")
            .await;
        assert!(matches!(replay, Err(BillingError::ConcurrentModification)));
        assert_eq!(gateway.charge_count(), 1, "reconciliation path must not re-charge");
    }
}

mod validation_tests {
    use super::*;

    // =========================================================================
    // CHG-V01: Same plan as target - rejected without contacting gateway
    // =========================================================================
    #[tokio::test]
    async fn noop_change_never_contacts_gateway() {
        let h = harness().await;

        let result = h
            .orchestrator
            .execute_change(h.subscriber, h.family.id, "key-1", "pm_123")
            .await;

        assert!(matches!(result, Err(BillingError::NoOpChange(_))));
        assert_eq!(h.gateway.charge_count(), 0);

        let preview = h.orchestrator.preview_change(h.subscriber, h.family.id).await;
        assert!(matches!(preview, Err(BillingError::NoOpChange(_))));
    }

    // =========================================================================
    // CHG-V02: No active subscription
    // =========================================================================
    #[tokio::test]
    async fn missing_subscription_is_rejected() {
        let h = harness().await;
        let stranger = Uuid::new_v4();

        let result = h
            .orchestrator
            .execute_change(stranger, h.premium.id, "key-1", "pm_123")
            .await;

        assert!(matches!(result, Err(BillingError::NoActiveSubscription(_))));

        // The failed attempt must not poison the key for a later valid one
        let preview = h.orchestrator.preview_change(stranger, h.premium.id).await;
        assert!(matches!(preview, Err(BillingError::NoActiveSubscription(_))));
    }

    // =========================================================================
    // CHG-V03: Retired plan cannot be a target
    // =========================================================================
    #[tokio::test]
    async fn retired_plan_is_not_a_valid_target() {
        let h = harness().await;

        let result = h
            .orchestrator
            .execute_change(h.subscriber, h.retired.id, "key-1", "pm_123")
            .await;

        assert!(matches!(result, Err(BillingError::PlanNotFound(_))));
        assert_eq!(h.gateway.charge_count(), 0);
    }

    // =========================================================================
    // CHG-V04: Commit recomputes the preview it charges
    // =========================================================================
    #[tokio::test]
    async fn commit_preview_matches_read_only_preview() {
        let h = harness().await;

        let preview = h
            .orchestrator
            .preview_change(h.subscriber, h.premium.id)
            .await
            .unwrap();

        let outcome = h
            .orchestrator
            .execute_change(h.subscriber, h.premium.id, "key-1", "pm_123")
            .await
            .unwrap();

        assert_eq!(outcome.preview, preview);
        assert_eq!(outcome.amount_charged_cents, preview.amount_due_cents);

        let charged = h.gateway.requests();
        assert_eq!(charged.len(), 1);
        assert_eq!(charged[0].amount_cents, preview.amount_due_cents);
        assert_eq!(charged[0].currency, "EUR");
    }
}

mod lifecycle_tests {
    use super::*;

    // =========================================================================
    // CHG-L01: Downgrade commits without payment and extends expiry
    // =========================================================================
    #[tokio::test]
    async fn downgrade_needs_no_payment_and_extends_expiry() {
        let h = harness().await;

        // First move up to premium so there is somewhere to come down from
        h.orchestrator
            .execute_change(h.subscriber, h.premium.id, "up", "pm_123")
            .await
            .unwrap();
        let premium_sub = h.store.current(h.subscriber).unwrap();

        h.clock.set(h.clock.now() + Duration::days(5));
        let outcome = h
            .orchestrator
            .execute_change(h.subscriber, h.family.id, "down", "")
            .await
            .unwrap();

        assert!(outcome.preview.is_downgrade);
        assert_eq!(outcome.amount_charged_cents, 0);
        assert!(outcome.transaction_id.is_none());
        assert!(
            outcome.new_subscription.expires_at
                >= premium_sub.expires_at,
            "downgrade must never lose paid time"
        );
        assert_eq!(h.gateway.charge_count(), 1, "only the upgrade charged");
    }

    // =========================================================================
    // CHG-L02: Cancel keeps access until expiry, blocks further changes
    // =========================================================================
    #[tokio::test]
    async fn cancelled_subscription_cannot_change_plan() {
        let h = harness().await;

        let cancelled = h.orchestrator.cancel(h.subscriber).await.unwrap();
        assert_eq!(cancelled.status, SubscriptionStatus::Cancelled);
        assert_eq!(cancelled.expires_at, t0() + Duration::days(30));

        let result = h
            .orchestrator
            .execute_change(h.subscriber, h.premium.id, "key-1", "pm_123")
            .await;
        assert!(matches!(result, Err(BillingError::NoActiveSubscription(_))));

        let again = h.orchestrator.cancel(h.subscriber).await;
        assert!(matches!(again, Err(BillingError::NoActiveSubscription(_))));
    }

    // =========================================================================
    // CHG-L03: At cycle end only an upgrade can commit
    // =========================================================================
    #[tokio::test]
    async fn change_at_cycle_end_is_rejected_not_committed() {
        let h = harness().await;
        h.clock.set(t0() + Duration::days(30));

        // Downgrade of a row the sweep has not expired yet: no credit is
        // left, and a successor would start at its own expiry
        let result = h
            .orchestrator
            .execute_change(h.subscriber, h.free.id, "late-down", "")
            .await;
        assert!(matches!(result, Err(BillingError::InvalidStateTransition(_))));
        assert_eq!(h.gateway.charge_count(), 0);

        let current = h.store.current(h.subscriber).unwrap();
        assert_eq!(current.plan_id, h.family.id);
        assert_eq!(current.version, 1);
        assert!(current.started_at < current.expires_at);

        // An upgrade still works: full price, cycle restarted
        let outcome = h
            .orchestrator
            .execute_change(h.subscriber, h.premium.id, "late-up", "pm_123")
            .await
            .unwrap();
        assert_eq!(outcome.amount_charged_cents, h.premium.price_cents);
        assert_eq!(outcome.new_subscription.started_at, h.clock.now());
        assert!(outcome.new_subscription.started_at < outcome.new_subscription.expires_at);
    }

    // =========================================================================
    // CHG-L04: Expiry sweep transitions due subscriptions
    // =========================================================================
    #[tokio::test]
    async fn expiry_sweep_transitions_due_rows() {
        let h = harness().await;

        // Nothing due mid-cycle
        assert_eq!(h.store.expire_due(h.clock.now()).await.unwrap(), 0);

        let expired = h
            .store
            .expire_due(t0() + Duration::days(30))
            .await
            .unwrap();
        assert_eq!(expired, 1);
        assert_eq!(
            h.store.current(h.subscriber).unwrap().status,
            SubscriptionStatus::Expired
        );

        // Sweep is idempotent
        assert_eq!(
            h.store.expire_due(t0() + Duration::days(31)).await.unwrap(),
            0
        );
    }
}
