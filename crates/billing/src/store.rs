//! Subscription storage and the idempotency ledger.
//!
//! The store serializes all changes to one subscriber's subscription:
//! the table keys on subscriber, and every mutation is conditioned on
//! the record's `version` (compare-and-swap), so two concurrent plan
//! changes cannot both commit against the same snapshot.
//!
//! The ledger backs the commit idempotency guarantee. A change first
//! atomically claims its idempotency key; replays of a committed key get
//! the stored outcome back, and a key whose payment failed can be
//! re-claimed by a retry.

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::change::CommitOutcome;
use crate::error::{BillingError, BillingResult};
use crate::subscription::{Subscription, SubscriptionStatus};

/// Result of claiming an idempotency key
#[derive(Debug)]
pub enum LedgerClaim {
    /// Exclusive processing rights acquired
    Claimed,
    /// The key already committed; return the stored outcome to the caller
    AlreadyCommitted(Box<CommitOutcome>),
    /// Another request holds the key right now
    InFlight,
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Current ACTIVE subscription for a subscriber, if any
    async fn find_active(&self, subscriber_id: Uuid) -> BillingResult<Option<Subscription>>;

    /// Record a first purchase
    async fn insert(&self, subscription: &Subscription) -> BillingResult<()>;

    /// Replace the current record with its successor, conditioned on the
    /// old record's id and version. A lost race surfaces as
    /// [`BillingError::ConcurrentModification`].
    async fn supersede_active(
        &self,
        old: &Subscription,
        new: &Subscription,
    ) -> BillingResult<()>;

    /// Version-conditioned status update (cancel, expire)
    async fn set_status(
        &self,
        subscriber_id: Uuid,
        expected_version: i64,
        status: SubscriptionStatus,
    ) -> BillingResult<()>;

    /// Expire every active or cancelled subscription whose cycle has
    /// ended. Returns the number of rows transitioned.
    async fn expire_due(&self, now: OffsetDateTime) -> BillingResult<u64>;

    /// Atomically claim an idempotency key for processing.
    ///
    /// A key is scoped to its (subscriber, target plan) pair: reusing a
    /// known key for a different change is rejected rather than replayed.
    async fn claim_change(
        &self,
        idempotency_key: &str,
        subscriber_id: Uuid,
        target_plan_id: Uuid,
    ) -> BillingResult<LedgerClaim>;

    /// Mark a claimed key committed and store its outcome for replays
    async fn complete_change(
        &self,
        idempotency_key: &str,
        outcome: &CommitOutcome,
    ) -> BillingResult<()>;

    /// Mark a claimed key failed so a retry with the same key can
    /// re-claim it. Only valid while the key is in `processing`.
    async fn release_change(&self, idempotency_key: &str) -> BillingResult<()>;

    /// Attach a gateway transaction id to a still-processing entry.
    /// Used when money was captured but the commit did not land, so
    /// reconciliation has something to work with.
    async fn record_transaction(
        &self,
        idempotency_key: &str,
        transaction_id: &str,
    ) -> BillingResult<()>;
}

/// Postgres-backed store
pub struct PgSubscriptionStore {
    pool: PgPool,
}

type SubscriptionRow = (Uuid, Uuid, Uuid, String, OffsetDateTime, OffsetDateTime, i64);

impl PgSubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_subscription(
        (id, subscriber_id, plan_id, status, started_at, expires_at, version): SubscriptionRow,
    ) -> BillingResult<Subscription> {
        Ok(Subscription {
            id,
            subscriber_id,
            plan_id,
            status: SubscriptionStatus::parse(&status)?,
            started_at,
            expires_at,
            version,
        })
    }
}

#[async_trait]
impl SubscriptionStore for PgSubscriptionStore {
    async fn find_active(&self, subscriber_id: Uuid) -> BillingResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(
            "SELECT id, subscriber_id, plan_id, status, started_at, expires_at, version
             FROM subscriptions
             WHERE subscriber_id = $1 AND status = 'active'",
        )
        .bind(subscriber_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_subscription).transpose()
    }

    async fn insert(&self, subscription: &Subscription) -> BillingResult<()> {
        sqlx::query(
            "INSERT INTO subscriptions
                 (subscriber_id, id, plan_id, status, started_at, expires_at, version)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(subscription.subscriber_id)
        .bind(subscription.id)
        .bind(subscription.plan_id)
        .bind(subscription.status.as_str())
        .bind(subscription.started_at)
        .bind(subscription.expires_at)
        .bind(subscription.version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn supersede_active(
        &self,
        old: &Subscription,
        new: &Subscription,
    ) -> BillingResult<()> {
        let result = sqlx::query(
            "UPDATE subscriptions
             SET id = $1, plan_id = $2, status = $3, started_at = $4, expires_at = $5,
                 version = $6, updated_at = NOW()
             WHERE subscriber_id = $7 AND id = $8 AND version = $9 AND status = 'active'",
        )
        .bind(new.id)
        .bind(new.plan_id)
        .bind(new.status.as_str())
        .bind(new.started_at)
        .bind(new.expires_at)
        .bind(new.version)
        .bind(old.subscriber_id)
        .bind(old.id)
        .bind(old.version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::ConcurrentModification);
        }
        Ok(())
    }

    async fn set_status(
        &self,
        subscriber_id: Uuid,
        expected_version: i64,
        status: SubscriptionStatus,
    ) -> BillingResult<()> {
        let result = sqlx::query(
            "UPDATE subscriptions
             SET status = $1, version = version + 1, updated_at = NOW()
             WHERE subscriber_id = $2 AND version = $3",
        )
        .bind(status.as_str())
        .bind(subscriber_id)
        .bind(expected_version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::ConcurrentModification);
        }
        Ok(())
    }

    async fn expire_due(&self, now: OffsetDateTime) -> BillingResult<u64> {
        let result = sqlx::query(
            "UPDATE subscriptions
             SET status = 'expired', version = version + 1, updated_at = NOW()
             WHERE status IN ('active', 'cancelled') AND expires_at <= $1",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn claim_change(
        &self,
        idempotency_key: &str,
        subscriber_id: Uuid,
        target_plan_id: Uuid,
    ) -> BillingResult<LedgerClaim> {
        // INSERT..ON CONFLICT..RETURNING claims exclusive processing
        // rights in one round trip; a failed entry may be re-claimed by
        // a retry, a committed or in-flight one may not.
        let claimed: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO plan_change_ledger
                (idempotency_key, subscriber_id, target_plan_id, status, created_at, updated_at)
            VALUES ($1, $2, $3, 'processing', NOW(), NOW())
            ON CONFLICT (idempotency_key) DO UPDATE SET
                status = 'processing',
                updated_at = NOW()
            WHERE plan_change_ledger.status = 'failed'
              AND plan_change_ledger.subscriber_id = EXCLUDED.subscriber_id
              AND plan_change_ledger.target_plan_id = EXCLUDED.target_plan_id
            RETURNING idempotency_key
            "#,
        )
        .bind(idempotency_key)
        .bind(subscriber_id)
        .bind(target_plan_id)
        .fetch_optional(&self.pool)
        .await?;

        if claimed.is_some() {
            return Ok(LedgerClaim::Claimed);
        }

        let existing: Option<(String, Option<serde_json::Value>, Uuid, Uuid)> = sqlx::query_as(
            "SELECT status, outcome, subscriber_id, target_plan_id
             FROM plan_change_ledger
             WHERE idempotency_key = $1",
        )
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await?;

        match existing {
            Some((_, _, owner, target))
                if owner != subscriber_id || target != target_plan_id =>
            {
                Err(BillingError::InvalidStateTransition(
                    "idempotency key was already used for a different change".to_string(),
                ))
            }
            Some((status, Some(outcome), _, _)) if status == "committed" => {
                let outcome: CommitOutcome = serde_json::from_value(outcome)?;
                Ok(LedgerClaim::AlreadyCommitted(Box::new(outcome)))
            }
            Some((status, None, _, _)) if status == "committed" => Err(BillingError::Database(
                "committed ledger entry has no outcome".to_string(),
            )),
            _ => Ok(LedgerClaim::InFlight),
        }
    }

    async fn complete_change(
        &self,
        idempotency_key: &str,
        outcome: &CommitOutcome,
    ) -> BillingResult<()> {
        let outcome_json = serde_json::to_value(outcome)?;
        sqlx::query(
            "UPDATE plan_change_ledger
             SET status = 'committed', outcome = $1, transaction_id = $2, updated_at = NOW()
             WHERE idempotency_key = $3",
        )
        .bind(outcome_json)
        .bind(outcome.transaction_id.as_deref())
        .bind(idempotency_key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn release_change(&self, idempotency_key: &str) -> BillingResult<()> {
        sqlx::query(
            "UPDATE plan_change_ledger
             SET status = 'failed', updated_at = NOW()
             WHERE idempotency_key = $1 AND status = 'processing'",
        )
        .bind(idempotency_key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_transaction(
        &self,
        idempotency_key: &str,
        transaction_id: &str,
    ) -> BillingResult<()> {
        sqlx::query(
            "UPDATE plan_change_ledger
             SET transaction_id = $1, updated_at = NOW()
             WHERE idempotency_key = $2",
        )
        .bind(transaction_id)
        .bind(idempotency_key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(any(test, feature = "test-store"))]
pub mod test {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum LedgerStatus {
        Processing,
        Committed,
        Failed,
    }

    #[derive(Debug, Clone)]
    struct LedgerEntry {
        status: LedgerStatus,
        subscriber_id: Uuid,
        target_plan_id: Uuid,
        outcome: Option<CommitOutcome>,
        transaction_id: Option<String>,
    }

    #[derive(Default)]
    struct Inner {
        // Keyed by subscriber: one current record each
        subscriptions: HashMap<Uuid, Subscription>,
        ledger: HashMap<String, LedgerEntry>,
    }

    /// In-memory store with the same CAS and claim semantics as the
    /// Postgres implementation. Test-only.
    #[derive(Default)]
    pub struct InMemoryStore {
        inner: Mutex<Inner>,
    }

    #[allow(clippy::unwrap_used)]
    impl InMemoryStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Current record regardless of status (test inspection)
        pub fn current(&self, subscriber_id: Uuid) -> Option<Subscription> {
            self.inner
                .lock()
                .unwrap()
                .subscriptions
                .get(&subscriber_id)
                .cloned()
        }

        /// Ledger transaction id for a key (test inspection)
        pub fn ledger_transaction_id(&self, idempotency_key: &str) -> Option<String> {
            self.inner
                .lock()
                .unwrap()
                .ledger
                .get(idempotency_key)
                .and_then(|e| e.transaction_id.clone())
        }
    }

    #[async_trait]
    #[allow(clippy::unwrap_used)]
    impl SubscriptionStore for InMemoryStore {
        async fn find_active(&self, subscriber_id: Uuid) -> BillingResult<Option<Subscription>> {
            let inner = self.inner.lock().unwrap();
            Ok(inner
                .subscriptions
                .get(&subscriber_id)
                .filter(|s| s.status == SubscriptionStatus::Active)
                .cloned())
        }

        async fn insert(&self, subscription: &Subscription) -> BillingResult<()> {
            let mut inner = self.inner.lock().unwrap();
            if inner
                .subscriptions
                .contains_key(&subscription.subscriber_id)
            {
                return Err(BillingError::Database(
                    "subscriber already has a subscription".to_string(),
                ));
            }
            inner
                .subscriptions
                .insert(subscription.subscriber_id, subscription.clone());
            Ok(())
        }

        async fn supersede_active(
            &self,
            old: &Subscription,
            new: &Subscription,
        ) -> BillingResult<()> {
            let mut inner = self.inner.lock().unwrap();
            match inner.subscriptions.get(&old.subscriber_id) {
                Some(current)
                    if current.id == old.id
                        && current.version == old.version
                        && current.status == SubscriptionStatus::Active =>
                {
                    inner.subscriptions.insert(new.subscriber_id, new.clone());
                    Ok(())
                }
                _ => Err(BillingError::ConcurrentModification),
            }
        }

        async fn set_status(
            &self,
            subscriber_id: Uuid,
            expected_version: i64,
            status: SubscriptionStatus,
        ) -> BillingResult<()> {
            let mut inner = self.inner.lock().unwrap();
            match inner.subscriptions.get_mut(&subscriber_id) {
                Some(current) if current.version == expected_version => {
                    current.status = status;
                    current.version += 1;
                    Ok(())
                }
                _ => Err(BillingError::ConcurrentModification),
            }
        }

        async fn expire_due(&self, now: OffsetDateTime) -> BillingResult<u64> {
            let mut inner = self.inner.lock().unwrap();
            let mut expired = 0;
            for sub in inner.subscriptions.values_mut() {
                if sub.status != SubscriptionStatus::Expired && sub.expires_at <= now {
                    sub.status = SubscriptionStatus::Expired;
                    sub.version += 1;
                    expired += 1;
                }
            }
            Ok(expired)
        }

        async fn claim_change(
            &self,
            idempotency_key: &str,
            subscriber_id: Uuid,
            target_plan_id: Uuid,
        ) -> BillingResult<LedgerClaim> {
            let mut inner = self.inner.lock().unwrap();
            match inner.ledger.get_mut(idempotency_key) {
                None => {
                    inner.ledger.insert(
                        idempotency_key.to_string(),
                        LedgerEntry {
                            status: LedgerStatus::Processing,
                            subscriber_id,
                            target_plan_id,
                            outcome: None,
                            transaction_id: None,
                        },
                    );
                    Ok(LedgerClaim::Claimed)
                }
                Some(entry)
                    if entry.subscriber_id != subscriber_id
                        || entry.target_plan_id != target_plan_id =>
                {
                    Err(BillingError::InvalidStateTransition(
                        "idempotency key was already used for a different change".to_string(),
                    ))
                }
                Some(entry) => match entry.status {
                    LedgerStatus::Failed => {
                        entry.status = LedgerStatus::Processing;
                        Ok(LedgerClaim::Claimed)
                    }
                    LedgerStatus::Committed => {
                        let outcome = entry.outcome.clone().ok_or_else(|| {
                            BillingError::Database(
                                "committed ledger entry has no outcome".to_string(),
                            )
                        })?;
                        Ok(LedgerClaim::AlreadyCommitted(Box::new(outcome)))
                    }
                    LedgerStatus::Processing => Ok(LedgerClaim::InFlight),
                },
            }
        }

        async fn complete_change(
            &self,
            idempotency_key: &str,
            outcome: &CommitOutcome,
        ) -> BillingResult<()> {
            let mut inner = self.inner.lock().unwrap();
            if let Some(entry) = inner.ledger.get_mut(idempotency_key) {
                entry.status = LedgerStatus::Committed;
                entry.outcome = Some(outcome.clone());
                entry.transaction_id = outcome.transaction_id.clone();
            }
            Ok(())
        }

        async fn release_change(&self, idempotency_key: &str) -> BillingResult<()> {
            let mut inner = self.inner.lock().unwrap();
            if let Some(entry) = inner.ledger.get_mut(idempotency_key) {
                if entry.status == LedgerStatus::Processing {
                    entry.status = LedgerStatus::Failed;
                }
            }
            Ok(())
        }

        async fn record_transaction(
            &self,
            idempotency_key: &str,
            transaction_id: &str,
        ) -> BillingResult<()> {
            let mut inner = self.inner.lock().unwrap();
            if let Some(entry) = inner.ledger.get_mut(idempotency_key) {
                entry.transaction_id = Some(transaction_id.to_string());
            }
            Ok(())
        }
    }
}
