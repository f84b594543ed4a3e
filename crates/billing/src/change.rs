//! Change orchestrator.
//!
//! The single authoritative path for plan changes. All commits go
//! through [`ChangeOrchestrator::execute_change`], which recomputes the
//! preview server-side (a client-supplied monetary figure is never
//! trusted), charges through the payment collaborator when money is due,
//! and applies the state transition under the store's version check.
//!
//! `now` is captured once per request and reused for every step, so the
//! preview a commit recomputes cannot drift from the transition it
//! applies.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::catalog::{Plan, PlanCatalog};
use crate::clock::Clock;
use crate::error::{BillingError, BillingResult};
use crate::payment::{ChargeRequest, PaymentGateway};
use crate::proration::{compute_preview, ChangePreview};
use crate::store::{LedgerClaim, SubscriptionStore};
use crate::subscription::Subscription;

/// Result of a committed plan change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitOutcome {
    pub new_subscription: Subscription,
    pub preview: ChangePreview,
    /// Gateway transaction id when a charge was captured
    pub transaction_id: Option<String>,
    pub amount_charged_cents: i64,
}

pub struct ChangeOrchestrator {
    store: Arc<dyn SubscriptionStore>,
    catalog: Arc<dyn PlanCatalog>,
    gateway: Arc<dyn PaymentGateway>,
    clock: Arc<dyn Clock>,
    currency: String,
}

impl ChangeOrchestrator {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        catalog: Arc<dyn PlanCatalog>,
        gateway: Arc<dyn PaymentGateway>,
        clock: Arc<dyn Clock>,
        currency: String,
    ) -> Self {
        Self {
            store,
            catalog,
            gateway,
            clock,
            currency,
        }
    }

    /// Current ACTIVE subscription for a subscriber
    pub async fn current_subscription(
        &self,
        subscriber_id: Uuid,
    ) -> BillingResult<Option<Subscription>> {
        self.store.find_active(subscriber_id).await
    }

    /// Read-only preview of switching to `target_plan_id`. Safe to call
    /// repeatedly; no side effects, no idempotency key required.
    pub async fn preview_change(
        &self,
        subscriber_id: Uuid,
        target_plan_id: Uuid,
    ) -> BillingResult<ChangePreview> {
        let subscription = self
            .store
            .find_active(subscriber_id)
            .await?
            .ok_or(BillingError::NoActiveSubscription(subscriber_id))?;

        let (current_plan, target_plan) =
            self.load_plans(&subscription, target_plan_id).await?;

        Ok(compute_preview(
            &subscription,
            &current_plan,
            &target_plan,
            self.clock.now(),
        ))
    }

    /// Commit a plan change.
    ///
    /// Idempotent under `idempotency_key`: the first successful
    /// execution stores its [`CommitOutcome`] in the ledger and every
    /// replay with the same key returns that outcome without contacting
    /// the payment collaborator again. A payment failure releases the
    /// key so the same request can be retried.
    pub async fn execute_change(
        &self,
        subscriber_id: Uuid,
        target_plan_id: Uuid,
        idempotency_key: &str,
        payment_method_ref: &str,
    ) -> BillingResult<CommitOutcome> {
        match self
            .store
            .claim_change(idempotency_key, subscriber_id, target_plan_id)
            .await?
        {
            LedgerClaim::Claimed => {}
            LedgerClaim::AlreadyCommitted(outcome) => {
                tracing::info!(
                    subscriber_id = %subscriber_id,
                    idempotency_key = %idempotency_key,
                    "Replayed idempotency key, returning committed outcome"
                );
                return Ok(*outcome);
            }
            LedgerClaim::InFlight => {
                tracing::warn!(
                    subscriber_id = %subscriber_id,
                    idempotency_key = %idempotency_key,
                    "Idempotency key is already being processed"
                );
                return Err(BillingError::ConcurrentModification);
            }
        }

        // Captured once; reused for the preview and the transition
        let now = self.clock.now();

        let subscription = match self.store.find_active(subscriber_id).await {
            Ok(Some(sub)) => sub,
            Ok(None) => {
                return Err(self
                    .fail_released(
                        idempotency_key,
                        BillingError::NoActiveSubscription(subscriber_id),
                    )
                    .await);
            }
            Err(e) => return Err(self.fail_released(idempotency_key, e).await),
        };

        let (current_plan, target_plan) =
            match self.load_plans(&subscription, target_plan_id).await {
                Ok(plans) => plans,
                Err(e) => return Err(self.fail_released(idempotency_key, e).await),
            };

        let preview = compute_preview(&subscription, &current_plan, &target_plan, now);

        tracing::info!(
            subscriber_id = %subscriber_id,
            current_plan = %preview.current_plan_name,
            target_plan = %preview.target_plan_name,
            amount_due_cents = preview.amount_due_cents,
            credit_cents = preview.credit_cents,
            days_remaining = preview.days_remaining,
            "Recomputed change preview server-side"
        );

        let mut transaction_id = None;
        if preview.amount_due_cents > 0 {
            if payment_method_ref.is_empty() {
                return Err(self
                    .fail_released(
                        idempotency_key,
                        BillingError::PaymentFailed("no payment method supplied".to_string()),
                    )
                    .await);
            }

            let request = ChargeRequest {
                amount_cents: preview.amount_due_cents,
                currency: self.currency.clone(),
                payment_method_ref: payment_method_ref.to_string(),
                idempotency_key: idempotency_key.to_string(),
            };

            let receipt = match self.gateway.charge(&request).await {
                Ok(receipt) => receipt,
                Err(e) => {
                    tracing::warn!(
                        subscriber_id = %subscriber_id,
                        amount_cents = preview.amount_due_cents,
                        error = %e,
                        "Payment failed, ledger entry released for retry"
                    );
                    return Err(self.fail_released(idempotency_key, e).await);
                }
            };

            // Record the capture before touching subscription state, so a
            // crash or lost race leaves a reconcilable trail.
            if let Err(e) = self
                .store
                .record_transaction(idempotency_key, &receipt.transaction_id)
                .await
            {
                tracing::error!(
                    idempotency_key = %idempotency_key,
                    transaction_id = %receipt.transaction_id,
                    error = %e,
                    "Failed to record gateway transaction on ledger entry"
                );
            }
            transaction_id = Some(receipt.transaction_id);
        }

        let new_subscription = match subscription.superseded_by(&preview, now) {
            Ok(sub) => sub,
            Err(e) => {
                tracing::error!(subscriber_id = %subscriber_id, error = %e, "State transition rejected");
                return Err(self.settle_failed_commit(idempotency_key, &transaction_id, e).await);
            }
        };

        if let Err(e) = self
            .store
            .supersede_active(&subscription, &new_subscription)
            .await
        {
            return Err(self.settle_failed_commit(idempotency_key, &transaction_id, e).await);
        }

        let outcome = CommitOutcome {
            amount_charged_cents: if transaction_id.is_some() {
                preview.amount_due_cents
            } else {
                0
            },
            new_subscription,
            preview,
            transaction_id,
        };

        // The committed outcome is what replays return; retry the write
        // once before giving up.
        if let Err(e) = self.store.complete_change(idempotency_key, &outcome).await {
            tracing::warn!(
                idempotency_key = %idempotency_key,
                error = %e,
                "First attempt to commit ledger outcome failed, retrying"
            );
            if let Err(retry_err) = self.store.complete_change(idempotency_key, &outcome).await {
                tracing::error!(
                    idempotency_key = %idempotency_key,
                    error = %retry_err,
                    "Failed to commit ledger outcome; replays of this key will stall"
                );
            }
        }

        tracing::info!(
            subscriber_id = %subscriber_id,
            new_plan = %outcome.preview.target_plan_name,
            amount_charged_cents = outcome.amount_charged_cents,
            transaction_id = ?outcome.transaction_id,
            "Plan change committed"
        );

        Ok(outcome)
    }

    /// Cancel the subscriber's ACTIVE subscription. Access continues
    /// until natural expiry.
    pub async fn cancel(&self, subscriber_id: Uuid) -> BillingResult<Subscription> {
        let subscription = self
            .store
            .find_active(subscriber_id)
            .await?
            .ok_or(BillingError::NoActiveSubscription(subscriber_id))?;

        let cancelled = subscription.cancel()?;
        self.store
            .set_status(subscriber_id, subscription.version, cancelled.status)
            .await?;

        tracing::info!(
            subscriber_id = %subscriber_id,
            expires_at = %cancelled.expires_at,
            "Subscription cancelled, access continues until expiry"
        );

        Ok(cancelled)
    }

    async fn load_plans(
        &self,
        subscription: &Subscription,
        target_plan_id: Uuid,
    ) -> BillingResult<(Plan, Plan)> {
        if subscription.plan_id == target_plan_id {
            return Err(BillingError::NoOpChange(target_plan_id));
        }

        let current_plan = self.catalog.get_plan(subscription.plan_id).await?;
        let target_plan = self.catalog.get_plan(target_plan_id).await?;

        // A retired plan can still be the current one, but not a target
        if !target_plan.is_active {
            return Err(BillingError::PlanNotFound(target_plan_id));
        }

        Ok((current_plan, target_plan))
    }

    /// Release the claim and hand the error back. Used before any money
    /// has moved.
    async fn fail_released(&self, idempotency_key: &str, err: BillingError) -> BillingError {
        if let Err(release_err) = self.store.release_change(idempotency_key).await {
            tracing::error!(
                idempotency_key = %idempotency_key,
                error = %release_err,
                "Failed to release ledger claim"
            );
        }
        err
    }

    /// A commit failed after the preview. If a payment was captured the
    /// ledger entry is kept in `processing` with its transaction id so
    /// reconciliation can find it; otherwise the claim is released so
    /// the key can be retried.
    async fn settle_failed_commit(
        &self,
        idempotency_key: &str,
        transaction_id: &Option<String>,
        err: BillingError,
    ) -> BillingError {
        match transaction_id {
            Some(txn) => {
                tracing::error!(
                    idempotency_key = %idempotency_key,
                    transaction_id = %txn,
                    error = %err,
                    "Payment captured but commit failed; ledger entry retained for reconciliation"
                );
                err
            }
            None => self.fail_released(idempotency_key, err).await,
        }
    }
}
