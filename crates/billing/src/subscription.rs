//! Subscription record and state machine.
//!
//! The subscription row is the authoritative record. A plan change never
//! mutates it field by field: the state machine builds a complete
//! successor record from a validated [`ChangePreview`] and the store
//! swaps it in atomically under a version check.

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::proration::ChangePreview;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Paid up and usable
    Active,
    /// Voluntarily cancelled; access continues until `expires_at`
    Cancelled,
    /// Cycle ended without renewal
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> BillingResult<Self> {
        match s {
            "active" => Ok(SubscriptionStatus::Active),
            "cancelled" => Ok(SubscriptionStatus::Cancelled),
            "expired" => Ok(SubscriptionStatus::Expired),
            other => Err(BillingError::Database(format!(
                "unknown subscription status '{}'",
                other
            ))),
        }
    }
}

/// Authoritative subscription record.
///
/// Invariants: `started_at < expires_at`; exactly one current record per
/// subscriber (enforced by the store, which keys the table on
/// subscriber). `version` is the optimistic-lock counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub subscriber_id: Uuid,
    pub plan_id: Uuid,
    pub status: SubscriptionStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    pub version: i64,
}

impl Subscription {
    /// Create the record for a first purchase
    pub fn new(
        subscriber_id: Uuid,
        plan_id: Uuid,
        started_at: OffsetDateTime,
        expires_at: OffsetDateTime,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            subscriber_id,
            plan_id,
            status: SubscriptionStatus::Active,
            started_at,
            expires_at,
            version: 1,
        }
    }

    /// Build the successor record for a committed plan change.
    ///
    /// Upgrades restart the cycle (`started_at = now`, full cycle ahead,
    /// paid for via the prorated charge). Downgrades extend the existing
    /// cycle end by the granted credit days, so paid time is never lost.
    /// Equal-price changes carry the cycle end over unchanged.
    ///
    /// Only an ACTIVE subscription can change plan, and once the cycle
    /// has ended only an upgrade (which restarts it) is possible.
    pub fn superseded_by(
        &self,
        preview: &ChangePreview,
        now: OffsetDateTime,
    ) -> BillingResult<Subscription> {
        if self.status != SubscriptionStatus::Active {
            return Err(BillingError::InvalidStateTransition(format!(
                "cannot change plan of a {} subscription",
                self.status.as_str()
            )));
        }

        let expires_at = if preview.is_upgrade {
            now + Duration::days(i64::from(preview.total_days))
        } else if preview.is_downgrade {
            self.expires_at + Duration::days(i64::from(preview.credit_days_granted))
        } else {
            self.expires_at
        };

        // A row at or past its cycle end belongs to the expiry sweep.
        // Only an upgrade restarts the cycle; a downgrade or equal-price
        // change here would produce a record that starts at or after its
        // own expiry.
        if expires_at <= now {
            return Err(BillingError::InvalidStateTransition(
                "subscription cycle has already ended".to_string(),
            ));
        }

        Ok(Subscription {
            id: Uuid::new_v4(),
            subscriber_id: self.subscriber_id,
            plan_id: preview.target_plan_id,
            status: SubscriptionStatus::Active,
            started_at: now,
            expires_at,
            version: self.version + 1,
        })
    }

    /// Voluntary cancellation. No immediate effect on `expires_at`;
    /// access continues until natural expiry.
    pub fn cancel(&self) -> BillingResult<Subscription> {
        if self.status != SubscriptionStatus::Active {
            return Err(BillingError::InvalidStateTransition(format!(
                "cannot cancel a {} subscription",
                self.status.as_str()
            )));
        }

        let mut cancelled = self.clone();
        cancelled.status = SubscriptionStatus::Cancelled;
        cancelled.version += 1;
        Ok(cancelled)
    }

    /// Natural expiry, driven by the scheduled sweep once
    /// `now >= expires_at`.
    pub fn expire(&self, now: OffsetDateTime) -> BillingResult<Subscription> {
        if self.status == SubscriptionStatus::Expired {
            return Err(BillingError::InvalidStateTransition(
                "subscription is already expired".to_string(),
            ));
        }
        if now < self.expires_at {
            return Err(BillingError::InvalidStateTransition(
                "subscription has not reached its expiry yet".to_string(),
            ));
        }

        let mut expired = self.clone();
        expired.status = SubscriptionStatus::Expired;
        expired.version += 1;
        Ok(expired)
    }
}
