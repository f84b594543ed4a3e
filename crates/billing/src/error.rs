//! Billing error taxonomy.
//!
//! All error paths originate in the orchestrator or the state machine;
//! the proration calculator itself is a total function and never fails
//! for valid plan/subscription pairs.

use uuid::Uuid;

/// Result alias used throughout the billing crate
pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    /// Subscriber has no ACTIVE subscription to change
    #[error("subscriber {0} has no active subscription")]
    NoActiveSubscription(Uuid),

    /// Target plan equals the current plan
    #[error("target plan {0} is already the current plan")]
    NoOpChange(Uuid),

    /// Plan id is unknown or the plan is no longer offered
    #[error("plan {0} not found")]
    PlanNotFound(Uuid),

    /// Payment collaborator declined, errored or timed out.
    /// Safe to retry with the same idempotency key.
    #[error("payment failed: {0}")]
    PaymentFailed(String),

    /// Transition attempted from a state that does not allow it.
    /// Indicates a bug or a stale client; never retried silently.
    #[error("invalid state transition: {0}")]
    InvalidStateTransition(String),

    /// Another change committed first; the client must re-preview
    #[error("subscription was modified concurrently")]
    ConcurrentModification,

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl BillingError {
    /// Whether the client may safely retry the same request
    /// (with the same idempotency key where one was supplied).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BillingError::PaymentFailed(_) | BillingError::Database(_)
        )
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(e: serde_json::Error) -> Self {
        BillingError::Serialization(e.to_string())
    }
}
