// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError carries context strings
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! TutorLink Billing Module
//!
//! The subscription plan-change proration engine.
//!
//! ## Features
//!
//! - **Proration Calculator**: pure, integer-only preview of what a
//!   mid-cycle plan switch credits and charges
//! - **Subscription State Machine**: builds successor records for plan
//!   changes, cancellation and expiry
//! - **Change Orchestrator**: preview → charge → commit, idempotent
//!   under a client-supplied key and safe under concurrent taps
//! - **Plan Catalog**: static plan definitions with a capability set
//! - **Invariants**: runnable consistency checks over the billing tables
//!
//! Preview and commit share one calculator, one injected clock and one
//! rounding rule, so the amount a subscriber confirms is the amount that
//! gets charged.

pub mod catalog;
pub mod change;
pub mod clock;
pub mod error;
pub mod invariants;
pub mod payment;
pub mod proration;
pub mod store;
pub mod subscription;

#[cfg(test)]
mod edge_case_tests;

// Catalog
pub use catalog::{PgPlanCatalog, Plan, PlanCatalog, PlanFeatures, StaticPlanCatalog};

// Change orchestration
pub use change::{ChangeOrchestrator, CommitOutcome};

// Clock
pub use clock::{Clock, SystemClock};

// Error
pub use error::{BillingError, BillingResult};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Payment
pub use payment::{
    ChargeReceipt, ChargeRequest, GatewayConfig, HttpPaymentGateway, PaymentGateway,
};

// Proration
pub use proration::{compute_preview, diff_features, ChangePreview, MAX_CREDIT_DAYS};

// Store
pub use store::{LedgerClaim, PgSubscriptionStore, SubscriptionStore};

// Subscription
pub use subscription::{Subscription, SubscriptionStatus};

// Test exports
#[cfg(any(test, feature = "test-store"))]
pub use clock::test::FixedClock;

#[cfg(any(test, feature = "test-store"))]
pub use payment::test::MockGateway;

#[cfg(any(test, feature = "test-store"))]
pub use store::test::InMemoryStore;

use std::sync::Arc;

use sqlx::PgPool;

/// Main billing service wiring the orchestrator to its collaborators
pub struct BillingService {
    pub catalog: Arc<dyn PlanCatalog>,
    pub changes: ChangeOrchestrator,
    pub invariants: InvariantChecker,
}

impl BillingService {
    /// Production wiring: Postgres store and catalog, HTTP payment
    /// gateway, wall-clock time.
    pub fn new(
        pool: PgPool,
        gateway_config: GatewayConfig,
        currency: String,
    ) -> BillingResult<Self> {
        let catalog: Arc<dyn PlanCatalog> = Arc::new(PgPlanCatalog::new(pool.clone()));
        let store: Arc<dyn SubscriptionStore> = Arc::new(PgSubscriptionStore::new(pool.clone()));
        let gateway: Arc<dyn PaymentGateway> = Arc::new(HttpPaymentGateway::new(gateway_config)?);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        Ok(Self {
            catalog: catalog.clone(),
            changes: ChangeOrchestrator::new(store, catalog, gateway, clock, currency),
            invariants: InvariantChecker::new(pool),
        })
    }
}
