//! Application state

use std::sync::Arc;

use sqlx::PgPool;
use tutorlink_billing::BillingService;

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub billing: Arc<BillingService>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> anyhow::Result<Self> {
        let billing = BillingService::new(
            pool.clone(),
            config.gateway_config(),
            config.currency.clone(),
        )?;
        tracing::info!(currency = %config.currency, "Billing service initialized");

        Ok(Self {
            pool,
            config,
            billing: Arc::new(billing),
        })
    }
}
