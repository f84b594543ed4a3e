//! TutorLink Background Worker
//!
//! Handles scheduled jobs including:
//! - Subscription expiry sweep (every 5 minutes)
//! - Billing invariant checks (daily at 3:00 AM UTC)
//! - Health check heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use tutorlink_billing::{InvariantChecker, PgSubscriptionStore, SubscriptionStore};
use tutorlink_shared::create_pool;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting TutorLink Worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool(&database_url).await?;
    info!("Database pool created");

    let store = Arc::new(PgSubscriptionStore::new(pool.clone()));
    let invariants = Arc::new(InvariantChecker::new(pool.clone()));

    let scheduler = JobScheduler::new().await?;

    // Job 1: Expiry sweep (every 5 minutes)
    // Transitions ACTIVE/CANCELLED subscriptions whose cycle has ended
    let sweep_store = store.clone();
    scheduler
        .add(Job::new_async("0 */5 * * * *", move |_uuid, _l| {
            let store = sweep_store.clone();
            Box::pin(async move {
                match store.expire_due(OffsetDateTime::now_utc()).await {
                    Ok(0) => {}
                    Ok(count) => info!(expired = count, "Expiry sweep complete"),
                    Err(e) => error!(error = %e, "Expiry sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Subscription expiry sweep (every 5 minutes)");

    // Job 2: Billing invariant checks (daily at 3:00 AM UTC)
    let check_invariants = invariants.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let invariants = check_invariants.clone();
            Box::pin(async move {
                info!("Running billing invariant checks");
                match invariants.run_all_checks().await {
                    Ok(summary) if summary.healthy => {
                        info!(
                            checks_run = summary.checks_run,
                            "Billing invariant checks passed"
                        );
                    }
                    Ok(summary) => {
                        for violation in &summary.violations {
                            warn!(
                                invariant = %violation.invariant,
                                severity = %violation.severity,
                                subscribers = ?violation.subscriber_ids,
                                "{}",
                                violation.description
                            );
                        }
                        error!(
                            checks_failed = summary.checks_failed,
                            violations = summary.violations.len(),
                            "Billing invariant violations detected"
                        );
                    }
                    Err(e) => error!(error = %e, "Invariant check run failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Billing invariant checks (daily at 3:00 AM UTC)");

    // Job 3: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("30 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("TutorLink Worker started successfully with {} scheduled jobs", 3);

    // Keep the main task running
    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
