//! Clubhouse billing worker
//!
//! Runs the ledger's background jobs:
//! - Stale pending snapshot sweep
//! - Abandoned intent sweep
//! - Long-pending intent sweep
//! - Guest-pass hold cleanup
//! - Ledger invariant check
//!
//! All three reconciliation sweeps also run once after a startup delay.

use std::sync::Arc;

use anyhow::Context;
use clubhouse_billing::health::record_job_outcome;
use clubhouse_billing::{
    BillingLedger, BillingResult, LedgerConfig, LedgerInvariantChecker, PgJobHealthRecorder,
    SweepSummary, JOB_INVARIANT_CHECK,
};
use clubhouse_shared::{create_pool, run_migrations, TierCatalog};
use sqlx::PgPool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

fn log_sweep_failure(job: &str, result: &BillingResult<SweepSummary>) {
    if let Err(e) = result {
        error!(job = %job, error = %e, "Reconciliation sweep failed");
    }
}

async fn load_catalog(pool: &PgPool) -> TierCatalog {
    match TierCatalog::load(pool).await {
        Ok(catalog) if !catalog.is_empty() => {
            info!(tiers = catalog.len(), "Loaded membership tiers");
            catalog
        }
        Ok(_) => {
            warn!("membership_tiers is empty, using the standard catalog");
            TierCatalog::standard()
        }
        Err(e) => {
            warn!(error = %e, "Failed to load membership tiers, using the standard catalog");
            TierCatalog::standard()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    dotenvy::dotenv().ok();

    info!("Starting Clubhouse billing worker");

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = create_pool(&database_url).await?;
    run_migrations(&pool).await?;

    let config = LedgerConfig::from_env();
    let catalog = load_catalog(&pool).await;
    let ledger = Arc::new(
        BillingLedger::from_config(pool.clone(), catalog, &config)
            .context("Failed to create billing ledger")?,
    );
    let checker = Arc::new(LedgerInvariantChecker::new(pool.clone()));
    let health = Arc::new(PgJobHealthRecorder::new(pool.clone()));

    let settings = config.reconciliation.clone();
    let mut scheduler = JobScheduler::new().await?;

    // Job 1: First reconciliation pass after the startup delay
    let initial_ledger = ledger.clone();
    scheduler
        .add(Job::new_one_shot_async(settings.initial_delay, move |_uuid, _l| {
            let ledger = initial_ledger.clone();
            Box::pin(async move {
                info!("Running initial reconciliation pass");
                for result in ledger.reconcile.run_all().await {
                    if let Err(e) = result {
                        error!(error = %e, "Initial reconciliation sweep failed");
                    }
                }
            })
        })?)
        .await?;
    info!(delay_secs = settings.initial_delay.as_secs(), "Scheduled: Initial reconciliation pass");

    // Job 2: Stale pending snapshots
    let stale_ledger = ledger.clone();
    scheduler
        .add(Job::new_repeated_async(settings.interval, move |_uuid, _l| {
            let ledger = stale_ledger.clone();
            Box::pin(async move {
                let result = ledger.reconcile.reconcile_stale_pending_snapshots().await;
                log_sweep_failure(clubhouse_billing::JOB_STALE_PENDING, &result);
            })
        })?)
        .await?;

    // Job 3: Abandoned intents
    let abandoned_ledger = ledger.clone();
    scheduler
        .add(Job::new_repeated_async(settings.interval, move |_uuid, _l| {
            let ledger = abandoned_ledger.clone();
            Box::pin(async move {
                let result = ledger.reconcile.reconcile_abandoned_intents().await;
                log_sweep_failure(clubhouse_billing::JOB_ABANDONED_INTENTS, &result);
            })
        })?)
        .await?;

    // Job 4: Long-pending intents
    let long_pending_ledger = ledger.clone();
    scheduler
        .add(Job::new_repeated_async(settings.interval, move |_uuid, _l| {
            let ledger = long_pending_ledger.clone();
            Box::pin(async move {
                let result = ledger.reconcile.reconcile_long_pending_intents().await;
                log_sweep_failure(clubhouse_billing::JOB_LONG_PENDING, &result);
            })
        })?)
        .await?;
    info!(
        interval_secs = settings.interval.as_secs(),
        batch_size = settings.batch_size,
        "Scheduled: Reconciliation sweeps"
    );

    // Job 5: Expired guest-pass holds
    let holds_ledger = ledger.clone();
    scheduler
        .add(Job::new_repeated_async(config.hold_cleanup_interval, move |_uuid, _l| {
            let ledger = holds_ledger.clone();
            Box::pin(async move {
                if let Err(e) = ledger.reconcile.cleanup_expired_holds().await {
                    error!(error = %e, "Guest pass hold cleanup failed");
                }
            })
        })?)
        .await?;
    info!(
        interval_secs = config.hold_cleanup_interval.as_secs(),
        "Scheduled: Guest pass hold cleanup"
    );

    // Job 6: Ledger invariants
    scheduler
        .add(Job::new_repeated_async(config.invariant_check_interval, move |_uuid, _l| {
            let checker = checker.clone();
            let health = health.clone();
            Box::pin(async move {
                let result = checker.run_all_checks().await;
                if let Ok(summary) = &result {
                    for violation in &summary.violations {
                        warn!(
                            invariant = %violation.invariant,
                            severity = %violation.severity,
                            "{}",
                            violation.description
                        );
                    }
                }
                if let Err(e) = &result {
                    error!(error = %e, "Invariant check failed");
                }
                record_job_outcome(health.as_ref(), JOB_INVARIANT_CHECK, &result).await;
            })
        })?)
        .await?;
    info!(
        interval_secs = config.invariant_check_interval.as_secs(),
        "Scheduled: Ledger invariant check"
    );

    info!("Starting job scheduler");
    scheduler.start().await?;
    info!("Clubhouse billing worker started with 6 scheduled jobs");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping scheduler");
    scheduler.shutdown().await?;

    Ok(())
}
