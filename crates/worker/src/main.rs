#![cfg_attr(test, allow(clippy::unwrap_used))]

//! School SaaS Background Worker
//!
//! Handles scheduled jobs including:
//! - Stored status sync so reporting sees derived grace/read-only/expired states (hourly)
//! - Expiry reminders for subscriptions approaching their end date (daily at 06:00 UTC)
//! - Billing invariant checks (daily at 03:00 UTC)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use schoolsaas_billing::{BillingConfig, BillingService, ExpiryReminder};
use schoolsaas_shared::{create_pool, DbConfig};
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

const DEFAULT_REMINDER_DAYS: [u32; 4] = [30, 14, 7, 1];

/// Parse `EXPIRY_REMINDER_DAYS` ("30,14,7,1"). Invalid entries are skipped;
/// an empty result falls back to the defaults.
fn parse_reminder_days(raw: Option<&str>) -> Vec<u32> {
    let mut days: Vec<u32> = raw
        .unwrap_or_default()
        .split(',')
        .filter_map(|part| {
            let part = part.trim();
            if part.is_empty() {
                return None;
            }
            match part.parse::<u32>() {
                Ok(d) => Some(d),
                Err(_) => {
                    warn!(value = part, "Ignoring invalid EXPIRY_REMINDER_DAYS entry");
                    None
                }
            }
        })
        .collect();

    if days.is_empty() {
        days = DEFAULT_REMINDER_DAYS.to_vec();
    }
    days.sort_unstable_by(|a, b| b.cmp(a));
    days.dedup();
    days
}

/// Log one reminder line per subscription
fn log_reminders(days_ahead: u32, reminders: &[ExpiryReminder]) {
    for reminder in reminders {
        info!(
            org_id = %reminder.organization_id,
            subscription_id = %reminder.subscription_id,
            plan_id = %reminder.plan_id,
            status = %reminder.status,
            expires_at = %reminder.expires_at,
            days_ahead = days_ahead,
            "Subscription expiring soon"
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting School SaaS Worker");

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = create_pool(&DbConfig::new(database_url).with_max_connections(5)).await?;

    // Cache TTL is irrelevant here; the worker never serves entitlement reads
    let billing = Arc::new(BillingService::new(
        pool,
        BillingConfig {
            entitlement_cache_ttl: Duration::ZERO,
            ..BillingConfig::default()
        },
    ));

    let reminder_days = parse_reminder_days(std::env::var("EXPIRY_REMINDER_DAYS").ok().as_deref());

    let scheduler = JobScheduler::new().await?;

    // Job 1: Sync stored statuses with the derived ones (top of every hour)
    let subscriptions = billing.subscriptions.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let service = subscriptions.clone();
            Box::pin(async move {
                match service.sync_stored_statuses(OffsetDateTime::now_utc()).await {
                    Ok(0) => {}
                    Ok(updated) => info!(updated = updated, "Synced subscription statuses"),
                    Err(e) => error!(error = %e, "Failed to sync subscription statuses"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Subscription status sync (hourly)");

    // Job 2: Expiry reminders (06:00 UTC)
    let subscriptions = billing.subscriptions.clone();
    let days = reminder_days.clone();
    scheduler
        .add(Job::new_async("0 0 6 * * *", move |_uuid, _l| {
            let service = subscriptions.clone();
            let days = days.clone();
            Box::pin(async move {
                let now = OffsetDateTime::now_utc();
                for days_ahead in days {
                    match service.expiring_in(days_ahead, now).await {
                        Ok(reminders) => log_reminders(days_ahead, &reminders),
                        Err(e) => error!(
                            error = %e,
                            days_ahead = days_ahead,
                            "Failed to load expiring subscriptions"
                        ),
                    }
                }
            })
        })?)
        .await?;
    info!(days = ?reminder_days, "Scheduled: Expiry reminders (06:00 UTC)");

    // Job 3: Invariant checks (03:00 UTC)
    let invariants = billing.invariants.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let checker = invariants.clone();
            Box::pin(async move {
                info!("Running billing invariant checks");
                if let Err(e) = checker.run_all_checks().await {
                    error!(error = %e, "Invariant checks failed to run");
                }
            })
        })?)
        .await?;
    info!("Scheduled: Billing invariant checks (03:00 UTC)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("School SaaS Worker started successfully with 3 scheduled jobs");

    // The scheduler runs jobs in background tasks
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping worker");
    Ok(())
}
