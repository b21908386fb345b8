//! Wedmatch Background Worker
//!
//! Handles scheduled jobs:
//! - Referral commission outbox delivery (every minute)
//! - Stripe webhook event log cleanup (daily at 3:30 AM UTC)
//! - Heartbeat (every 5 minutes)

mod commission_processor;

use std::time::Duration;

use anyhow::Context;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use wedmatch_billing::{CommissionConfig, CommissionDispatcher};
use wedmatch_shared::create_pool;

const DEFAULT_RETENTION_DAYS: i32 = 30;

fn retention_days() -> i32 {
    std::env::var("WEBHOOK_EVENT_RETENTION_DAYS")
        .ok()
        .and_then(|v| v.parse::<i32>().ok())
        .filter(|days| *days > 0)
        .unwrap_or(DEFAULT_RETENTION_DAYS)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Wedmatch Worker");

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = create_pool(&database_url, 5).await?;
    info!("Database pool created");

    let scheduler = JobScheduler::new().await?;
    let mut job_count = 0;

    // Job 1: Deliver referral commissions (every minute)
    match CommissionConfig::from_env() {
        Some(config) => {
            let dispatcher = CommissionDispatcher::new(config)?;
            let commission_pool = pool.clone();
            scheduler
                .add(Job::new_async("0 * * * * *", move |_uuid, _l| {
                    let pool = commission_pool.clone();
                    let dispatcher = dispatcher.clone();
                    Box::pin(async move {
                        commission_processor::process_commission_outbox(&pool, &dispatcher).await;
                    })
                })?)
                .await?;
            job_count += 1;
            info!("Scheduled: Commission outbox delivery (every minute)");
        }
        None => {
            warn!("AFFILIATE_COMMISSION_URL not set - commission events stay queued");
        }
    }

    // Job 2: Prune processed webhook events (daily at 3:30 AM UTC)
    let retention = retention_days();
    let cleanup_pool = pool.clone();
    scheduler
        .add(Job::new_async("0 30 3 * * *", move |_uuid, _l| {
            let pool = cleanup_pool.clone();
            Box::pin(async move {
                info!(retention_days = retention, "Running webhook event cleanup");
                commission_processor::cleanup_processed_events(&pool, retention).await;
            })
        })?)
        .await?;
    job_count += 1;
    info!(retention_days = retention, "Scheduled: Webhook event cleanup (daily at 3:30 AM)");

    // Job 3: Heartbeat
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    job_count += 1;

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Wedmatch Worker started successfully with {} scheduled jobs", job_count);

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
