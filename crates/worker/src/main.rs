//! MeterPay billing worker
//!
//! Runs the detection + correction sweep on a cron schedule. The schedule is
//! configurable via `DETECTION_CRON` (six-field cron, default top of every
//! hour); the sweep itself is the same one the HTTP entrypoint runs.

use sqlx::PgPool;
use time::Duration;
use tokio_cron_scheduler::{Job, JobScheduler};

use meterpay_billing::{run_sweep, OpsNotifier, SweepOptions};

const DEFAULT_CRON: &str = "0 0 * * * *";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "meterpay_worker=info".into()),
        )
        .init();

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let schedule =
        std::env::var("DETECTION_CRON").unwrap_or_else(|_| DEFAULT_CRON.to_string());
    let window_hours: i64 = std::env::var("DETECTION_WINDOW_HOURS")
        .unwrap_or_else(|_| "24".to_string())
        .parse()
        .unwrap_or(24);
    let alert_threshold: usize = std::env::var("MISMATCH_ALERT_THRESHOLD")
        .unwrap_or_else(|_| "1".to_string())
        .parse()
        .unwrap_or(1);

    let pool = meterpay_shared::create_pool(&database_url).await?;
    meterpay_shared::run_migrations(&pool).await?;
    tracing::info!("Database migrations applied");

    let scheduler = JobScheduler::new().await?;
    let job_pool = pool.clone();
    let job = Job::new_async(schedule.as_str(), move |_uuid, _lock| {
        let pool = job_pool.clone();
        Box::pin(async move {
            sweep_once(&pool, window_hours, alert_threshold).await;
        })
    })?;
    scheduler.add(job).await?;
    scheduler.start().await?;

    tracing::info!(%schedule, window_hours, "Billing worker started");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received, stopping worker");
    Ok(())
}

/// One scheduled sweep. Errors are logged, never fatal: the next tick retries.
async fn sweep_once(pool: &PgPool, window_hours: i64, alert_threshold: usize) {
    let options = SweepOptions {
        auto_correct: true,
        dry_run: false,
    };

    match run_sweep(pool, Duration::hours(window_hours), options).await {
        Ok(summary) => {
            let notifier = OpsNotifier::from_env();
            if notifier.should_notify(&summary, alert_threshold) {
                if let Err(e) = notifier.send_summary(&summary).await {
                    tracing::error!("Failed to send ops notification: {}", e);
                }
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "Scheduled billing sweep failed");
        }
    }
}
