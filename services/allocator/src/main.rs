//! spindit allocator
//!
//! Long-running engine process: consumes request events from the outbox and
//! runs the scheduled lifecycle jobs until interrupted.

use std::sync::Arc;

use anyhow::Result;
use spindit_allocator::{
    clock::SystemClock,
    config,
    engine::EngineContext,
    intake::{IntakeWorker, PgEventSource},
    jobs::{AssignmentCloseJob, ExpiryJob, Job, JobRunner, RenewalOpenJob},
    store::Database,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to SPINDIT_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting spindit allocator");
    info!(
        hold_hours = config.engine.hold_duration.num_hours(),
        timezone = %config.engine.timezone,
        renewal_opens = %config.engine.renewal.open_date,
        cycle_start = %config.engine.renewal.cycle_start,
        "Configuration loaded"
    );

    let db = match Database::connect(&config.database).await {
        Ok(db) => {
            info!("Database connection established");
            db
        }
        Err(e) => {
            error!(error = %e, "Failed to connect to database");
            return Err(e.into());
        }
    };

    // Run migrations in dev mode
    if config.dev_mode {
        info!("Running database migrations (dev mode)");
        if let Err(e) = db.run_migrations().await {
            error!(error = %e, "Failed to run migrations");
            return Err(e.into());
        }
    }

    let ctx = EngineContext::new(Arc::new(db.store()), Arc::new(SystemClock), config.engine.clone());

    // Schedule the lifecycle jobs
    let runner = JobRunner::new(ctx.clone()).await?;
    let jobs: [Arc<dyn Job>; 3] = [
        Arc::new(ExpiryJob),
        Arc::new(RenewalOpenJob),
        Arc::new(AssignmentCloseJob),
    ];
    for job in jobs {
        let Some(schedule) = config.schedules.for_job(job.id()) else {
            warn!(job = job.id(), "No schedule configured; job disabled");
            continue;
        };
        runner.register(job, schedule).await?;
    }
    runner.start().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start intake worker in background
    let intake_worker = IntakeWorker::new(
        PgEventSource::new(db.pool().clone()),
        ctx,
        config.intake.clone(),
    );
    let intake_handle = tokio::spawn(async move {
        if let Err(e) = intake_worker.run(shutdown_rx).await {
            error!(error = %e, "Intake worker failed");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    let shutdown_timeout = std::time::Duration::from_secs(10);

    if let Err(e) = tokio::time::timeout(shutdown_timeout, intake_handle).await {
        warn!(error = %e, "Intake worker did not shut down in time");
    }

    if let Err(e) = runner.shutdown().await {
        warn!(error = %e, "Job runner did not shut down cleanly");
    }

    info!("Allocator shutdown complete");
    Ok(())
}
