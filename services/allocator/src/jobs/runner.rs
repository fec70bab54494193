//! Cron scheduling for jobs.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_cron_scheduler::{JobBuilder, JobScheduler};
use tracing::{debug, error, info, warn};

use super::{Job, JobResult, TickReport};
use crate::engine::EngineContext;

/// A job that never runs two ticks at once.
///
/// A tick that fires while the previous one is still running is skipped, not
/// queued; the next scheduled tick picks up whatever it missed.
pub struct GuardedJob {
    job: Arc<dyn Job>,
    running: Mutex<()>,
}

impl GuardedJob {
    pub fn new(job: Arc<dyn Job>) -> Self {
        Self {
            job,
            running: Mutex::new(()),
        }
    }

    pub fn id(&self) -> &'static str {
        self.job.id()
    }

    /// Runs one tick. Returns `None` if the previous tick is still running or
    /// this one failed.
    pub async fn run(&self, ctx: &EngineContext) -> Option<TickReport> {
        let job = self.id();
        let Ok(_running) = self.running.try_lock() else {
            warn!(job, "previous run still active; skipping tick");
            return None;
        };

        match self.job.tick(ctx).await {
            Ok(report) => {
                debug!(
                    job,
                    examined = report.examined,
                    applied = report.applied,
                    failed = report.failed,
                    "tick finished"
                );
                Some(report)
            }
            Err(e) => {
                error!(job, error = %e, "tick failed");
                None
            }
        }
    }
}

/// Runs jobs on timezone-aware cron schedules.
pub struct JobRunner {
    scheduler: JobScheduler,
    ctx: EngineContext,
}

impl JobRunner {
    pub async fn new(ctx: EngineContext) -> JobResult<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self { scheduler, ctx })
    }

    /// Schedules `job` on a six-field cron expression (seconds first),
    /// evaluated in the engine's timezone.
    pub async fn register(&self, job: Arc<dyn Job>, schedule: &str) -> JobResult<()> {
        let guarded = Arc::new(GuardedJob::new(job));
        let id = guarded.id();
        let timezone = self.ctx.config().timezone;
        let ctx = self.ctx.clone();

        let cron_job = JobBuilder::new()
            .with_timezone(timezone)
            .with_cron_job_type()
            .with_schedule(schedule)?
            .with_run_async(Box::new(move |_uuid, _scheduler| {
                let guarded = Arc::clone(&guarded);
                let ctx = ctx.clone();
                Box::pin(async move {
                    guarded.run(&ctx).await;
                })
            }))
            .build()?;

        self.scheduler.add(cron_job).await?;
        info!(job = id, schedule, timezone = %timezone, "Registered job");
        Ok(())
    }

    pub async fn start(&self) -> JobResult<()> {
        self.scheduler.start().await?;
        info!("Job runner started");
        Ok(())
    }

    pub async fn shutdown(mut self) -> JobResult<()> {
        self.scheduler.shutdown().await?;
        info!("Job runner stopped");
        Ok(())
    }
}
