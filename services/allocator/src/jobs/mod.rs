//! Periodic jobs over the locker pool.
//!
//! Each job walks its candidates and handles every one in its own transaction,
//! so one bad record never blocks the batch and a crash mid-tick leaves only
//! finished work behind. Candidates that fail are logged and picked up again on
//! the next tick.

mod expiry;
mod renewal;
mod runner;

pub use expiry::ExpiryJob;
pub use renewal::{AssignmentCloseJob, RenewalOpenJob};
pub use runner::{GuardedJob, JobRunner};

use async_trait::async_trait;
use thiserror::Error;
use tokio_cron_scheduler::JobSchedulerError;
use tracing::{debug, warn};

use crate::engine::{EngineContext, EngineError};
use crate::store::StoreError;

pub const EXPIRE_RESERVATIONS: &str = "reservations.expire";
pub const OPEN_RENEWALS: &str = "renewals.open";
pub const CLOSE_ASSIGNMENTS: &str = "assignments.close";

#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] JobSchedulerError),
}

pub type JobResult<T> = Result<T, JobError>;

/// Counts from one tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    /// Candidates looked at.
    pub examined: usize,
    /// Candidates whose state this tick changed.
    pub applied: usize,
    /// Candidates that needed nothing, or that another writer settled first.
    pub skipped: usize,
    /// Candidates left for the next tick after an error.
    pub failed: usize,
    pub notified: usize,
}

impl TickReport {
    pub fn is_quiet(&self) -> bool {
        self.applied == 0 && self.failed == 0 && self.notified == 0
    }

    /// Books the result of handling one candidate.
    pub(crate) fn record(&mut self, job: &'static str, result: Result<Step, EngineError>) {
        self.examined += 1;
        match result {
            Ok(Step::Applied { notified }) => {
                self.applied += 1;
                self.notified += usize::from(notified);
            }
            Ok(Step::Notified) => self.notified += 1,
            Ok(Step::Skipped) => self.skipped += 1,
            Err(e) if e.is_conflict() => {
                debug!(job, error = %e, "candidate changed concurrently; skipped");
                self.skipped += 1;
            }
            Err(e) => {
                warn!(job, error = %e, "candidate failed; will retry next tick");
                self.failed += 1;
            }
        }
    }
}

/// What happened to one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Applied { notified: bool },
    /// Only a notification was queued.
    Notified,
    Skipped,
}

/// A named unit of periodic work.
#[async_trait]
pub trait Job: Send + Sync {
    fn id(&self) -> &'static str;

    async fn tick(&self, ctx: &EngineContext) -> JobResult<TickReport>;
}
