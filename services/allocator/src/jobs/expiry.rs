//! `reservations.expire`: reclaiming holds nobody confirmed in time.

use async_trait::async_trait;
use chrono::Duration;
use spindit_events::RequestStatus;
use spindit_id::AssignmentId;
use tracing::{debug, info, instrument};

use super::{Job, JobResult, Step, TickReport, EXPIRE_RESERVATIONS};
use crate::clock::earlier;
use crate::engine::{cas_request, lost_race, notify, unwind, EngineContext, EngineError};
use crate::store::AssignmentQuery;

/// Frees holds older than the configured hold duration and marks their
/// requests `expired`.
///
/// With a warning lead configured, a hold that is within the lead of expiring
/// gets one `hold_expiring` notice first.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExpiryJob;

#[async_trait]
impl Job for ExpiryJob {
    fn id(&self) -> &'static str {
        EXPIRE_RESERVATIONS
    }

    #[instrument(skip_all, fields(job = EXPIRE_RESERVATIONS))]
    async fn tick(&self, ctx: &EngineContext) -> JobResult<TickReport> {
        let now = ctx.now();
        let config = ctx.config();
        let lead = config
            .hold_warning_lead
            .filter(|lead| *lead < config.hold_duration)
            .unwrap_or_else(Duration::zero);
        let cutoff = earlier(now, config.hold_duration - lead);

        let candidates = {
            let mut tx = ctx.store().begin().await?;
            tx.find_assignments(&AssignmentQuery::holds().created_before(cutoff))
                .await?
        };

        let mut report = TickReport::default();
        for assignment in candidates {
            let result = if assignment.is_stale(now, config.hold_duration) {
                expire_hold(ctx, assignment.id).await
            } else {
                warn_hold(ctx, assignment.id).await
            };
            report.record(EXPIRE_RESERVATIONS, result);
        }

        if !report.is_quiet() {
            info!(
                examined = report.examined,
                expired = report.applied,
                warned = report.notified,
                failed = report.failed,
                "expiry tick complete"
            );
        }
        Ok(report)
    }
}

async fn expire_hold(ctx: &EngineContext, assignment_id: AssignmentId) -> Result<Step, EngineError> {
    let now = ctx.now();
    let mut tx = ctx.store().begin().await?;

    let Some(assignment) = tx.assignment(assignment_id).await? else {
        return Ok(Step::Skipped);
    };
    if !assignment.is_stale(now, ctx.config().hold_duration) {
        return Ok(Step::Skipped);
    }
    let request = tx.request(assignment.request_id).await?;

    let mut notified = false;
    match &request {
        Some(request) if request.status == RequestStatus::Reserved => {
            unwind(tx.as_mut(), &assignment, now).await?;
            if !cas_request(
                tx.as_mut(),
                request.id,
                RequestStatus::Reserved,
                RequestStatus::Expired,
            )
            .await?
            {
                return Err(lost_race("request", request.id));
            }
            notified = notify::enqueue(
                tx.as_mut(),
                notify::hold_expired(request.user_id, &assignment, now),
            )
            .await?;
        }
        // Cancelled while we were looking: finish the release it triggered.
        Some(request) if request.status == RequestStatus::Cancelled => {
            unwind(tx.as_mut(), &assignment, now).await?;
        }
        Some(request) => {
            debug!(
                request_id = %request.id,
                status = %request.status,
                "hold no longer pending confirmation"
            );
            return Ok(Step::Skipped);
        }
        None => {
            unwind(tx.as_mut(), &assignment, now).await?;
        }
    }

    tx.commit().await?;
    info!(
        assignment_id = %assignment.id,
        request_id = %assignment.request_id,
        locker_id = %assignment.locker_id,
        "hold expired"
    );
    Ok(Step::Applied { notified })
}

async fn warn_hold(ctx: &EngineContext, assignment_id: AssignmentId) -> Result<Step, EngineError> {
    let now = ctx.now();
    let mut tx = ctx.store().begin().await?;

    let Some(assignment) = tx.assignment(assignment_id).await? else {
        return Ok(Step::Skipped);
    };
    let Some(request) = tx.request(assignment.request_id).await? else {
        return Ok(Step::Skipped);
    };
    if request.status != RequestStatus::Reserved {
        return Ok(Step::Skipped);
    }

    let expires_at = assignment.hold_deadline(ctx.config().hold_duration);
    let queued = notify::enqueue(
        tx.as_mut(),
        notify::hold_expiring(request.user_id, &assignment, expires_at, now),
    )
    .await?;
    if !queued {
        return Ok(Step::Skipped);
    }
    tx.commit().await?;
    Ok(Step::Notified)
}
