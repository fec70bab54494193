//! The annual renewal cycle: `renewals.open` and `assignments.close`.

use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use spindit_events::{RenewalStatus, RequestStatus};
use spindit_id::{AssignmentId, RenewalId};
use tracing::{debug, info, instrument};

use super::{Job, JobResult, Step, TickReport, CLOSE_ASSIGNMENTS, OPEN_RENEWALS};
use crate::calendar::{RenewalWindow, SchoolYear};
use crate::clock::later;
use crate::engine::{
    cas_renewal, cas_request, lost_race, notify, unwind, EngineContext, EngineError,
};
use crate::model::Renewal;
use crate::store::{AssignmentQuery, RenewalQuery};

/// Opens renewals for the coming school year.
///
/// Runs daily. Inside the renewal window it creates a pending renewal for
/// every confirmed assignment from an earlier school year that lacks one, so
/// the first tick in the window does the bulk of the work and later ticks only
/// pick up stragglers. Outside the window it does nothing.
///
/// Each renewal's deadline is the configured offset from when it was opened,
/// but never later than the start of the school year it renews for.
#[derive(Debug, Default, Clone, Copy)]
pub struct RenewalOpenJob;

#[async_trait]
impl Job for RenewalOpenJob {
    fn id(&self) -> &'static str {
        OPEN_RENEWALS
    }

    #[instrument(skip_all, fields(job = OPEN_RENEWALS))]
    async fn tick(&self, ctx: &EngineContext) -> JobResult<TickReport> {
        let now = ctx.now();
        let config = ctx.config();
        let today = now.with_timezone(&config.timezone).date_naive();
        let window = RenewalWindow::upcoming(
            today,
            config.renewal.open_date,
            config.renewal.cycle_start,
        );
        if !window.contains(today) {
            debug!(opens = %window.opens, "renewal window not open");
            return Ok(TickReport::default());
        }

        let year = window.school_year;
        let cycle_start = local_midnight(ctx, window);
        let deadline = later(now, config.renewal.deadline_offset).min(cycle_start);

        let candidates = {
            let mut tx = ctx.store().begin().await?;
            tx.find_assignments(
                &AssignmentQuery::with_request_status(RequestStatus::Assigned)
                    .requested_before(year)
                    .lacking_renewal_for(year),
            )
            .await?
        };

        let mut report = TickReport::default();
        for assignment in candidates {
            let result = open_renewal(ctx, assignment.id, year, deadline).await;
            report.record(OPEN_RENEWALS, result);
        }

        if let Some(lead) = config.renewal.reminder_lead {
            let due = {
                let mut tx = ctx.store().begin().await?;
                tx.find_renewals(
                    &RenewalQuery::with_status(RenewalStatus::Pending)
                        .school_year(year)
                        .deadline_after(now)
                        .deadline_before(later(now, lead)),
                )
                .await?
            };
            for renewal in due {
                let result = remind(ctx, renewal.id).await;
                report.record(OPEN_RENEWALS, result);
            }
        }

        if !report.is_quiet() {
            info!(
                school_year = %year,
                examined = report.examined,
                opened = report.applied,
                notified = report.notified,
                failed = report.failed,
                "renewal open tick complete"
            );
        }
        Ok(report)
    }
}

/// The first day of the window's school year, at midnight in the configured
/// zone.
fn local_midnight(ctx: &EngineContext, window: RenewalWindow) -> DateTime<Utc> {
    let start = window.closes.and_time(NaiveTime::MIN);
    ctx.config()
        .timezone
        .from_local_datetime(&start)
        .earliest()
        .map(|at| at.with_timezone(&Utc))
        .unwrap_or_else(|| start.and_utc())
}

async fn open_renewal(
    ctx: &EngineContext,
    assignment_id: AssignmentId,
    year: SchoolYear,
    deadline: DateTime<Utc>,
) -> Result<Step, EngineError> {
    let now = ctx.now();
    let mut tx = ctx.store().begin().await?;

    let Some(assignment) = tx.assignment(assignment_id).await? else {
        return Ok(Step::Skipped);
    };
    let Some(request) = tx.request(assignment.request_id).await? else {
        return Ok(Step::Skipped);
    };
    if request.status != RequestStatus::Assigned {
        return Ok(Step::Skipped);
    }

    let renewal = Renewal::pending(&assignment, year, deadline, now);
    if !tx.insert_renewal(&renewal).await? {
        return Ok(Step::Skipped);
    }
    let notified = notify::enqueue(
        tx.as_mut(),
        notify::renewal_opened(request.user_id, &renewal, now),
    )
    .await?;
    tx.commit().await?;

    debug!(
        renewal_id = %renewal.id,
        assignment_id = %assignment.id,
        deadline = %deadline,
        "renewal opened"
    );
    Ok(Step::Applied { notified })
}

async fn remind(ctx: &EngineContext, renewal_id: RenewalId) -> Result<Step, EngineError> {
    let now = ctx.now();
    let mut tx = ctx.store().begin().await?;

    let Some(renewal) = tx.renewal(renewal_id).await? else {
        return Ok(Step::Skipped);
    };
    if renewal.status != RenewalStatus::Pending {
        return Ok(Step::Skipped);
    }
    let Some(request) = tx.request(renewal.request_id).await? else {
        return Ok(Step::Skipped);
    };

    let queued = notify::enqueue(
        tx.as_mut(),
        notify::renewal_deadline(request.user_id, &renewal, now),
    )
    .await?;
    if !queued {
        return Ok(Step::Skipped);
    }
    tx.commit().await?;
    Ok(Step::Notified)
}

/// Reclaims lockers whose renewal lapsed.
///
/// Every renewal still `pending` after its deadline is marked `expired`, its
/// assignment is deleted, the locker goes back to the pool and the request is
/// marked `expired`. Confirmed renewals are never touched, so their
/// assignments carry over unchanged. A lapsed renewal whose assignment is
/// already gone is marked `cancelled`.
#[derive(Debug, Default, Clone, Copy)]
pub struct AssignmentCloseJob;

#[async_trait]
impl Job for AssignmentCloseJob {
    fn id(&self) -> &'static str {
        CLOSE_ASSIGNMENTS
    }

    #[instrument(skip_all, fields(job = CLOSE_ASSIGNMENTS))]
    async fn tick(&self, ctx: &EngineContext) -> JobResult<TickReport> {
        let now = ctx.now();
        let lapsed = {
            let mut tx = ctx.store().begin().await?;
            tx.find_renewals(&RenewalQuery::with_status(RenewalStatus::Pending).deadline_before(now))
                .await?
        };

        let mut report = TickReport::default();
        for renewal in lapsed {
            let result = close_renewal(ctx, renewal.id).await;
            report.record(CLOSE_ASSIGNMENTS, result);
        }

        if !report.is_quiet() {
            info!(
                examined = report.examined,
                reclaimed = report.applied,
                failed = report.failed,
                "assignment close tick complete"
            );
        }
        Ok(report)
    }
}

async fn close_renewal(ctx: &EngineContext, renewal_id: RenewalId) -> Result<Step, EngineError> {
    let now = ctx.now();
    let mut tx = ctx.store().begin().await?;

    let Some(renewal) = tx.renewal(renewal_id).await? else {
        return Ok(Step::Skipped);
    };
    if renewal.status != RenewalStatus::Pending || renewal.deadline >= now {
        return Ok(Step::Skipped);
    }

    let Some(assignment) = tx.assignment(renewal.assignment_id).await? else {
        if !cas_renewal(
            tx.as_mut(),
            renewal.id,
            RenewalStatus::Pending,
            RenewalStatus::Cancelled,
        )
        .await?
        {
            return Err(lost_race("renewal", renewal.id));
        }
        tx.commit().await?;
        debug!(renewal_id = %renewal.id, "renewal cancelled; assignment already gone");
        return Ok(Step::Applied { notified: false });
    };

    if !cas_renewal(
        tx.as_mut(),
        renewal.id,
        RenewalStatus::Pending,
        RenewalStatus::Expired,
    )
    .await?
    {
        return Err(lost_race("renewal", renewal.id));
    }
    unwind(tx.as_mut(), &assignment, now).await?;

    let mut notified = false;
    if let Some(request) = tx.request(assignment.request_id).await? {
        let from = request.status;
        if matches!(from, RequestStatus::Reserved | RequestStatus::Assigned)
            && !cas_request(tx.as_mut(), request.id, from, RequestStatus::Expired).await?
        {
            return Err(lost_race("request", request.id));
        }
        notified = notify::enqueue(
            tx.as_mut(),
            notify::renewal_expired(request.user_id, &renewal, now),
        )
        .await?;
    }

    tx.commit().await?;
    info!(
        renewal_id = %renewal.id,
        school_year = %renewal.school_year,
        locker_id = %assignment.locker_id,
        "renewal lapsed; locker reclaimed"
    );
    Ok(Step::Applied { notified })
}
