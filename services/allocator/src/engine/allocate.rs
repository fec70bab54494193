//! Binding a request to a free locker.

use spindit_events::{LockerStatus, RequestStatus};
use spindit_id::{LockerId, RequestId};
use tracing::{debug, info, instrument, warn};

use super::{cas_locker, cas_request, notify, EngineContext, EngineError, EngineResult};
use crate::model::{Assignment, Locker, LockerPreference, Request};
use crate::store::{LockerQuery, PoolTx};

#[derive(Debug, Clone, PartialEq)]
pub enum AllocationOutcome {
    /// The request now holds `locker`.
    Assigned {
        assignment: Assignment,
        locker: Locker,
    },
    Skipped(SkipReason),
}

impl AllocationOutcome {
    pub fn locker(&self) -> Option<&Locker> {
        match self {
            AllocationOutcome::Assigned { locker, .. } => Some(locker),
            AllocationOutcome::Skipped(_) => None,
        }
    }
}

/// Why a request was left as it was.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The request already holds a locker.
    AlreadyAssigned,
    RequestMissing,
    NotPending(RequestStatus),
    /// The pool is exhausted, or every candidate was lost to other requests.
    NoLockerAvailable,
}

enum Attempt {
    Done(AllocationOutcome),
    /// Another writer claimed the candidate first.
    Lost(LockerId),
}

/// Assigns a free locker to a pending request.
///
/// Candidates are tried in preference order: the preferred locker by ID, the
/// preferred locker by display number, the lowest-numbered free locker in the
/// preferred zone, then the lowest-numbered free locker anywhere. A preferred
/// zone is binding: when it has no free locker the request stays `pending`.
/// When the preferred locker exists but is taken and no zone was given, its
/// zone is tried before the rest of the pool.
///
/// Running out of lockers is an outcome, not an error: the request stays
/// `pending`.
#[instrument(skip(ctx), fields(request_id = %request_id))]
pub async fn allocate(ctx: &EngineContext, request_id: RequestId) -> EngineResult<AllocationOutcome> {
    let mut excluded: Vec<LockerId> = Vec::new();

    for attempt in 1..=ctx.config().attempts() {
        match try_allocate(ctx, request_id, &excluded).await? {
            Attempt::Done(outcome) => return Ok(outcome),
            Attempt::Lost(locker_id) => {
                debug!(attempt, locker_id = %locker_id, "lost candidate, retrying");
                excluded.push(locker_id);
            }
        }
    }

    warn!(
        attempts = ctx.config().attempts(),
        "gave up after losing every candidate; request stays pending"
    );
    Ok(AllocationOutcome::Skipped(SkipReason::NoLockerAvailable))
}

async fn try_allocate(
    ctx: &EngineContext,
    request_id: RequestId,
    excluded: &[LockerId],
) -> EngineResult<Attempt> {
    let mut tx = ctx.store().begin().await?;

    let Some(request) = tx.request(request_id).await? else {
        debug!("request not found");
        return Ok(Attempt::Done(AllocationOutcome::Skipped(
            SkipReason::RequestMissing,
        )));
    };
    if tx.assignment_for_request(request_id).await?.is_some() {
        return Ok(Attempt::Done(AllocationOutcome::Skipped(
            SkipReason::AlreadyAssigned,
        )));
    }
    if request.status != RequestStatus::Pending {
        debug!(status = %request.status, "request is not pending");
        return Ok(Attempt::Done(AllocationOutcome::Skipped(
            SkipReason::NotPending(request.status),
        )));
    }

    let Some(candidate) = select_candidate(tx.as_mut(), &request, excluded).await? else {
        warn!(
            preferred_locker = request.preferred_locker.as_deref(),
            preferred_zone = request.preferred_zone.as_deref(),
            "no locker available; request stays pending"
        );
        return Ok(Attempt::Done(AllocationOutcome::Skipped(
            SkipReason::NoLockerAvailable,
        )));
    };

    let now = ctx.now();
    let assignment = Assignment::new(request.id, candidate.id, now);
    match claim(tx.as_mut(), ctx, &request, &candidate, &assignment).await {
        Ok(true) => {}
        Ok(false) => return Ok(Attempt::Lost(candidate.id)),
        Err(e) if e.is_conflict() => return Ok(Attempt::Lost(candidate.id)),
        Err(e) => return Err(e),
    }

    match tx.commit().await {
        Ok(()) => {}
        Err(e) if e.is_conflict() => return Ok(Attempt::Lost(candidate.id)),
        Err(e) => return Err(EngineError::Store(e)),
    }

    info!(
        locker_id = %candidate.id,
        locker_number = candidate.number,
        assignment_id = %assignment.id,
        "locker reserved"
    );
    let locker = Locker {
        status: LockerStatus::Reserved,
        ..candidate
    };
    Ok(Attempt::Done(AllocationOutcome::Assigned { assignment, locker }))
}

/// Re-verifies the candidate and applies the three writes. `false` means a
/// compare-and-set missed.
async fn claim(
    tx: &mut dyn PoolTx,
    ctx: &EngineContext,
    request: &Request,
    candidate: &Locker,
    assignment: &Assignment,
) -> EngineResult<bool> {
    if !cas_locker(tx, candidate.id, LockerStatus::Free, LockerStatus::Reserved).await? {
        return Ok(false);
    }
    tx.insert_assignment(assignment).await?;
    if !cas_request(tx, request.id, RequestStatus::Pending, RequestStatus::Reserved).await? {
        return Ok(false);
    }

    let expires_at = assignment.hold_deadline(ctx.config().hold_duration);
    notify::enqueue(
        tx,
        notify::hold_created(request.user_id, assignment, candidate, expires_at, assignment.created_at),
    )
    .await?;
    Ok(true)
}

async fn select_candidate(
    tx: &mut dyn PoolTx,
    request: &Request,
    excluded: &[LockerId],
) -> EngineResult<Option<Locker>> {
    let preferred = match request.locker_preference() {
        Some(LockerPreference::Id(id)) => tx.locker(id).await?,
        Some(LockerPreference::Number(number)) => first(
            tx,
            LockerQuery::default().numbered(number).first(),
        )
        .await?,
        None => None,
    };
    let mut nearby = None;
    if let Some(locker) = preferred {
        if locker.status == LockerStatus::Free && !excluded.contains(&locker.id) {
            return Ok(Some(locker));
        }
        debug!(
            locker_id = %locker.id,
            status = %locker.status,
            "preferred locker unavailable"
        );
        nearby = Some(locker.zone_id);
    }

    let free = LockerQuery::free().excluding(excluded.iter().copied()).first();

    // A requested zone is binding: nothing outside it is offered.
    if let Some(zone_id) = request.zone_preference() {
        return first(tx, free.in_zone(zone_id)).await;
    }
    if let Some(zone_id) = nearby {
        if let Some(locker) = first(tx, free.clone().in_zone(zone_id)).await? {
            return Ok(Some(locker));
        }
        debug!(zone_id = %zone_id, "preferred locker's zone is full");
    }
    first(tx, free).await
}

async fn first(tx: &mut dyn PoolTx, query: LockerQuery) -> EngineResult<Option<Locker>> {
    Ok(tx.find_lockers(&query).await?.into_iter().next())
}
