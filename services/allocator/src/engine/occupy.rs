//! Confirmed holds.

use spindit_events::{LockerStatus, RequestStatus};
use spindit_id::{LockerId, RequestId};
use tracing::{debug, info, instrument};

use super::{cas_locker, EngineContext, EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OccupyOutcome {
    Occupied { locker_id: LockerId },
    Noop,
}

/// Moves a confirmed request's locker from `reserved` to `occupied`.
///
/// Does nothing unless the request is `assigned`, still holds an assignment,
/// and the locker is still `reserved`.
#[instrument(skip(ctx), fields(request_id = %request_id))]
pub async fn occupy(ctx: &EngineContext, request_id: RequestId) -> EngineResult<OccupyOutcome> {
    let attempts = ctx.config().attempts();
    let mut attempt = 0;

    loop {
        attempt += 1;
        match try_occupy(ctx, request_id).await {
            Ok(outcome) => return Ok(outcome),
            Err(e) if e.is_conflict() && attempt < attempts => {
                debug!(attempt, error = %e, "occupy raced another writer, retrying");
            }
            Err(e) => return Err(e),
        }
    }
}

async fn try_occupy(ctx: &EngineContext, request_id: RequestId) -> EngineResult<OccupyOutcome> {
    let mut tx = ctx.store().begin().await?;

    match tx.request(request_id).await? {
        Some(request) if request.status == RequestStatus::Assigned => {}
        _ => return Ok(OccupyOutcome::Noop),
    }
    let Some(assignment) = tx.assignment_for_request(request_id).await? else {
        return Ok(OccupyOutcome::Noop);
    };
    match tx.locker(assignment.locker_id).await? {
        Some(locker) if locker.status == LockerStatus::Reserved => {}
        _ => return Ok(OccupyOutcome::Noop),
    }

    if !cas_locker(
        tx.as_mut(),
        assignment.locker_id,
        LockerStatus::Reserved,
        LockerStatus::Occupied,
    )
    .await?
    {
        return Ok(OccupyOutcome::Noop);
    }
    tx.commit().await.map_err(EngineError::Store)?;

    info!(locker_id = %assignment.locker_id, "locker occupied");
    Ok(OccupyOutcome::Occupied {
        locker_id: assignment.locker_id,
    })
}
