//! Unwinding assignments.

use chrono::{DateTime, Utc};
use spindit_events::{LockerStatus, RenewalStatus};
use spindit_id::RequestId;
use tracing::{debug, info, instrument, warn};

use super::{cas_locker, cas_renewal, lost_race, EngineContext, EngineError, EngineResult};
use crate::model::Assignment;
use crate::store::{PoolTx, RenewalQuery};

#[derive(Debug, Clone, PartialEq)]
pub enum ReleaseOutcome {
    /// The assignment was deleted and its locker returned to the pool.
    Freed { assignment: Assignment },
    /// Nothing held; already released or never allocated.
    Noop,
}

/// Gives a cancelled request's locker back to the pool.
///
/// Releasing twice is harmless: the second call finds no assignment.
#[instrument(skip(ctx), fields(request_id = %request_id))]
pub async fn release(ctx: &EngineContext, request_id: RequestId) -> EngineResult<ReleaseOutcome> {
    let attempts = ctx.config().attempts();
    let mut attempt = 0;

    loop {
        attempt += 1;
        match try_release(ctx, request_id).await {
            Ok(outcome) => return Ok(outcome),
            Err(e) if e.is_conflict() && attempt < attempts => {
                debug!(attempt, error = %e, "release raced another writer, retrying");
            }
            Err(e) => return Err(e),
        }
    }
}

async fn try_release(ctx: &EngineContext, request_id: RequestId) -> EngineResult<ReleaseOutcome> {
    let mut tx = ctx.store().begin().await?;

    let Some(assignment) = tx.assignment_for_request(request_id).await? else {
        debug!("no assignment to release");
        return Ok(ReleaseOutcome::Noop);
    };

    unwind(tx.as_mut(), &assignment, ctx.now()).await?;
    tx.commit().await.map_err(EngineError::Store)?;

    info!(
        assignment_id = %assignment.id,
        locker_id = %assignment.locker_id,
        "locker released"
    );
    Ok(ReleaseOutcome::Freed { assignment })
}

/// Frees the assignment's locker, deletes the assignment and cancels its live
/// renewals, all in the caller's transaction.
///
/// A missing locker counts as already free. A locker in maintenance stays in
/// maintenance. Renewals still pending, or confirmed for a cycle whose deadline
/// is ahead, are cancelled; settled history is left alone.
pub(crate) async fn unwind(
    tx: &mut dyn PoolTx,
    assignment: &Assignment,
    now: DateTime<Utc>,
) -> EngineResult<()> {
    match tx.locker(assignment.locker_id).await? {
        Some(locker) if locker.status.is_held() => {
            if !cas_locker(tx, locker.id, locker.status, LockerStatus::Free).await? {
                return Err(lost_race("locker", locker.id));
            }
        }
        Some(locker) => {
            debug!(
                locker_id = %locker.id,
                status = %locker.status,
                "locker not held; status left as is"
            );
        }
        None => {
            warn!(locker_id = %assignment.locker_id, "assigned locker no longer exists");
        }
    }

    if !tx.delete_assignment(assignment.id).await? {
        return Err(lost_race("assignment", assignment.id));
    }

    for renewal in tx
        .find_renewals(&RenewalQuery::for_assignment(assignment.id))
        .await?
    {
        let live = match renewal.status {
            RenewalStatus::Pending => true,
            RenewalStatus::Confirmed => renewal.deadline > now,
            RenewalStatus::Expired | RenewalStatus::Cancelled => false,
        };
        if live && !cas_renewal(tx, renewal.id, renewal.status, RenewalStatus::Cancelled).await? {
            return Err(lost_race("renewal", renewal.id));
        }
    }
    Ok(())
}
