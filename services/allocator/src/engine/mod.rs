//! Allocation and lifecycle engine.
//!
//! Request lifecycle events come in through [`dispatch`], which routes them to
//! [`allocate`], [`release`] or [`occupy`]. The periodic jobs in
//! [`crate::jobs`] reuse the same building blocks.
//!
//! Every operation receives an [`EngineContext`]: the store handle, the clock
//! and the configuration. Nothing here reaches for global state.
//!
//! Each operation runs in one store transaction and follows the same
//! discipline: read, re-check the precondition with a compare-and-set status
//! write, mutate, commit. A compare-and-set that misses or a commit that
//! conflicts means another writer got there first; the operation starts over
//! with a fresh transaction, up to `allocation_retries` more times.

mod allocate;
pub mod notify;
mod occupy;
mod release;

pub use allocate::{allocate, AllocationOutcome, SkipReason};
pub use occupy::{occupy, OccupyOutcome};
pub use release::{release, ReleaseOutcome};

pub(crate) use release::unwind;

use std::fmt::Display;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use spindit_events::{
    LifecycleEvent, LockerStatus, RenewalStatus, RequestStatus, StatusMachine, TransitionError,
};
use spindit_id::{LockerId, RenewalId, RequestId};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::calendar::MonthDay;
use crate::clock::Clock;
use crate::store::{PoolStore, PoolTx, StoreError};

/// Engine errors.
///
/// Missing records and lost races are normal outcomes, not errors; what is
/// left is storage failure and contention that outlasted the retry bound.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

impl EngineError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, EngineError::Store(e) if e.is_conflict())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Annual renewal cycle settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenewalConfig {
    /// First day of the renewal window.
    pub open_date: MonthDay,
    /// First day of the school year; closes the window.
    pub cycle_start: MonthDay,
    /// How long after the window opens a renewal stays pending.
    pub deadline_offset: Duration,
    /// Remind owners this long before their renewal deadline.
    pub reminder_lead: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// How long an unconfirmed hold lives.
    pub hold_duration: Duration,
    /// Warn owners this long before their hold expires.
    pub hold_warning_lead: Option<Duration>,
    /// Extra attempts after a lost race.
    pub allocation_retries: u32,
    /// Calendar dates are interpreted in this zone.
    pub timezone: Tz,
    pub renewal: RenewalConfig,
}

impl EngineConfig {
    pub const DEFAULT_ALLOCATION_RETRIES: u32 = 3;

    pub fn new(hold_duration: Duration, renewal: RenewalConfig) -> Self {
        Self {
            hold_duration,
            hold_warning_lead: None,
            allocation_retries: Self::DEFAULT_ALLOCATION_RETRIES,
            timezone: chrono_tz::Europe::Berlin,
            renewal,
        }
    }

    pub fn with_hold_warning(mut self, lead: Duration) -> Self {
        self.hold_warning_lead = Some(lead);
        self
    }

    pub fn with_allocation_retries(mut self, retries: u32) -> Self {
        self.allocation_retries = retries;
        self
    }

    pub fn with_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.allocation_retries.saturating_add(1)
    }
}

/// Everything an engine operation or job tick needs.
///
/// Cloning is cheap.
#[derive(Clone)]
pub struct EngineContext {
    inner: Arc<EngineContextInner>,
}

struct EngineContextInner {
    store: Arc<dyn PoolStore>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl EngineContext {
    pub fn new(store: Arc<dyn PoolStore>, clock: Arc<dyn Clock>, config: EngineConfig) -> Self {
        Self {
            inner: Arc::new(EngineContextInner {
                store,
                clock,
                config,
            }),
        }
    }

    pub fn store(&self) -> &dyn PoolStore {
        self.inner.store.as_ref()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }
}

/// What [`dispatch`] did with an event.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Allocation(AllocationOutcome),
    Release(ReleaseOutcome),
    Occupancy(OccupyOutcome),
    Ignored,
}

/// Routes a request lifecycle event to its handler.
#[instrument(skip(ctx, event), fields(request_id = %event.request_id(), event_type = event.event_type()))]
pub async fn dispatch(ctx: &EngineContext, event: &LifecycleEvent) -> EngineResult<DispatchOutcome> {
    match event {
        LifecycleEvent::RequestCreated { request_id } => {
            Ok(DispatchOutcome::Allocation(allocate(ctx, *request_id).await?))
        }
        _ if event.is_cancellation() => {
            Ok(DispatchOutcome::Release(release(ctx, event.request_id()).await?))
        }
        _ if event.is_confirmation() => {
            Ok(DispatchOutcome::Occupancy(occupy(ctx, event.request_id()).await?))
        }
        LifecycleEvent::RequestStatusChanged { .. } => {
            debug!("no handler for status change");
            Ok(DispatchOutcome::Ignored)
        }
    }
}

// Checked compare-and-set helpers. The transition table is consulted first so
// an illegal move is a typed error rather than a silently stored status.

pub(crate) async fn cas_locker(
    tx: &mut dyn PoolTx,
    id: LockerId,
    from: LockerStatus,
    to: LockerStatus,
) -> EngineResult<bool> {
    from.check_transition(to)?;
    Ok(tx.transition_locker(id, from, to).await?)
}

pub(crate) async fn cas_request(
    tx: &mut dyn PoolTx,
    id: RequestId,
    from: RequestStatus,
    to: RequestStatus,
) -> EngineResult<bool> {
    from.check_transition(to)?;
    Ok(tx.transition_request(id, from, to).await?)
}

pub(crate) async fn cas_renewal(
    tx: &mut dyn PoolTx,
    id: RenewalId,
    from: RenewalStatus,
    to: RenewalStatus,
) -> EngineResult<bool> {
    from.check_transition(to)?;
    Ok(tx.transition_renewal(id, from, to).await?)
}

/// A record changed between our read and our write.
pub(crate) fn lost_race(what: &str, id: impl Display) -> EngineError {
    EngineError::Store(StoreError::Conflict(format!("{what} {id} changed concurrently")))
}
