//! Resource pool store.
//!
//! The engine talks to storage through two traits:
//!
//! - [`PoolStore`] hands out transactions.
//! - [`PoolTx`] is one transaction: typed reads, compare-and-set status
//!   writes, inserts and deletes. Dropping it without [`PoolTx::commit`] rolls
//!   everything back.
//!
//! Every status write is a compare-and-set against the status the caller last
//! observed, so a write that raced with another transaction reports `false`
//! instead of clobbering it. Implementations may also refuse a commit with
//! [`StoreError::Conflict`]; callers treat both the same way.
//!
//! Two implementations ship with the crate: [`PgStore`] over Postgres and
//! [`MemoryStore`] for tests and local experiments.

mod error;
pub mod memory;
pub mod postgres;
mod query;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use postgres::{Database, DbConfig, PgStore};
pub use query::{AssignmentQuery, LockerQuery, RenewalQuery};

use async_trait::async_trait;
use spindit_events::{LockerStatus, RenewalStatus, RequestStatus};
use spindit_id::{AssignmentId, LockerId, RenewalId, RequestId};

use crate::model::{Assignment, Locker, Notification, Renewal, Request};

/// Source of transactions over the locker pool.
#[async_trait]
pub trait PoolStore: Send + Sync {
    async fn begin(&self) -> StoreResult<Box<dyn PoolTx>>;
}

/// One transaction against the pool.
#[async_trait]
pub trait PoolTx: Send {
    async fn locker(&mut self, id: LockerId) -> StoreResult<Option<Locker>>;

    /// Lockers matching `query`, ascending by display number.
    async fn find_lockers(&mut self, query: &LockerQuery) -> StoreResult<Vec<Locker>>;

    /// Sets the locker to `to` only if it is still `from`.
    async fn transition_locker(
        &mut self,
        id: LockerId,
        from: LockerStatus,
        to: LockerStatus,
    ) -> StoreResult<bool>;

    async fn request(&mut self, id: RequestId) -> StoreResult<Option<Request>>;

    /// Sets the request to `to` only if it is still `from`.
    async fn transition_request(
        &mut self,
        id: RequestId,
        from: RequestStatus,
        to: RequestStatus,
    ) -> StoreResult<bool>;

    async fn assignment(&mut self, id: AssignmentId) -> StoreResult<Option<Assignment>>;

    async fn assignment_for_request(&mut self, id: RequestId) -> StoreResult<Option<Assignment>>;

    /// Assignments matching `query`, oldest first.
    async fn find_assignments(&mut self, query: &AssignmentQuery) -> StoreResult<Vec<Assignment>>;

    /// Fails with [`StoreError::Conflict`] if the request or the locker already
    /// has an assignment.
    async fn insert_assignment(&mut self, assignment: &Assignment) -> StoreResult<()>;

    /// Returns `false` if the assignment was already gone.
    async fn delete_assignment(&mut self, id: AssignmentId) -> StoreResult<bool>;

    async fn renewal(&mut self, id: RenewalId) -> StoreResult<Option<Renewal>>;

    /// Renewals matching `query`, earliest deadline first.
    async fn find_renewals(&mut self, query: &RenewalQuery) -> StoreResult<Vec<Renewal>>;

    /// Returns `false` when a renewal for the same assignment and school year
    /// already exists.
    async fn insert_renewal(&mut self, renewal: &Renewal) -> StoreResult<bool>;

    /// Sets the renewal to `to` only if it is still `from`.
    async fn transition_renewal(
        &mut self,
        id: RenewalId,
        from: RenewalStatus,
        to: RenewalStatus,
    ) -> StoreResult<bool>;

    /// Appends to the notification queue. Returns `false` when the dedupe key
    /// was already used.
    async fn enqueue_notification(&mut self, notification: &Notification) -> StoreResult<bool>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;
}
