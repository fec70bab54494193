//! ID types for the locker domain.

use crate::define_id;

define_id!(
    /// A physical locker in the pool.
    LockerId,
    "lkr"
);
define_id!(
    /// A named group of lockers used for preference matching.
    ZoneId,
    "zone"
);
define_id!(
    /// The account that owns a request.
    UserId,
    "usr"
);
define_id!(
    /// A request for a locker.
    RequestId,
    "req"
);
define_id!(
    /// The binding of one request to one locker.
    AssignmentId,
    "asgn"
);
define_id!(
    /// A per-school-year continuation record for an assignment.
    RenewalId,
    "rnw"
);
define_id!(
    /// An outbound message waiting in the notification queue.
    NotificationId,
    "ntf"
);

/// Position of a row in the request event outbox.
///
/// Outbox positions come from a database sequence, so they are plain integers
/// rather than ULIDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EventId(i64);

impl EventId {
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn value(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for EventId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}
