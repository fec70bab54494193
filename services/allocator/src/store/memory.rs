//! In-process pool store.
//!
//! Every transaction works on a private snapshot of the tables taken at
//! [`PoolStore::begin`]. Rows it writes remember the version they had in that
//! snapshot; commit re-checks those versions under the store lock and fails
//! with [`StoreError::Conflict`] if anyone else committed a change to them in
//! the meantime (first committer wins). Unique constraints are re-checked
//! against the committed tables at the same point.
//!
//! `begin` and `commit` yield to the runtime, so transactions started from
//! concurrent tasks genuinely interleave.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use spindit_events::{LockerStatus, RenewalStatus, RequestStatus};
use spindit_id::{AssignmentId, LockerId, RenewalId, RequestId, ZoneId};
use tracing::debug;

use super::{
    AssignmentQuery, LockerQuery, PoolStore, PoolTx, RenewalQuery, StoreError, StoreResult,
};
use crate::model::{Assignment, Locker, Notification, Renewal, Request};

#[derive(Debug, Clone)]
struct Row<T> {
    version: u64,
    value: T,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RowKey {
    Locker(LockerId),
    Request(RequestId),
    Assignment(AssignmentId),
    Renewal(RenewalId),
}

#[derive(Debug, Clone, Default)]
struct Tables {
    zones: BTreeMap<ZoneId, String>,
    lockers: HashMap<LockerId, Row<Locker>>,
    requests: HashMap<RequestId, Row<Request>>,
    assignments: HashMap<AssignmentId, Row<Assignment>>,
    renewals: HashMap<RenewalId, Row<Renewal>>,
    notifications: Vec<Notification>,
    last_version: u64,
}

impl Tables {
    fn bump(&mut self) -> u64 {
        self.last_version += 1;
        self.last_version
    }

    fn version_of(&self, key: RowKey) -> Option<u64> {
        match key {
            RowKey::Locker(id) => self.lockers.get(&id).map(|r| r.version),
            RowKey::Request(id) => self.requests.get(&id).map(|r| r.version),
            RowKey::Assignment(id) => self.assignments.get(&id).map(|r| r.version),
            RowKey::Renewal(id) => self.renewals.get(&id).map(|r| r.version),
        }
    }

    fn has_dedupe_key(&self, key: &str) -> bool {
        self.notifications
            .iter()
            .any(|n| n.dedupe_key.as_deref() == Some(key))
    }
}

/// Pool store kept entirely in memory.
///
/// Cloning shares the underlying tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        lock(&self.tables)
    }

    // Fixtures. These write straight to the committed tables, like a staff
    // member editing records outside the engine, and bump row versions so
    // in-flight transactions notice.

    pub fn add_zone(&self, name: impl Into<String>) -> ZoneId {
        let id = ZoneId::new();
        self.tables().zones.insert(id, name.into());
        id
    }

    /// Creates one zone per name with `per_zone` free lockers each, numbered
    /// consecutively from 1 across zones in the given order.
    pub fn seed_pool(&self, zone_names: &[&str], per_zone: i32) -> Vec<ZoneId> {
        let mut zones = Vec::with_capacity(zone_names.len());
        let mut number = 1;
        for name in zone_names {
            let zone_id = self.add_zone(*name);
            for _ in 0..per_zone {
                self.add_locker(Locker::new(zone_id, number));
                number += 1;
            }
            zones.push(zone_id);
        }
        zones
    }

    pub fn add_locker(&self, locker: Locker) -> Locker {
        let mut tables = self.tables();
        let version = tables.bump();
        tables.lockers.insert(
            locker.id,
            Row {
                version,
                value: locker.clone(),
            },
        );
        locker
    }

    pub fn remove_locker(&self, id: LockerId) -> bool {
        self.tables().lockers.remove(&id).is_some()
    }

    pub fn set_locker_status(&self, id: LockerId, status: LockerStatus) -> bool {
        let mut tables = self.tables();
        let version = tables.bump();
        match tables.lockers.get_mut(&id) {
            Some(row) => {
                row.value.status = status;
                row.version = version;
                true
            }
            None => false,
        }
    }

    pub fn insert_request(&self, request: Request) -> Request {
        let mut tables = self.tables();
        let version = tables.bump();
        tables.requests.insert(
            request.id,
            Row {
                version,
                value: request.clone(),
            },
        );
        request
    }

    /// Overwrites a request's status and returns the previous one.
    pub fn set_request_status(&self, id: RequestId, status: RequestStatus) -> Option<RequestStatus> {
        let mut tables = self.tables();
        let version = tables.bump();
        let row = tables.requests.get_mut(&id)?;
        let previous = row.value.status;
        row.value.status = status;
        row.version = version;
        Some(previous)
    }

    /// Marks a pending renewal confirmed. Returns `false` if it was not pending.
    pub fn confirm_renewal(&self, id: RenewalId, at: DateTime<Utc>) -> bool {
        let mut tables = self.tables();
        let version = tables.bump();
        match tables.renewals.get_mut(&id) {
            Some(row) if row.value.status == RenewalStatus::Pending => {
                row.value.status = RenewalStatus::Confirmed;
                row.value.confirmed_at = Some(at);
                row.version = version;
                true
            }
            _ => false,
        }
    }

    // Inspection.

    pub fn zones(&self) -> Vec<(ZoneId, String)> {
        self.tables()
            .zones
            .iter()
            .map(|(id, name)| (*id, name.clone()))
            .collect()
    }

    pub fn locker(&self, id: LockerId) -> Option<Locker> {
        self.tables().lockers.get(&id).map(|r| r.value.clone())
    }

    pub fn locker_by_number(&self, number: i32) -> Option<Locker> {
        self.tables()
            .lockers
            .values()
            .find(|r| r.value.number == number)
            .map(|r| r.value.clone())
    }

    /// All lockers, by display number.
    pub fn lockers(&self) -> Vec<Locker> {
        let mut lockers: Vec<Locker> = self
            .tables()
            .lockers
            .values()
            .map(|r| r.value.clone())
            .collect();
        lockers.sort_by_key(|l| (l.number, l.id));
        lockers
    }

    pub fn request(&self, id: RequestId) -> Option<Request> {
        self.tables().requests.get(&id).map(|r| r.value.clone())
    }

    /// All assignments, oldest first.
    pub fn assignments(&self) -> Vec<Assignment> {
        let mut assignments: Vec<Assignment> = self
            .tables()
            .assignments
            .values()
            .map(|r| r.value.clone())
            .collect();
        assignments.sort_by_key(|a| (a.created_at, a.id));
        assignments
    }

    pub fn assignment_for_request(&self, request_id: RequestId) -> Option<Assignment> {
        self.tables()
            .assignments
            .values()
            .find(|r| r.value.request_id == request_id)
            .map(|r| r.value.clone())
    }

    pub fn renewals(&self) -> Vec<Renewal> {
        let mut renewals: Vec<Renewal> = self
            .tables()
            .renewals
            .values()
            .map(|r| r.value.clone())
            .collect();
        renewals.sort_by_key(|r| (r.deadline, r.id));
        renewals
    }

    /// The notification queue, in enqueue order.
    pub fn notifications(&self) -> Vec<Notification> {
        self.tables().notifications.clone()
    }
}

fn lock(tables: &Mutex<Tables>) -> MutexGuard<'_, Tables> {
    // Commits apply all-or-nothing under the lock, so a poisoned lock still
    // guards consistent tables.
    tables.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl PoolStore for MemoryStore {
    async fn begin(&self) -> StoreResult<Box<dyn PoolTx>> {
        tokio::task::yield_now().await;
        let snapshot = self.tables().clone();
        Ok(Box::new(MemoryTx {
            shared: Arc::clone(&self.tables),
            snapshot,
            touched: HashMap::new(),
            outbox: Vec::new(),
        }))
    }
}

struct MemoryTx {
    shared: Arc<Mutex<Tables>>,
    snapshot: Tables,
    /// Rows written by this transaction and their version at snapshot time.
    touched: HashMap<RowKey, Option<u64>>,
    outbox: Vec<Notification>,
}

impl MemoryTx {
    fn touch(&mut self, key: RowKey) {
        let base = self.snapshot.version_of(key);
        self.touched.entry(key).or_insert(base);
    }

    fn apply(self) -> StoreResult<()> {
        let MemoryTx {
            shared,
            snapshot,
            touched,
            outbox,
        } = self;
        let mut tables = lock(&shared);

        for (key, base) in &touched {
            if tables.version_of(*key) != *base {
                return Err(StoreError::Conflict(format!(
                    "{key:?} changed since the transaction began"
                )));
            }
        }
        check_unique(&tables, &snapshot, &touched)?;

        for key in touched.keys() {
            let version = tables.bump();
            match *key {
                RowKey::Locker(id) => {
                    upsert(&mut tables.lockers, id, snapshot.lockers.get(&id), version)
                }
                RowKey::Request(id) => {
                    upsert(&mut tables.requests, id, snapshot.requests.get(&id), version)
                }
                RowKey::Assignment(id) => upsert(
                    &mut tables.assignments,
                    id,
                    snapshot.assignments.get(&id),
                    version,
                ),
                RowKey::Renewal(id) => {
                    upsert(&mut tables.renewals, id, snapshot.renewals.get(&id), version)
                }
            }
        }

        for notification in outbox {
            if let Some(key) = notification.dedupe_key.as_deref() {
                if tables.has_dedupe_key(key) {
                    debug!(dedupe_key = key, "notification already queued");
                    continue;
                }
            }
            tables.notifications.push(notification);
        }
        Ok(())
    }
}

fn upsert<K, T>(table: &mut HashMap<K, Row<T>>, id: K, row: Option<&Row<T>>, version: u64)
where
    K: std::hash::Hash + Eq,
    T: Clone,
{
    match row {
        Some(row) => {
            table.insert(
                id,
                Row {
                    version,
                    value: row.value.clone(),
                },
            );
        }
        None => {
            table.remove(&id);
        }
    }
}

/// Unique constraints checked against rows other transactions committed.
fn check_unique(
    committed: &Tables,
    snapshot: &Tables,
    touched: &HashMap<RowKey, Option<u64>>,
) -> StoreResult<()> {
    for key in touched.keys() {
        match *key {
            RowKey::Assignment(id) => {
                let Some(mine) = snapshot.assignments.get(&id) else {
                    continue;
                };
                let clash = committed.assignments.iter().any(|(other_id, other)| {
                    *other_id != id
                        && !touched.contains_key(&RowKey::Assignment(*other_id))
                        && (other.value.locker_id == mine.value.locker_id
                            || other.value.request_id == mine.value.request_id)
                });
                if clash {
                    return Err(StoreError::Conflict(format!(
                        "assignment for locker {} or request {} already exists",
                        mine.value.locker_id, mine.value.request_id
                    )));
                }
            }
            RowKey::Renewal(id) => {
                let Some(mine) = snapshot.renewals.get(&id) else {
                    continue;
                };
                let clash = committed.renewals.iter().any(|(other_id, other)| {
                    *other_id != id
                        && !touched.contains_key(&RowKey::Renewal(*other_id))
                        && other.value.assignment_id == mine.value.assignment_id
                        && other.value.school_year == mine.value.school_year
                });
                if clash {
                    return Err(StoreError::Conflict(format!(
                        "renewal for assignment {} in {} already exists",
                        mine.value.assignment_id, mine.value.school_year
                    )));
                }
            }
            RowKey::Locker(_) | RowKey::Request(_) => {}
        }
    }
    Ok(())
}

#[async_trait]
impl PoolTx for MemoryTx {
    async fn locker(&mut self, id: LockerId) -> StoreResult<Option<Locker>> {
        Ok(self.snapshot.lockers.get(&id).map(|r| r.value.clone()))
    }

    async fn find_lockers(&mut self, query: &LockerQuery) -> StoreResult<Vec<Locker>> {
        let mut found: Vec<Locker> = self
            .snapshot
            .lockers
            .values()
            .filter(|r| query.matches(&r.value))
            .map(|r| r.value.clone())
            .collect();
        found.sort_by_key(|l| (l.number, l.id));
        truncate(&mut found, query.limit);
        Ok(found)
    }

    async fn transition_locker(
        &mut self,
        id: LockerId,
        from: LockerStatus,
        to: LockerStatus,
    ) -> StoreResult<bool> {
        match self.snapshot.lockers.get(&id) {
            Some(row) if row.value.status == from => {}
            _ => return Ok(false),
        }
        self.touch(RowKey::Locker(id));
        if let Some(row) = self.snapshot.lockers.get_mut(&id) {
            row.value.status = to;
        }
        Ok(true)
    }

    async fn request(&mut self, id: RequestId) -> StoreResult<Option<Request>> {
        Ok(self.snapshot.requests.get(&id).map(|r| r.value.clone()))
    }

    async fn transition_request(
        &mut self,
        id: RequestId,
        from: RequestStatus,
        to: RequestStatus,
    ) -> StoreResult<bool> {
        match self.snapshot.requests.get(&id) {
            Some(row) if row.value.status == from => {}
            _ => return Ok(false),
        }
        self.touch(RowKey::Request(id));
        if let Some(row) = self.snapshot.requests.get_mut(&id) {
            row.value.status = to;
        }
        Ok(true)
    }

    async fn assignment(&mut self, id: AssignmentId) -> StoreResult<Option<Assignment>> {
        Ok(self.snapshot.assignments.get(&id).map(|r| r.value.clone()))
    }

    async fn assignment_for_request(&mut self, id: RequestId) -> StoreResult<Option<Assignment>> {
        Ok(self
            .snapshot
            .assignments
            .values()
            .find(|r| r.value.request_id == id)
            .map(|r| r.value.clone()))
    }

    async fn find_assignments(&mut self, query: &AssignmentQuery) -> StoreResult<Vec<Assignment>> {
        let snapshot = &self.snapshot;
        let mut found: Vec<Assignment> = snapshot
            .assignments
            .values()
            .filter(|r| {
                let Some(request) = snapshot.requests.get(&r.value.request_id) else {
                    return false;
                };
                query.matches(&r.value, &request.value, |year| {
                    snapshot.renewals.values().any(|n| {
                        n.value.assignment_id == r.value.id && n.value.school_year == year
                    })
                })
            })
            .map(|r| r.value.clone())
            .collect();
        found.sort_by_key(|a| (a.created_at, a.id));
        truncate(&mut found, query.limit);
        Ok(found)
    }

    async fn insert_assignment(&mut self, assignment: &Assignment) -> StoreResult<()> {
        let duplicate = self.snapshot.assignments.values().any(|r| {
            r.value.locker_id == assignment.locker_id || r.value.request_id == assignment.request_id
        });
        if duplicate {
            return Err(StoreError::Conflict(format!(
                "assignment for locker {} or request {} already exists",
                assignment.locker_id, assignment.request_id
            )));
        }
        self.touch(RowKey::Assignment(assignment.id));
        self.snapshot.assignments.insert(
            assignment.id,
            Row {
                version: 0,
                value: assignment.clone(),
            },
        );
        Ok(())
    }

    async fn delete_assignment(&mut self, id: AssignmentId) -> StoreResult<bool> {
        if !self.snapshot.assignments.contains_key(&id) {
            return Ok(false);
        }
        self.touch(RowKey::Assignment(id));
        self.snapshot.assignments.remove(&id);
        Ok(true)
    }

    async fn renewal(&mut self, id: RenewalId) -> StoreResult<Option<Renewal>> {
        Ok(self.snapshot.renewals.get(&id).map(|r| r.value.clone()))
    }

    async fn find_renewals(&mut self, query: &RenewalQuery) -> StoreResult<Vec<Renewal>> {
        let mut found: Vec<Renewal> = self
            .snapshot
            .renewals
            .values()
            .filter(|r| query.matches(&r.value))
            .map(|r| r.value.clone())
            .collect();
        found.sort_by_key(|r| (r.deadline, r.id));
        truncate(&mut found, query.limit);
        Ok(found)
    }

    async fn insert_renewal(&mut self, renewal: &Renewal) -> StoreResult<bool> {
        let exists = self.snapshot.renewals.values().any(|r| {
            r.value.assignment_id == renewal.assignment_id
                && r.value.school_year == renewal.school_year
        });
        if exists {
            return Ok(false);
        }
        self.touch(RowKey::Renewal(renewal.id));
        self.snapshot.renewals.insert(
            renewal.id,
            Row {
                version: 0,
                value: renewal.clone(),
            },
        );
        Ok(true)
    }

    async fn transition_renewal(
        &mut self,
        id: RenewalId,
        from: RenewalStatus,
        to: RenewalStatus,
    ) -> StoreResult<bool> {
        match self.snapshot.renewals.get(&id) {
            Some(row) if row.value.status == from => {}
            _ => return Ok(false),
        }
        self.touch(RowKey::Renewal(id));
        if let Some(row) = self.snapshot.renewals.get_mut(&id) {
            row.value.status = to;
        }
        Ok(true)
    }

    async fn enqueue_notification(&mut self, notification: &Notification) -> StoreResult<bool> {
        if let Some(key) = notification.dedupe_key.as_deref() {
            let queued = self.snapshot.has_dedupe_key(key)
                || self
                    .outbox
                    .iter()
                    .any(|n| n.dedupe_key.as_deref() == Some(key));
            if queued {
                return Ok(false);
            }
        }
        self.outbox.push(notification.clone());
        Ok(true)
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        tokio::task::yield_now().await;
        (*self).apply()
    }
}

fn truncate<T>(rows: &mut Vec<T>, limit: Option<i64>) {
    if let Some(limit) = limit {
        rows.truncate(usize::try_from(limit.max(0)).unwrap_or(usize::MAX));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::SchoolYear;
    use crate::model::NotificationTemplate;
    use spindit_events::NotificationStatus;
    use spindit_id::{NotificationId, UserId};

    fn notification(dedupe_key: &str) -> Notification {
        Notification {
            id: NotificationId::new(),
            recipient: UserId::new().to_string(),
            subject: NotificationTemplate::HoldCreated.subject().to_string(),
            template: NotificationTemplate::HoldCreated,
            payload: serde_json::json!({}),
            status: NotificationStatus::Pending,
            error: None,
            sent_at: None,
            dedupe_key: Some(dedupe_key.to_string()),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn seed_pool_numbers_across_zones() {
        let store = MemoryStore::new();
        let zones = store.seed_pool(&["A", "B"], 3);
        let lockers = store.lockers();

        assert_eq!(lockers.len(), 6);
        assert_eq!(
            lockers.iter().map(|l| l.number).collect::<Vec<_>>(),
            vec![1, 2, 3, 4, 5, 6]
        );
        assert_eq!(lockers[2].zone_id, zones[0]);
        assert_eq!(lockers[3].zone_id, zones[1]);
        assert!(lockers.iter().all(|l| l.status == LockerStatus::Free));
    }

    #[tokio::test]
    async fn first_committer_wins() {
        let store = MemoryStore::new();
        store.seed_pool(&["A"], 1);
        let locker = store.lockers()[0].clone();

        let mut first = store.begin().await.unwrap();
        let mut second = store.begin().await.unwrap();
        assert!(first
            .transition_locker(locker.id, LockerStatus::Free, LockerStatus::Reserved)
            .await
            .unwrap());
        assert!(second
            .transition_locker(locker.id, LockerStatus::Free, LockerStatus::Reserved)
            .await
            .unwrap());

        first.commit().await.unwrap();
        let err = second.commit().await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.locker(locker.id).unwrap().status, LockerStatus::Reserved);
    }

    #[tokio::test]
    async fn dropped_transaction_rolls_back() {
        let store = MemoryStore::new();
        store.seed_pool(&["A"], 1);
        let locker = store.lockers()[0].clone();

        {
            let mut tx = store.begin().await.unwrap();
            tx.transition_locker(locker.id, LockerStatus::Free, LockerStatus::Maintenance)
                .await
                .unwrap();
            tx.enqueue_notification(&notification("k")).await.unwrap();
        }

        assert_eq!(store.locker(locker.id).unwrap().status, LockerStatus::Free);
        assert!(store.notifications().is_empty());
    }

    #[tokio::test]
    async fn cas_misses_on_stale_status() {
        let store = MemoryStore::new();
        store.seed_pool(&["A"], 1);
        let locker = store.lockers()[0].clone();

        let mut tx = store.begin().await.unwrap();
        let moved = tx
            .transition_locker(locker.id, LockerStatus::Reserved, LockerStatus::Free)
            .await
            .unwrap();
        assert!(!moved);
        let missing = tx
            .transition_locker(LockerId::new(), LockerStatus::Free, LockerStatus::Reserved)
            .await
            .unwrap();
        assert!(!missing);
    }

    #[tokio::test]
    async fn assignments_are_unique_per_locker_across_transactions() {
        let store = MemoryStore::new();
        store.seed_pool(&["A"], 1);
        let locker = store.lockers()[0].clone();
        let now = Utc::now();

        let mut first = store.begin().await.unwrap();
        let mut second = store.begin().await.unwrap();
        first
            .insert_assignment(&Assignment::new(RequestId::new(), locker.id, now))
            .await
            .unwrap();
        second
            .insert_assignment(&Assignment::new(RequestId::new(), locker.id, now))
            .await
            .unwrap();

        first.commit().await.unwrap();
        assert!(second.commit().await.unwrap_err().is_conflict());
        assert_eq!(store.assignments().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_assignment_in_one_transaction_conflicts() {
        let store = MemoryStore::new();
        store.seed_pool(&["A"], 2);
        let lockers = store.lockers();
        let request_id = RequestId::new();
        let now = Utc::now();

        let mut tx = store.begin().await.unwrap();
        tx.insert_assignment(&Assignment::new(request_id, lockers[0].id, now))
            .await
            .unwrap();
        let err = tx
            .insert_assignment(&Assignment::new(request_id, lockers[1].id, now))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn renewals_are_unique_per_assignment_and_year() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let assignment = Assignment::new(RequestId::new(), LockerId::new(), now);
        let year = SchoolYear::starting(2025);

        let mut tx = store.begin().await.unwrap();
        assert!(tx
            .insert_renewal(&Renewal::pending(&assignment, year, now, now))
            .await
            .unwrap());
        assert!(!tx
            .insert_renewal(&Renewal::pending(&assignment, year, now, now))
            .await
            .unwrap());
        assert!(tx
            .insert_renewal(&Renewal::pending(&assignment, year.next(), now, now))
            .await
            .unwrap());
        tx.commit().await.unwrap();

        assert_eq!(store.renewals().len(), 2);
    }

    #[tokio::test]
    async fn dedupe_keys_hold_across_transactions() {
        let store = MemoryStore::new();

        let mut first = store.begin().await.unwrap();
        let mut second = store.begin().await.unwrap();
        assert!(first.enqueue_notification(&notification("hold:1")).await.unwrap());
        assert!(!first.enqueue_notification(&notification("hold:1")).await.unwrap());
        assert!(second.enqueue_notification(&notification("hold:1")).await.unwrap());

        first.commit().await.unwrap();
        second.commit().await.unwrap();
        assert_eq!(store.notifications().len(), 1);

        let mut third = store.begin().await.unwrap();
        assert!(!third.enqueue_notification(&notification("hold:1")).await.unwrap());
    }

    #[tokio::test]
    async fn external_edits_invalidate_open_transactions() {
        let store = MemoryStore::new();
        let request = store.insert_request(Request::new(
            UserId::new(),
            SchoolYear::starting(2025),
            Utc::now(),
        ));

        let mut tx = store.begin().await.unwrap();
        assert!(tx
            .transition_request(request.id, RequestStatus::Pending, RequestStatus::Reserved)
            .await
            .unwrap());

        store.set_request_status(request.id, RequestStatus::Cancelled);
        assert!(tx.commit().await.unwrap_err().is_conflict());
        assert_eq!(
            store.request(request.id).unwrap().status,
            RequestStatus::Cancelled
        );
    }
}
