//! Typed query builders.
//!
//! Each builder is plain data. [`PgStore`](super::PgStore) renders it into a
//! parameterized `sqlx::QueryBuilder`; [`MemoryStore`](super::MemoryStore)
//! evaluates it with `matches`. Both apply the same ordering.

use chrono::{DateTime, Utc};
use spindit_events::{LockerStatus, RenewalStatus, RequestStatus, StatusMachine};
use spindit_id::{AssignmentId, LockerId, ZoneId};
use sqlx::{Postgres, QueryBuilder};

use crate::calendar::SchoolYear;
use crate::model::{Assignment, Locker, Renewal, Request};

/// Lockers, ordered by display number then id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockerQuery {
    pub status: Option<LockerStatus>,
    pub zone_id: Option<ZoneId>,
    pub number: Option<i32>,
    pub excluding: Vec<LockerId>,
    pub limit: Option<i64>,
}

impl LockerQuery {
    pub fn free() -> Self {
        Self {
            status: Some(LockerStatus::Free),
            ..Self::default()
        }
    }

    pub fn in_zone(mut self, zone_id: ZoneId) -> Self {
        self.zone_id = Some(zone_id);
        self
    }

    pub fn numbered(mut self, number: i32) -> Self {
        self.number = Some(number);
        self
    }

    pub fn excluding<I>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = LockerId>,
    {
        self.excluding.extend(ids);
        self
    }

    /// Only the lowest-numbered match.
    pub fn first(mut self) -> Self {
        self.limit = Some(1);
        self
    }

    pub fn matches(&self, locker: &Locker) -> bool {
        self.status.is_none_or(|s| locker.status == s)
            && self.zone_id.is_none_or(|z| locker.zone_id == z)
            && self.number.is_none_or(|n| locker.number == n)
            && !self.excluding.contains(&locker.id)
    }

    pub(crate) fn build(&self) -> QueryBuilder<'static, Postgres> {
        let mut qb = QueryBuilder::new(
            "SELECT id, zone_id, number, status, note FROM lockers WHERE TRUE",
        );
        if let Some(status) = self.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(zone_id) = self.zone_id {
            qb.push(" AND zone_id = ").push_bind(zone_id.to_string());
        }
        if let Some(number) = self.number {
            qb.push(" AND number = ").push_bind(number);
        }
        if !self.excluding.is_empty() {
            let ids: Vec<String> = self.excluding.iter().map(ToString::to_string).collect();
            qb.push(" AND id <> ALL(").push_bind(ids).push(")");
        }
        qb.push(" ORDER BY number ASC, id ASC");
        push_limit(&mut qb, self.limit);
        qb
    }
}

/// Assignments joined with their request, oldest first.
///
/// Assignments whose request row is gone never match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssignmentQuery {
    pub request_status: Option<RequestStatus>,
    /// Strictly earlier than this instant.
    pub created_before: Option<DateTime<Utc>>,
    /// The request was made for a school year before this one.
    pub requested_before: Option<SchoolYear>,
    pub lacking_renewal_for: Option<SchoolYear>,
    pub limit: Option<i64>,
}

impl AssignmentQuery {
    pub fn all() -> Self {
        Self::default()
    }

    /// Unconfirmed holds.
    pub fn holds() -> Self {
        Self::with_request_status(RequestStatus::Reserved)
    }

    pub fn with_request_status(status: RequestStatus) -> Self {
        Self {
            request_status: Some(status),
            ..Self::default()
        }
    }

    pub fn created_before(mut self, cutoff: DateTime<Utc>) -> Self {
        self.created_before = Some(cutoff);
        self
    }

    pub fn requested_before(mut self, year: SchoolYear) -> Self {
        self.requested_before = Some(year);
        self
    }

    pub fn lacking_renewal_for(mut self, year: SchoolYear) -> Self {
        self.lacking_renewal_for = Some(year);
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// `has_renewal` answers whether the assignment already has a renewal for
    /// the given school year.
    pub fn matches<F>(&self, assignment: &Assignment, request: &Request, has_renewal: F) -> bool
    where
        F: Fn(SchoolYear) -> bool,
    {
        self.request_status.is_none_or(|s| request.status == s)
            && self.created_before.is_none_or(|c| assignment.created_at < c)
            && self.requested_before.is_none_or(|y| request.school_year < y)
            && self.lacking_renewal_for.is_none_or(|year| !has_renewal(year))
    }

    pub(crate) fn build(&self) -> QueryBuilder<'static, Postgres> {
        let mut qb = QueryBuilder::new(
            "SELECT a.id, a.request_id, a.locker_id, a.created_at \
             FROM assignments a JOIN requests r ON r.id = a.request_id WHERE TRUE",
        );
        if let Some(status) = self.request_status {
            qb.push(" AND r.status = ").push_bind(status.as_str());
        }
        if let Some(cutoff) = self.created_before {
            qb.push(" AND a.created_at < ").push_bind(cutoff);
        }
        if let Some(year) = self.requested_before {
            // Labels are zero-padded `YYYY/YY`, so text order is year order.
            qb.push(" AND r.school_year < ").push_bind(year.to_string());
        }
        if let Some(year) = self.lacking_renewal_for {
            qb.push(
                " AND NOT EXISTS (SELECT 1 FROM renewals n \
                 WHERE n.assignment_id = a.id AND n.school_year = ",
            )
            .push_bind(year.to_string())
            .push(")");
        }
        qb.push(" ORDER BY a.created_at ASC, a.id ASC");
        push_limit(&mut qb, self.limit);
        qb
    }
}

/// Renewals, earliest deadline first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenewalQuery {
    pub status: Option<RenewalStatus>,
    pub school_year: Option<SchoolYear>,
    /// Strictly earlier than this instant.
    pub deadline_before: Option<DateTime<Utc>>,
    /// Strictly later than this instant.
    pub deadline_after: Option<DateTime<Utc>>,
    pub assignment_id: Option<AssignmentId>,
    pub limit: Option<i64>,
}

impl RenewalQuery {
    pub fn with_status(status: RenewalStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn for_assignment(assignment_id: AssignmentId) -> Self {
        Self {
            assignment_id: Some(assignment_id),
            ..Self::default()
        }
    }

    pub fn school_year(mut self, year: SchoolYear) -> Self {
        self.school_year = Some(year);
        self
    }

    pub fn deadline_before(mut self, at: DateTime<Utc>) -> Self {
        self.deadline_before = Some(at);
        self
    }

    pub fn deadline_after(mut self, at: DateTime<Utc>) -> Self {
        self.deadline_after = Some(at);
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, renewal: &Renewal) -> bool {
        self.status.is_none_or(|s| renewal.status == s)
            && self.school_year.is_none_or(|y| renewal.school_year == y)
            && self.deadline_before.is_none_or(|d| renewal.deadline < d)
            && self.deadline_after.is_none_or(|d| renewal.deadline > d)
            && self.assignment_id.is_none_or(|a| renewal.assignment_id == a)
    }

    pub(crate) fn build(&self) -> QueryBuilder<'static, Postgres> {
        let mut qb = QueryBuilder::new(
            "SELECT id, assignment_id, request_id, locker_id, school_year, status, \
             deadline, confirmed_at, created_at FROM renewals WHERE TRUE",
        );
        if let Some(status) = self.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(year) = self.school_year {
            qb.push(" AND school_year = ").push_bind(year.to_string());
        }
        if let Some(at) = self.deadline_before {
            qb.push(" AND deadline < ").push_bind(at);
        }
        if let Some(at) = self.deadline_after {
            qb.push(" AND deadline > ").push_bind(at);
        }
        if let Some(assignment_id) = self.assignment_id {
            qb.push(" AND assignment_id = ").push_bind(assignment_id.to_string());
        }
        qb.push(" ORDER BY deadline ASC, id ASC");
        push_limit(&mut qb, self.limit);
        qb
    }
}

fn push_limit(qb: &mut QueryBuilder<'static, Postgres>, limit: Option<i64>) {
    if let Some(limit) = limit {
        qb.push(" LIMIT ").push_bind(limit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use spindit_id::{RequestId, UserId};

    #[test]
    fn locker_query_renders_bound_parameters() {
        let zone = ZoneId::new();
        let query = LockerQuery::free()
            .in_zone(zone)
            .excluding([LockerId::new()])
            .first();
        let sql = query.build().into_sql();
        assert_eq!(
            sql,
            "SELECT id, zone_id, number, status, note FROM lockers WHERE TRUE \
             AND status = $1 AND zone_id = $2 AND id <> ALL($3) \
             ORDER BY number ASC, id ASC LIMIT $4"
        );
    }

    #[test]
    fn locker_query_matches_in_memory() {
        let zone = ZoneId::new();
        let locker = Locker::new(zone, 42);

        assert!(LockerQuery::free().matches(&locker));
        assert!(LockerQuery::free().numbered(42).in_zone(zone).matches(&locker));
        assert!(!LockerQuery::free().numbered(41).matches(&locker));
        assert!(!LockerQuery::free().in_zone(ZoneId::new()).matches(&locker));
        assert!(!LockerQuery::free().excluding([locker.id]).matches(&locker));

        let taken = locker.with_status(LockerStatus::Reserved);
        assert!(!LockerQuery::free().matches(&taken));
        assert!(LockerQuery::default().matches(&taken));
    }

    fn request_in(year: SchoolYear, status: RequestStatus) -> Request {
        let mut request = Request::new(UserId::new(), year, Utc::now());
        request.status = status;
        request
    }

    #[test]
    fn assignment_query_cutoff_is_strict() {
        let now = Utc::now();
        let year = SchoolYear::starting(2025);
        let reserved = request_in(year, RequestStatus::Reserved);
        let assignment = Assignment::new(reserved.id, LockerId::new(), now);
        let no_renewals = |_: SchoolYear| false;

        let at_cutoff = AssignmentQuery::holds().created_before(now);
        assert!(!at_cutoff.matches(&assignment, &reserved, no_renewals));

        let past_cutoff = AssignmentQuery::holds().created_before(now + Duration::seconds(1));
        assert!(past_cutoff.matches(&assignment, &reserved, no_renewals));
        let confirmed = request_in(year, RequestStatus::Assigned);
        assert!(!past_cutoff.matches(&assignment, &confirmed, no_renewals));
    }

    #[test]
    fn assignment_query_filters_on_existing_renewals() {
        let now = Utc::now();
        let year = SchoolYear::starting(2025);
        let request = request_in(year.next(), RequestStatus::Assigned);
        let assignment = Assignment::new(request.id, LockerId::new(), now);
        let query = AssignmentQuery::all().lacking_renewal_for(year);

        assert!(query.matches(&assignment, &request, |_| false));
        assert!(!query.matches(&assignment, &request, |y| y == year));
        assert!(query.matches(&assignment, &request, |y| y == year.next()));

        let sql = query.build().into_sql();
        assert!(sql.contains("NOT EXISTS"));
        assert!(sql.ends_with("ORDER BY a.created_at ASC, a.id ASC"));
    }

    #[test]
    fn assignment_query_skips_requests_for_the_target_year() {
        let now = Utc::now();
        let upcoming = SchoolYear::starting(2025);
        let query = AssignmentQuery::with_request_status(RequestStatus::Assigned)
            .requested_before(upcoming)
            .lacking_renewal_for(upcoming);

        let old = request_in(SchoolYear::starting(2024), RequestStatus::Assigned);
        let fresh = request_in(upcoming, RequestStatus::Assigned);
        let old_assignment = Assignment::new(old.id, LockerId::new(), now);
        let fresh_assignment = Assignment::new(fresh.id, LockerId::new(), now);

        assert!(query.matches(&old_assignment, &old, |_| false));
        assert!(!query.matches(&fresh_assignment, &fresh, |_| false));
    }

    #[test]
    fn renewal_query_deadline_window() {
        let now = Utc::now();
        let assignment = Assignment::new(RequestId::new(), LockerId::new(), now);
        let renewal = Renewal::pending(&assignment, SchoolYear::starting(2025), now, now);

        let window = RenewalQuery::with_status(RenewalStatus::Pending)
            .deadline_after(now - Duration::hours(1))
            .deadline_before(now + Duration::hours(1));
        assert!(window.matches(&renewal));

        assert!(!RenewalQuery::with_status(RenewalStatus::Pending)
            .deadline_before(now)
            .matches(&renewal));
        assert!(!RenewalQuery::with_status(RenewalStatus::Confirmed).matches(&renewal));
        assert!(RenewalQuery::for_assignment(assignment.id).matches(&renewal));
    }
}
