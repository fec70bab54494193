//! Records the engine reads and writes.
//!
//! These mirror the store's tables one-to-one. Status fields are the typed
//! enums from `spindit-events`; IDs are the typed IDs from `spindit-id`.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use spindit_events::{LockerStatus, NotificationStatus, RenewalStatus, RequestStatus};
use spindit_id::{AssignmentId, LockerId, NotificationId, RenewalId, RequestId, UserId, ZoneId};

use crate::calendar::SchoolYear;
use crate::clock::later;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Locker {
    pub id: LockerId,
    pub zone_id: ZoneId,
    /// Display number, unique across the pool.
    pub number: i32,
    pub status: LockerStatus,
    pub note: Option<String>,
}

impl Locker {
    pub fn new(zone_id: ZoneId, number: i32) -> Self {
        Self {
            id: LockerId::new(),
            zone_id,
            number,
            status: LockerStatus::Free,
            note: None,
        }
    }

    pub fn with_status(mut self, status: LockerStatus) -> Self {
        self.status = status;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub user_id: UserId,
    pub school_year: SchoolYear,
    /// Free text: a locker ID or a display number. Anything else is ignored.
    pub preferred_locker: Option<String>,
    /// Free text zone ID. Unparseable values are ignored.
    pub preferred_zone: Option<String>,
    pub status: RequestStatus,
    pub submitted_at: DateTime<Utc>,
}

impl Request {
    pub fn new(user_id: UserId, school_year: SchoolYear, submitted_at: DateTime<Utc>) -> Self {
        Self {
            id: RequestId::new(),
            user_id,
            school_year,
            preferred_locker: None,
            preferred_zone: None,
            status: RequestStatus::Pending,
            submitted_at,
        }
    }

    pub fn preferring_locker(mut self, raw: impl Into<String>) -> Self {
        self.preferred_locker = Some(raw.into());
        self
    }

    pub fn preferring_zone(mut self, raw: impl Into<String>) -> Self {
        self.preferred_zone = Some(raw.into());
        self
    }

    pub fn locker_preference(&self) -> Option<LockerPreference> {
        self.preferred_locker.as_deref().and_then(LockerPreference::parse)
    }

    pub fn zone_preference(&self) -> Option<ZoneId> {
        self.preferred_zone
            .as_deref()
            .map(str::trim)
            .filter(|raw| !raw.is_empty())
            .and_then(|raw| raw.parse().ok())
    }
}

/// A parsed `preferred_locker` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockerPreference {
    Id(LockerId),
    Number(i32),
}

impl LockerPreference {
    /// Malformed input yields `None` rather than an error: a bad preference
    /// must never block a request.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        if let Ok(id) = LockerId::parse(raw) {
            return Some(LockerPreference::Id(id));
        }
        match raw.parse::<i32>() {
            Ok(number) if number > 0 => Some(LockerPreference::Number(number)),
            _ => None,
        }
    }
}

/// Binding of one request to one locker. While it exists the locker is not free.
///
/// An assignment whose request is still `reserved` is a hold and expires
/// `hold_duration` after `created_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub id: AssignmentId,
    pub request_id: RequestId,
    pub locker_id: LockerId,
    pub created_at: DateTime<Utc>,
}

impl Assignment {
    pub fn new(request_id: RequestId, locker_id: LockerId, created_at: DateTime<Utc>) -> Self {
        Self {
            id: AssignmentId::new(),
            request_id,
            locker_id,
            created_at,
        }
    }

    pub fn hold_deadline(&self, hold: Duration) -> DateTime<Utc> {
        later(self.created_at, hold)
    }

    /// Strictly older than `hold`. A hold exactly `hold` old is still valid.
    pub fn is_stale(&self, now: DateTime<Utc>, hold: Duration) -> bool {
        now > self.hold_deadline(hold)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Renewal {
    pub id: RenewalId,
    pub assignment_id: AssignmentId,
    pub request_id: RequestId,
    pub locker_id: LockerId,
    pub school_year: SchoolYear,
    pub status: RenewalStatus,
    pub deadline: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Renewal {
    pub fn pending(
        assignment: &Assignment,
        school_year: SchoolYear,
        deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: RenewalId::new(),
            assignment_id: assignment.id,
            request_id: assignment.request_id,
            locker_id: assignment.locker_id,
            school_year,
            status: RenewalStatus::Pending,
            deadline,
            confirmed_at: None,
            created_at: now,
        }
    }
}

/// Message kinds the engine queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationTemplate {
    HoldCreated,
    HoldExpiring,
    HoldExpired,
    RenewalOpened,
    RenewalDeadline,
    RenewalExpired,
}

impl NotificationTemplate {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationTemplate::HoldCreated => "hold_created",
            NotificationTemplate::HoldExpiring => "hold_expiring",
            NotificationTemplate::HoldExpired => "hold_expired",
            NotificationTemplate::RenewalOpened => "renewal_opened",
            NotificationTemplate::RenewalDeadline => "renewal_deadline",
            NotificationTemplate::RenewalExpired => "renewal_expired",
        }
    }

    pub fn subject(self) -> &'static str {
        match self {
            NotificationTemplate::HoldCreated => "Your locker is reserved",
            NotificationTemplate::HoldExpiring => "Your locker reservation is about to expire",
            NotificationTemplate::HoldExpired => "Your locker reservation has expired",
            NotificationTemplate::RenewalOpened => "Renew your locker for the next school year",
            NotificationTemplate::RenewalDeadline => "Locker renewal deadline approaching",
            NotificationTemplate::RenewalExpired => "Your locker was not renewed",
        }
    }
}

impl std::fmt::Display for NotificationTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NotificationTemplate {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hold_created" => Ok(NotificationTemplate::HoldCreated),
            "hold_expiring" => Ok(NotificationTemplate::HoldExpiring),
            "hold_expired" => Ok(NotificationTemplate::HoldExpired),
            "renewal_opened" => Ok(NotificationTemplate::RenewalOpened),
            "renewal_deadline" => Ok(NotificationTemplate::RenewalDeadline),
            "renewal_expired" => Ok(NotificationTemplate::RenewalExpired),
            other => Err(format!("unknown notification template: {other}")),
        }
    }
}

/// A row in the outbound notification queue.
///
/// The engine only ever appends `pending` rows; delivery workers own every
/// later status change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    pub recipient: String,
    pub subject: String,
    pub template: NotificationTemplate,
    pub payload: serde_json::Value,
    pub status: NotificationStatus,
    pub error: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    /// At most one notification per key is ever queued.
    pub dedupe_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("42", Some(LockerPreference::Number(42)))]
    #[case("  7 ", Some(LockerPreference::Number(7)))]
    #[case("0", None)]
    #[case("-3", None)]
    #[case("forty-two", None)]
    #[case("", None)]
    #[case("req_01HV4Z2WQXKJNM8GPQY6VBKC3D", None)]
    fn locker_preference_parsing(#[case] raw: &str, #[case] expected: Option<LockerPreference>) {
        assert_eq!(LockerPreference::parse(raw), expected);
    }

    #[test]
    fn locker_preference_accepts_ids() {
        let id = LockerId::new();
        assert_eq!(
            LockerPreference::parse(&id.to_string()),
            Some(LockerPreference::Id(id))
        );
    }

    #[test]
    fn zone_preference_ignores_garbage() {
        let now = Utc::now();
        let year = SchoolYear::starting(2025);
        let request = Request::new(UserId::new(), year, now).preferring_zone("Zone B");
        assert_eq!(request.zone_preference(), None);

        let zone = ZoneId::new();
        let request = Request::new(UserId::new(), year, now).preferring_zone(zone.to_string());
        assert_eq!(request.zone_preference(), Some(zone));
    }

    #[test]
    fn hold_staleness_is_strict() {
        let created = Utc::now();
        let hold = Duration::hours(48);
        let assignment = Assignment::new(RequestId::new(), LockerId::new(), created);
        assert!(!assignment.is_stale(created + hold, hold));
        assert!(assignment.is_stale(created + hold + Duration::seconds(1), hold));
        assert_eq!(assignment.hold_deadline(hold), created + hold);
    }

    #[test]
    fn template_names_parse_back() {
        for template in [
            NotificationTemplate::HoldCreated,
            NotificationTemplate::HoldExpiring,
            NotificationTemplate::HoldExpired,
            NotificationTemplate::RenewalOpened,
            NotificationTemplate::RenewalDeadline,
            NotificationTemplate::RenewalExpired,
        ] {
            assert_eq!(template.as_str().parse::<NotificationTemplate>(), Ok(template));
            assert!(!template.subject().is_empty());
        }
    }
}
