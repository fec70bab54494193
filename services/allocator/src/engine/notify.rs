//! Notification boundary.
//!
//! The engine only appends `pending` rows to the notification queue, inside the
//! transaction that caused them. Delivery belongs to an external worker.
//!
//! Every notification carries a dedupe key derived from the record it is about,
//! so a job that runs twice over the same state queues each message once.

use chrono::{DateTime, Utc};
use serde_json::json;
use spindit_events::NotificationStatus;
use spindit_id::{NotificationId, UserId};
use tracing::debug;

use super::EngineResult;
use crate::model::{Assignment, Locker, Notification, NotificationTemplate, Renewal};
use crate::store::PoolTx;

fn build(
    template: NotificationTemplate,
    recipient: UserId,
    payload: serde_json::Value,
    dedupe_key: String,
    now: DateTime<Utc>,
) -> Notification {
    Notification {
        id: NotificationId::new(),
        recipient: recipient.to_string(),
        subject: template.subject().to_string(),
        template,
        payload,
        status: NotificationStatus::Pending,
        error: None,
        sent_at: None,
        dedupe_key: Some(dedupe_key),
        created_at: now,
    }
}

pub fn hold_created(
    recipient: UserId,
    assignment: &Assignment,
    locker: &Locker,
    expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Notification {
    build(
        NotificationTemplate::HoldCreated,
        recipient,
        json!({
            "request_id": assignment.request_id,
            "assignment_id": assignment.id,
            "locker_id": locker.id,
            "locker_number": locker.number,
            "expires_at": expires_at,
        }),
        format!("hold_created:{}", assignment.id),
        now,
    )
}

pub fn hold_expiring(
    recipient: UserId,
    assignment: &Assignment,
    expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Notification {
    build(
        NotificationTemplate::HoldExpiring,
        recipient,
        json!({
            "request_id": assignment.request_id,
            "assignment_id": assignment.id,
            "locker_id": assignment.locker_id,
            "expires_at": expires_at,
        }),
        format!("hold_expiring:{}", assignment.id),
        now,
    )
}

pub fn hold_expired(recipient: UserId, assignment: &Assignment, now: DateTime<Utc>) -> Notification {
    build(
        NotificationTemplate::HoldExpired,
        recipient,
        json!({
            "request_id": assignment.request_id,
            "assignment_id": assignment.id,
            "locker_id": assignment.locker_id,
        }),
        format!("hold_expired:{}", assignment.id),
        now,
    )
}

fn renewal_payload(renewal: &Renewal) -> serde_json::Value {
    json!({
        "renewal_id": renewal.id,
        "request_id": renewal.request_id,
        "locker_id": renewal.locker_id,
        "school_year": renewal.school_year,
        "deadline": renewal.deadline,
    })
}

pub fn renewal_opened(recipient: UserId, renewal: &Renewal, now: DateTime<Utc>) -> Notification {
    build(
        NotificationTemplate::RenewalOpened,
        recipient,
        renewal_payload(renewal),
        format!("renewal_opened:{}", renewal.id),
        now,
    )
}

pub fn renewal_deadline(recipient: UserId, renewal: &Renewal, now: DateTime<Utc>) -> Notification {
    build(
        NotificationTemplate::RenewalDeadline,
        recipient,
        renewal_payload(renewal),
        format!("renewal_deadline:{}", renewal.id),
        now,
    )
}

pub fn renewal_expired(recipient: UserId, renewal: &Renewal, now: DateTime<Utc>) -> Notification {
    build(
        NotificationTemplate::RenewalExpired,
        recipient,
        renewal_payload(renewal),
        format!("renewal_expired:{}", renewal.id),
        now,
    )
}

/// Queues `notification` unless its dedupe key was already used.
pub(crate) async fn enqueue(tx: &mut dyn PoolTx, notification: Notification) -> EngineResult<bool> {
    let queued = tx.enqueue_notification(&notification).await?;
    if queued {
        debug!(
            template = %notification.template,
            recipient = %notification.recipient,
            "notification queued"
        );
    }
    Ok(queued)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::SchoolYear;
    use spindit_id::{LockerId, RequestId, ZoneId};

    #[test]
    fn hold_notices_share_the_assignment_in_their_keys() {
        let now = Utc::now();
        let user = UserId::new();
        let locker = Locker::new(ZoneId::new(), 42);
        let assignment = Assignment::new(RequestId::new(), locker.id, now);

        let created = hold_created(user, &assignment, &locker, now, now);
        let expiring = hold_expiring(user, &assignment, now, now);

        assert_eq!(created.recipient, user.to_string());
        assert_eq!(created.status, NotificationStatus::Pending);
        assert_eq!(created.payload["locker_number"], 42);
        assert_eq!(
            created.dedupe_key.as_deref(),
            Some(format!("hold_created:{}", assignment.id).as_str())
        );
        assert_ne!(created.dedupe_key, expiring.dedupe_key);
        assert_eq!(expiring.subject, NotificationTemplate::HoldExpiring.subject());
    }

    #[test]
    fn renewal_payload_carries_the_school_year_label() {
        let now = Utc::now();
        let assignment = Assignment::new(RequestId::new(), LockerId::new(), now);
        let renewal = Renewal::pending(&assignment, SchoolYear::starting(2025), now, now);

        let notice = renewal_opened(UserId::new(), &renewal, now);
        assert_eq!(notice.payload["school_year"], "2025/26");
        assert_eq!(notice.template, NotificationTemplate::RenewalOpened);
    }
}
