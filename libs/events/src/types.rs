//! Lifecycle events raised by request records.

use serde::{Deserialize, Serialize};
use spindit_id::RequestId;

use crate::{EventError, RequestStatus};

/// Event type names as stored in the request event outbox.
pub mod event_types {
    pub const REQUEST_CREATED: &str = "request.created";
    pub const REQUEST_STATUS_CHANGED: &str = "request.status_changed";
}

/// Something happened to a request that the engine may need to react to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    RequestCreated {
        request_id: RequestId,
    },
    RequestStatusChanged {
        request_id: RequestId,
        /// Status before the change; `None` when the writer did not record it.
        from: Option<RequestStatus>,
        to: RequestStatus,
    },
}

impl LifecycleEvent {
    pub fn request_id(&self) -> RequestId {
        match self {
            LifecycleEvent::RequestCreated { request_id }
            | LifecycleEvent::RequestStatusChanged { request_id, .. } => *request_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            LifecycleEvent::RequestCreated { .. } => event_types::REQUEST_CREATED,
            LifecycleEvent::RequestStatusChanged { .. } => event_types::REQUEST_STATUS_CHANGED,
        }
    }

    /// True only for a move *into* `cancelled`. Re-saving an already
    /// cancelled request is not a cancellation.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            LifecycleEvent::RequestStatusChanged {
                from,
                to: RequestStatus::Cancelled,
                ..
            } if *from != Some(RequestStatus::Cancelled)
        )
    }

    /// True for the confirmation of a hold (`reserved -> assigned`).
    pub fn is_confirmation(&self) -> bool {
        matches!(
            self,
            LifecycleEvent::RequestStatusChanged {
                from: Some(RequestStatus::Reserved),
                to: RequestStatus::Assigned,
                ..
            }
        )
    }

    /// Rebuilds an event from its outbox columns.
    pub fn from_parts(
        event_type: &str,
        request_id: &str,
        from: Option<&str>,
        to: Option<&str>,
    ) -> Result<Self, EventError> {
        let request_id = RequestId::parse(request_id)
            .map_err(|e| EventError::InvalidPayload(format!("request_id: {e}")))?;

        match event_type {
            event_types::REQUEST_CREATED => Ok(LifecycleEvent::RequestCreated { request_id }),
            event_types::REQUEST_STATUS_CHANGED => {
                let to: RequestStatus = to
                    .ok_or_else(|| EventError::InvalidPayload("missing new status".to_string()))?
                    .parse()?;
                let from: Option<RequestStatus> =
                    from.map(str::parse::<RequestStatus>).transpose()?;
                Ok(LifecycleEvent::RequestStatusChanged {
                    request_id,
                    from,
                    to,
                })
            }
            other => Err(EventError::UnknownEventType(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn changed(from: Option<RequestStatus>, to: RequestStatus) -> LifecycleEvent {
        LifecycleEvent::RequestStatusChanged {
            request_id: RequestId::new(),
            from,
            to,
        }
    }

    #[test]
    fn cancellation_requires_a_transition() {
        assert!(changed(Some(RequestStatus::Reserved), RequestStatus::Cancelled).is_cancellation());
        assert!(changed(None, RequestStatus::Cancelled).is_cancellation());
        assert!(!changed(Some(RequestStatus::Cancelled), RequestStatus::Cancelled).is_cancellation());
        assert!(!changed(Some(RequestStatus::Pending), RequestStatus::Reserved).is_cancellation());
    }

    #[test]
    fn confirmation_is_reserved_to_assigned() {
        assert!(changed(Some(RequestStatus::Reserved), RequestStatus::Assigned).is_confirmation());
        assert!(!changed(None, RequestStatus::Assigned).is_confirmation());
    }

    #[test]
    fn from_parts_decodes_outbox_rows() {
        let id = RequestId::new();
        let event = LifecycleEvent::from_parts(
            "request.status_changed",
            &id.to_string(),
            Some("reserved"),
            Some("cancelled"),
        )
        .unwrap();
        assert_eq!(event.request_id(), id);
        assert!(event.is_cancellation());

        let created =
            LifecycleEvent::from_parts("request.created", &id.to_string(), None, Some("pending"))
                .unwrap();
        assert_eq!(created.event_type(), event_types::REQUEST_CREATED);
    }

    #[test]
    fn from_parts_rejects_garbage() {
        let id = RequestId::new().to_string();
        assert!(matches!(
            LifecycleEvent::from_parts("request.deleted", &id, None, None),
            Err(EventError::UnknownEventType(_))
        ));
        assert!(matches!(
            LifecycleEvent::from_parts("request.status_changed", &id, None, Some("lost")),
            Err(EventError::UnknownStatus { .. })
        ));
        assert!(LifecycleEvent::from_parts("request.created", "lkr_x", None, None).is_err());
    }
}
