//! Event envelope for outbox delivery.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use spindit_id::EventId;

use crate::LifecycleEvent;

/// A lifecycle event together with its outbox position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Monotonic outbox position; delivery resumes after the last one handled.
    #[serde(with = "event_id_serde")]
    pub event_id: EventId,

    /// When the underlying row change was committed.
    pub occurred_at: DateTime<Utc>,

    pub event: LifecycleEvent,
}

mod event_id_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use spindit_id::EventId;

    pub fn serialize<S: Serializer>(id: &EventId, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i64(id.value())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<EventId, D::Error> {
        i64::deserialize(d).map(EventId::new)
    }
}
