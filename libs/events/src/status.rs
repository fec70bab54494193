//! Status enums and their transition tables.

use serde::{Deserialize, Serialize};

use crate::{EventError, TransitionError};

/// A status with an explicit transition table.
pub trait StatusMachine: Copy + Eq + std::fmt::Debug + 'static {
    /// Entity name used in error messages.
    const ENTITY: &'static str;

    fn as_str(self) -> &'static str;

    /// Whether the table allows `self -> next`. Staying put is never a transition.
    fn can_transition_to(self, next: Self) -> bool;

    /// Returns `next` if the move is allowed.
    fn check_transition(self, next: Self) -> Result<Self, TransitionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(TransitionError {
                entity: Self::ENTITY,
                from: self.as_str(),
                to: next.as_str(),
            })
        }
    }
}

macro_rules! status_names {
    ($name:ident, $entity:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub const fn name(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.name())
            }
        }

        impl std::str::FromStr for $name {
            type Err = EventError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(EventError::UnknownStatus {
                        entity: $entity,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

/// Physical state of a locker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockerStatus {
    Free,
    Reserved,
    Occupied,
    /// Out of the pool until staff reset it.
    Maintenance,
}

status_names!(LockerStatus, "locker", {
    Free => "free",
    Reserved => "reserved",
    Occupied => "occupied",
    Maintenance => "maintenance",
});

impl LockerStatus {
    /// Statuses that mean "held by an assignment".
    pub fn is_held(self) -> bool {
        matches!(self, LockerStatus::Reserved | LockerStatus::Occupied)
    }
}

impl StatusMachine for LockerStatus {
    const ENTITY: &'static str = "locker";

    fn as_str(self) -> &'static str {
        self.name()
    }

    fn can_transition_to(self, next: Self) -> bool {
        use LockerStatus::*;
        match (self, next) {
            (Free, Reserved) | (Free, Maintenance) => true,
            (Reserved, Occupied) | (Reserved, Free) | (Reserved, Maintenance) => true,
            (Occupied, Free) | (Occupied, Maintenance) => true,
            (Maintenance, Free) => true,
            (Free, Free) | (Free, Occupied) => false,
            (Reserved, Reserved) => false,
            (Occupied, Reserved) | (Occupied, Occupied) => false,
            (Maintenance, Reserved) | (Maintenance, Occupied) | (Maintenance, Maintenance) => false,
        }
    }
}

/// Lifecycle of a locker request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Submitted, no locker held.
    Pending,
    /// Holding a locker that has not been confirmed yet.
    Reserved,
    /// Hold confirmed.
    Assigned,
    Expired,
    Cancelled,
}

status_names!(RequestStatus, "request", {
    Pending => "pending",
    Reserved => "reserved",
    Assigned => "assigned",
    Expired => "expired",
    Cancelled => "cancelled",
});

impl StatusMachine for RequestStatus {
    const ENTITY: &'static str = "request";

    fn as_str(self) -> &'static str {
        self.name()
    }

    fn can_transition_to(self, next: Self) -> bool {
        use RequestStatus::*;
        match (self, next) {
            (Pending, Reserved) | (Pending, Cancelled) => true,
            (Reserved, Assigned) | (Reserved, Expired) | (Reserved, Cancelled) => true,
            (Assigned, Expired) | (Assigned, Cancelled) => true,
            (Expired, Cancelled) => true,
            (Pending, Pending) | (Pending, Assigned) | (Pending, Expired) => false,
            (Reserved, Pending) | (Reserved, Reserved) => false,
            (Assigned, Pending) | (Assigned, Reserved) | (Assigned, Assigned) => false,
            (Expired, Pending) | (Expired, Reserved) | (Expired, Assigned) | (Expired, Expired) => {
                false
            }
            (Cancelled, Pending)
            | (Cancelled, Reserved)
            | (Cancelled, Assigned)
            | (Cancelled, Expired)
            | (Cancelled, Cancelled) => false,
        }
    }
}

/// Lifecycle of a per-school-year renewal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenewalStatus {
    Pending,
    Confirmed,
    Expired,
    Cancelled,
}

status_names!(RenewalStatus, "renewal", {
    Pending => "pending",
    Confirmed => "confirmed",
    Expired => "expired",
    Cancelled => "cancelled",
});

impl StatusMachine for RenewalStatus {
    const ENTITY: &'static str = "renewal";

    fn as_str(self) -> &'static str {
        self.name()
    }

    fn can_transition_to(self, next: Self) -> bool {
        use RenewalStatus::*;
        match (self, next) {
            (Pending, Confirmed) | (Pending, Expired) | (Pending, Cancelled) => true,
            (Confirmed, Cancelled) => true,
            (Pending, Pending) => false,
            (Confirmed, Pending) | (Confirmed, Confirmed) | (Confirmed, Expired) => false,
            (Expired, Pending) | (Expired, Confirmed) | (Expired, Expired) | (Expired, Cancelled) => {
                false
            }
            (Cancelled, Pending)
            | (Cancelled, Confirmed)
            | (Cancelled, Expired)
            | (Cancelled, Cancelled) => false,
        }
    }
}

/// Delivery state of a queued notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    Sending,
    Sent,
    Failed,
}

status_names!(NotificationStatus, "notification", {
    Pending => "pending",
    Sending => "sending",
    Sent => "sent",
    Failed => "failed",
});

impl StatusMachine for NotificationStatus {
    const ENTITY: &'static str = "notification";

    fn as_str(self) -> &'static str {
        self.name()
    }

    fn can_transition_to(self, next: Self) -> bool {
        use NotificationStatus::*;
        match (self, next) {
            (Pending, Sending) | (Pending, Failed) => true,
            (Sending, Sent) | (Sending, Failed) => true,
            (Failed, Pending) => true,
            (Pending, Pending) | (Pending, Sent) => false,
            (Sending, Pending) | (Sending, Sending) => false,
            (Sent, Pending) | (Sent, Sending) | (Sent, Sent) | (Sent, Failed) => false,
            (Failed, Sending) | (Failed, Sent) | (Failed, Failed) => false,
        }
    }
}
