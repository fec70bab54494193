//! # spindit-events
//!
//! Shared vocabulary for the locker allocation engine.
//!
//! ## Status machines
//!
//! Every record with a lifecycle (locker, request, renewal, notification) has an
//! enumerated status and an explicit transition table. Writers check a
//! transition against the table before issuing the compare-and-set that applies
//! it, so an illegal move is a typed error instead of a silently stored string.
//!
//! ## Lifecycle events
//!
//! Request inserts and request status changes are surfaced as
//! [`LifecycleEvent`]s. The engine reacts to them with pure handler functions;
//! nothing here knows how events are delivered.

mod envelope;
mod error;
mod status;
mod types;

pub use envelope::*;
pub use error::{EventError, TransitionError};
pub use status::*;
pub use types::*;
