//! Error types for statuses and events.

use thiserror::Error;

/// A status change that the entity's transition table forbids.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("illegal {entity} transition: {from} -> {to}")]
pub struct TransitionError {
    pub entity: &'static str,
    pub from: &'static str,
    pub to: &'static str,
}

/// Errors decoding stored statuses and events.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error("unknown {entity} status: {value}")]
    UnknownStatus { entity: &'static str, value: String },

    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    #[error("invalid event payload: {0}")]
    InvalidPayload(String),
}
