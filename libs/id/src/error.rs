//! ID parsing errors.

use thiserror::Error;

/// Reasons a string is not a valid typed ID.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("ID cannot be empty")]
    Empty,

    #[error("ID missing underscore separator")]
    MissingSeparator,

    #[error("invalid ID prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    #[error("invalid ULID: {0}")]
    InvalidUlid(String),
}

impl IdError {
    /// True when the input was shaped like an ID of another kind.
    pub fn is_prefix_error(&self) -> bool {
        matches!(self, IdError::InvalidPrefix { .. })
    }
}
