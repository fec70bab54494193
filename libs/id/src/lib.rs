//! # spindit-id
//!
//! Typed identifiers for every record the locker engine touches.
//!
//! Every ID renders as `{prefix}_{ulid}`, for example
//! `lkr_01HV4Z2WQXKJNM8GPQY6VBKC3D` for a locker or
//! `req_01HV4Z3MXNKPQR9HSTZ7WCLD4E` for a locker request.
//! The prefix makes it impossible to hand a request ID to an API that expects a
//! locker ID, and the ULID keeps IDs sortable by creation time.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

pub use ulid::Ulid;
