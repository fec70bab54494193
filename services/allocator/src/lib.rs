//! spindit locker allocation engine.
//!
//! This crate primarily ships an `allocator` binary, but we expose the engine
//! as a library so the jobs and handlers can be driven directly in tests.
//!
//! - [`engine`] reacts to request lifecycle events: allocate, release, occupy.
//! - [`jobs`] runs the time-driven work: hold expiry and the renewal cycle.
//! - [`intake`] feeds request events from the database outbox to the engine.
//! - [`store`] is the transactional persistence seam, in Postgres or memory.

pub mod calendar;
pub mod clock;
pub mod config;
pub mod engine;
pub mod intake;
pub mod jobs;
pub mod model;
pub mod store;
