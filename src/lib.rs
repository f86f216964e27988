//! # attempt-rs
//!
//! Worker-side execution of one scheduled work item.
//!
//! Given the location of a persisted work unit (or bundle of units), a task
//! attempt loads the job state it belongs to, flattens the units, builds a
//! job-scoped resource broker, and hands everything to an execution engine
//! under a commit policy. The scheduler gets exactly one terminal result and
//! may cancel from another thread at any point.

pub mod broker;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod flatten;
pub mod job_state;
pub mod model;
pub mod storage;
pub mod telemetry;

pub use executor::TaskAttemptExecutor;
