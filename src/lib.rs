//! # taskq
//!
//! Distributed task queue over a shared relational store.
//!
//! Producers submit tasks to named queues; workers claim them with an
//! optimistic compare-and-swap on a per-row version, then report success or
//! failure with the claim token they were handed. No row locks are held
//! between calls, so claimants on any number of hosts can share one store.
//!
//! Background passes reclaim claims whose worker went silent and purge old
//! finished tasks. Finished tasks with a callback URL are announced over HTTP.

pub mod clock;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod model;
pub mod store;
pub mod telemetry;

pub use engine::{ClaimOutcome, Scheduler};
pub use error::{Error, Result};
