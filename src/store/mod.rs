//! Task store port.
//!
//! The engine talks to persistence only through [`TaskStore`]. Each method
//! is one statement (or one transaction) against the store; adapters
//! guarantee that each call is atomic and nothing more. The compare-and-swap
//! methods report success as a `bool` built from the affected-row count.
//!
//! Adapters:
//! - [`crate::db::Db`]: PostgreSQL, the durable deployment.
//! - [`MemoryStore`]: in-process, for tests and single-process embedding.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::model::{Candidate, ClaimToken, Status, Task, TaskCounts, TaskId};

pub const MAX_LIST_LIMIT: i64 = 100;

/// Page of tasks on one queue, ordered by `execution_plan_time`.
#[derive(Debug, Clone)]
pub struct ListQuery {
    pub queue: String,
    pub status: Option<Status>,
    pub offset: i64,
    pub limit: i64,
}

impl ListQuery {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            status: None,
            offset: 0,
            limit: MAX_LIST_LIMIT,
        }
    }

    pub fn status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    pub fn page(mut self, offset: i64, limit: i64) -> Self {
        self.offset = offset;
        self.limit = limit;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.offset < 0 {
            return Err(Error::InvalidArgument("offset must be >= 0".to_string()));
        }
        if !(1..=MAX_LIST_LIMIT).contains(&self.limit) {
            return Err(Error::InvalidArgument(format!(
                "limit must be 1 - {MAX_LIST_LIMIT}"
            )));
        }
        Ok(())
    }
}

/// pending → executing, gated on `(id, expected_version)`.
#[derive(Debug, Clone)]
pub struct ClaimUpdate {
    pub id: TaskId,
    pub expected_version: i64,
    pub token: ClaimToken,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// executing → done | pending | error, gated on
/// `(id, token, expected_version, status = executing)`.
#[derive(Debug, Clone)]
pub struct FinishUpdate {
    pub id: TaskId,
    pub token: ClaimToken,
    pub expected_version: i64,
    pub status: Status,
    pub retried: i32,
    /// `None` keeps the stored result.
    pub task_result: Option<serde_json::Value>,
    pub ended_at: DateTime<Utc>,
    /// Set when `status` is pending: the claim is cleared and the task
    /// becomes claimable again at this instant.
    pub requeue_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert(&self, task: &Task) -> Result<()>;

    async fn get(&self, id: &TaskId) -> Result<Option<Task>>;

    async fn list(&self, query: &ListQuery) -> Result<Vec<Task>>;

    async fn counts(&self, queue: &str) -> Result<TaskCounts>;

    /// The pending task of `queue` with the earliest plan time `<= now`.
    async fn next_candidate(&self, queue: &str, now: DateTime<Utc>) -> Result<Option<Candidate>>;

    /// Returns false if the version moved on since it was read.
    async fn claim(&self, update: &ClaimUpdate) -> Result<bool>;

    /// Returns false if the claim was superseded or already finished.
    async fn finish(&self, update: &FinishUpdate) -> Result<bool>;

    /// Executing tasks whose claim expired before `now`, oldest expiry first.
    async fn expired(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Candidate>>;

    /// executing → pending for an expired claim, gated on `(id, expected_version)`.
    /// Bumps the version, clears the claim token, keeps `retried`.
    async fn reclaim(&self, id: &TaskId, expected_version: i64, now: DateTime<Utc>)
    -> Result<bool>;

    /// Delete done tasks that ended before `cutoff`. Returns the count deleted.
    async fn purge_done(&self, queue: Option<&str>, cutoff: DateTime<Utc>) -> Result<u64>;

    async fn delete(&self, id: &TaskId) -> Result<bool>;
}
