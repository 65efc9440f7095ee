//! Core data model.
//!
//! A task is one unit of work on a named queue. It carries an opaque payload
//! for the worker, lifecycle state, and the claim bookkeeping that lets many
//! workers compete for it without a shared lock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

pub const DEFAULT_QUEUE: &str = "default";
pub const DEFAULT_NAME: &str = "unnamed";
pub const DEFAULT_MAX_RETRY: i32 = 3;
pub const DEFAULT_TIMEOUT_SECS: i64 = 60;

/// Column widths of the `tasks` table, in characters.
pub const MAX_QUEUE_LEN: usize = 50;
pub const MAX_NAME_LEN: usize = 100;
pub const MAX_CALLBACK_LEN: usize = 1000;

/// Build a 50-char id: 15-digit epoch millis, 32 random hex chars, `000`.
///
/// Ids from independent creators sort by creation time to the millisecond
/// without any coordination.
pub fn time_sortable_id(at: DateTime<Utc>) -> String {
    let millis = at.timestamp_millis().max(0);
    format!("{millis:015}{}000", Uuid::new_v4().simple())
}

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Newtype for task ids.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn generate(at: DateTime<Utc>) -> Self {
        Self(time_sortable_id(at))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Claim token: proves which claim currently owns a task.
///
/// Stored as the task's `execution_id`. An empty token means no claim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClaimToken(pub String);

impl ClaimToken {
    pub fn generate(at: DateTime<Utc>) -> Self {
        Self(time_sortable_id(at))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClaimToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClaimToken {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Waiting for a worker to claim it.
    Pending,
    /// Claimed; a worker holds the claim token.
    Executing,
    /// Finished successfully. Terminal.
    Done,
    /// Failed with no retries left. Terminal.
    Error,
}

impl Status {
    pub const ALL: [Status; 4] = [Status::Pending, Status::Executing, Status::Done, Status::Error];

    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: Status) -> bool {
        use Status::*;
        matches!(
            (self, to),
            (Pending, Executing)
                | (Executing, Done)
                | (Executing, Pending) // retryable failure or expired claim
                | (Executing, Error)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Done | Status::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Executing => "executing",
            Status::Done => "done",
            Status::Error => "error",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Status::Pending),
            "executing" => Ok(Status::Executing),
            "done" => Ok(Status::Done),
            "error" => Ok(Status::Error),
            _ => Err(Error::Other(format!("unknown status: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// One row of the task store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub queue: String,
    pub name: String,

    /// Completion callback URL. Empty when none was given.
    pub callback: String,

    /// Seconds a claim stays valid.
    pub timeout: i64,

    pub status: Status,
    pub max_retry: i32,
    pub retried: i32,
    pub creation_time: DateTime<Utc>,

    /// Token of the current or most recent claim. Empty when pending.
    pub execution_id: String,

    /// Earliest time the task may be claimed.
    pub execution_plan_time: DateTime<Utc>,
    pub execution_start_time: Option<DateTime<Utc>>,
    pub execution_end_time: Option<DateTime<Utc>>,
    pub execution_expired_time: Option<DateTime<Utc>>,

    /// Optimistic-lock counter. Bumped by every claim and reclaim.
    pub version: i64,

    /// Worker input. The engine doesn't interpret it.
    pub task_data: serde_json::Value,
    /// Worker output. The engine doesn't interpret it.
    pub task_result: serde_json::Value,
}

impl Task {
    pub fn has_callback(&self) -> bool {
        !self.callback.is_empty()
    }

    /// Is `token` the claim that currently owns this task?
    pub fn is_claimed_by(&self, token: &ClaimToken) -> bool {
        !self.execution_id.is_empty() && self.execution_id == token.0
    }
}

/// Projection read by the claim engine and the reaper before a CAS.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub id: TaskId,
    pub queue: String,
    pub name: String,
    pub timeout: i64,
    pub version: i64,
    pub task_data: serde_json::Value,
}

impl From<&Task> for Candidate {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            queue: task.queue.clone(),
            name: task.name.clone(),
            timeout: task.timeout,
            version: task.version,
            task_data: task.task_data.clone(),
        }
    }
}

/// What a worker receives from a successful claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimedTask {
    pub id: TaskId,
    pub queue: String,
    pub name: String,
    pub task_data: serde_json::Value,
    /// Version after the claim.
    pub version: i64,
    pub token: ClaimToken,
    /// After this instant the reaper may take the task back.
    pub expires_at: DateTime<Utc>,
}

/// Outcome a worker reports for its claim.
#[derive(Debug, Clone, PartialEq)]
pub enum Report {
    Success(serde_json::Value),
    /// Retryable failure. The payload, if any, replaces `task_result`.
    Failure(Option<serde_json::Value>),
}

impl Report {
    pub fn is_success(&self) -> bool {
        matches!(self, Report::Success(_))
    }
}

/// Per-status task counts for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub pending: u64,
    pub executing: u64,
    pub done: u64,
    pub error: u64,
}

impl TaskCounts {
    pub fn add(&mut self, status: Status, n: u64) {
        match status {
            Status::Pending => self.pending += n,
            Status::Executing => self.executing += n,
            Status::Done => self.done += n,
            Status::Error => self.error += n,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.executing + self.done + self.error
    }
}

// ---------------------------------------------------------------------------
// Creation
// ---------------------------------------------------------------------------

/// Why a task could not be created. Returned as data, never raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rejection {
    InvalidCallback,
    InvalidTimeout,
    InvalidQueue,
    InvalidName,
}

impl Rejection {
    /// Machine-readable error code shared by every rejection.
    pub fn code(self) -> &'static str {
        "cannot_create_task"
    }

    pub fn description(self) -> &'static str {
        match self {
            Rejection::InvalidCallback => "invalid callback",
            Rejection::InvalidTimeout => "invalid timeout",
            Rejection::InvalidQueue => "queue name too long",
            Rejection::InvalidName => "task name too long",
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code(), self.description())
    }
}

/// What happened when a task was submitted.
#[derive(Debug, Clone, PartialEq)]
pub enum CreateResult {
    /// Row inserted as pending.
    Created(TaskId),
    /// Input failed validation; nothing was stored.
    Rejected(Rejection),
}

impl CreateResult {
    pub fn id(&self) -> Option<&TaskId> {
        match self {
            CreateResult::Created(id) => Some(id),
            CreateResult::Rejected(_) => None,
        }
    }
}

/// Builder for new tasks. The engine's public API for submitting work.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub(crate) queue: String,
    pub(crate) name: String,
    pub(crate) task_data: serde_json::Value,
    pub(crate) callback: Option<String>,
    pub(crate) max_retry: i32,
    pub(crate) plan_time: Option<DateTime<Utc>>,
    pub(crate) timeout: i64,
}

impl NewTask {
    pub fn new(queue: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            name: name.into(),
            task_data: serde_json::Value::Null,
            callback: None,
            max_retry: DEFAULT_MAX_RETRY,
            plan_time: None,
            timeout: DEFAULT_TIMEOUT_SECS,
        }
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.task_data = data;
        self
    }

    pub fn callback(mut self, url: impl Into<String>) -> Self {
        self.callback = Some(url.into());
        self
    }

    pub fn max_retry(mut self, n: i32) -> Self {
        self.max_retry = n;
        self
    }

    /// Do not hand the task out before `at`.
    pub fn plan_at(mut self, at: DateTime<Utc>) -> Self {
        self.plan_time = Some(at);
        self
    }

    pub fn timeout_secs(mut self, secs: i64) -> Self {
        self.timeout = secs;
        self
    }

    /// Apply defaults and validate, producing the row to insert.
    pub(crate) fn into_task(self, now: DateTime<Utc>) -> Result<Task, Rejection> {
        let callback = self.callback.unwrap_or_default();
        if !callback.is_empty()
            && (!(callback.starts_with("http://") || callback.starts_with("https://"))
                || callback.chars().count() > MAX_CALLBACK_LEN)
        {
            return Err(Rejection::InvalidCallback);
        }
        if self.timeout <= 0 {
            return Err(Rejection::InvalidTimeout);
        }
        if self.queue.chars().count() > MAX_QUEUE_LEN {
            return Err(Rejection::InvalidQueue);
        }
        if self.name.chars().count() > MAX_NAME_LEN {
            return Err(Rejection::InvalidName);
        }

        Ok(Task {
            id: TaskId::generate(now),
            queue: non_empty_or(self.queue, DEFAULT_QUEUE),
            name: non_empty_or(self.name, DEFAULT_NAME),
            callback,
            timeout: self.timeout,
            status: Status::Pending,
            max_retry: self.max_retry.max(0),
            retried: 0,
            creation_time: now,
            execution_id: String::new(),
            execution_plan_time: self.plan_time.unwrap_or(now),
            execution_start_time: None,
            execution_end_time: None,
            execution_expired_time: None,
            version: 0,
            task_data: self.task_data,
            task_result: serde_json::Value::Null,
        })
    }
}

fn non_empty_or(value: String, default: &str) -> String {
    if value.is_empty() {
        default.to_string()
    } else {
        value
    }
}
