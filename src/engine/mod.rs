//! The scheduler. The public API for creating, claiming, and finishing tasks.
//!
//! All status changes go through here. The scheduler holds no task state of
//! its own: every decision is made against the store, so any number of
//! scheduler handles in any number of processes can share one store.

mod claim;
pub mod maintenance;
pub mod notify;
pub mod policy;
mod report;

pub use claim::ClaimOutcome;
pub use maintenance::{Reaper, Sweeper, DEFAULT_RETENTION};
pub use notify::{HttpNotifier, Notification, Notifier, deliver};
pub use policy::{ClaimPolicy, RetryPolicy};

use std::sync::Arc;

use opentelemetry::KeyValue;
use tracing::{debug, info};

use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::model::{CreateResult, NewTask, Rejection, Task, TaskCounts, TaskId};
use crate::store::{ListQuery, TaskStore};
use crate::telemetry::metrics;

/// Handle to the task store plus the policies that govern it.
///
/// Cheap to clone; clones share the store, clock, and notifier.
#[derive(Clone)]
pub struct Scheduler {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    claim_policy: ClaimPolicy,
    retry_policy: RetryPolicy,
    notifier: Option<Arc<dyn Notifier>>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            claim_policy: ClaimPolicy::default(),
            retry_policy: RetryPolicy::default(),
            notifier: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_claim_policy(mut self, policy: ClaimPolicy) -> Self {
        self.claim_policy = policy;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Deliver completion callbacks through `notifier`. Without one,
    /// callbacks are skipped.
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn claim_policy(&self) -> &ClaimPolicy {
        &self.claim_policy
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Submit a new task.
    ///
    /// Bad input comes back as [`CreateResult::Rejected`] and stores
    /// nothing; `Err` is reserved for store failures.
    pub async fn create_task(&self, new: NewTask) -> Result<CreateResult> {
        let now = self.clock.now();
        let queue = new.queue.clone();

        let task = match new.into_task(now) {
            Ok(task) => task,
            Err(rejection) => {
                debug!(queue = %queue, %rejection, "task rejected");
                metrics::tasks_created().add(
                    1,
                    &[
                        KeyValue::new("queue", queue),
                        KeyValue::new("result", rejection_label(rejection)),
                    ],
                );
                return Ok(CreateResult::Rejected(rejection));
            }
        };

        self.store.insert(&task).await?;

        info!(task.id = %task.id, queue = %task.queue, name = %task.name, "task created");
        metrics::tasks_created().add(
            1,
            &[
                KeyValue::new("queue", task.queue.clone()),
                KeyValue::new("result", "created"),
            ],
        );
        Ok(CreateResult::Created(task.id))
    }

    /// Get a task by id.
    pub async fn get_task(&self, id: &TaskId) -> Result<Task> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(id.clone()))
    }

    /// Page through a queue in plan-time order.
    pub async fn list_tasks(&self, query: &ListQuery) -> Result<Vec<Task>> {
        query.validate()?;
        self.store.list(query).await
    }

    pub async fn counts(&self, queue: &str) -> Result<TaskCounts> {
        self.store.counts(queue).await
    }

    /// Delete a task regardless of status. Returns false if it did not exist.
    pub async fn delete_task(&self, id: &TaskId) -> Result<bool> {
        let deleted = self.store.delete(id).await?;
        if deleted {
            info!(task.id = %id, "task deleted");
        }
        Ok(deleted)
    }

    fn notify_if_terminal(&self, task: &Task) {
        if !task.status.is_terminal() || !task.has_callback() {
            return;
        }
        if let Some(notifier) = &self.notifier {
            notify::dispatch(Arc::clone(notifier), task);
        }
    }
}

fn rejection_label(rejection: Rejection) -> &'static str {
    match rejection {
        Rejection::InvalidCallback => "invalid_callback",
        Rejection::InvalidTimeout => "invalid_timeout",
        Rejection::InvalidQueue => "invalid_queue",
        Rejection::InvalidName => "invalid_name",
    }
}
