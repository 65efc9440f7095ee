//! Best-effort completion callbacks.
//!
//! Delivery is fire-and-forget: no retries, no delivery record. Nothing in
//! the engine may depend on a notification arriving.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::model::{Status, Task, TaskId};

/// JSON body posted to a task's callback URL.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub id: TaskId,
    pub queue: String,
    pub name: String,
    pub status: Status,
    pub result: serde_json::Value,
}

impl Notification {
    pub fn for_task(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            queue: task.queue.clone(),
            name: task.name.clone(),
            status: task.status,
            result: task.task_result.clone(),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, url: &str, notification: &Notification) -> Result<()>;
}

/// POSTs notifications as JSON.
#[derive(Debug, Clone)]
pub struct HttpNotifier {
    client: reqwest::Client,
}

impl HttpNotifier {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Other(format!("failed to build callback client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn notify(&self, url: &str, notification: &Notification) -> Result<()> {
        let response = self
            .client
            .post(url)
            .json(notification)
            .send()
            .await
            .map_err(|e| Error::Other(format!("callback to {url} failed: {e}")))?
            .error_for_status()
            .map_err(|e| Error::Other(format!("callback to {url} rejected: {e}")))?;
        debug!(task.id = %notification.id, status = %response.status(), "callback delivered");
        Ok(())
    }
}

/// Announce `task` through `notifier` and wait for the outcome.
///
/// Returns `Ok(false)` without sending when the task is not finished or has
/// no callback.
pub async fn deliver(notifier: &dyn Notifier, task: &Task) -> Result<bool> {
    if !task.status.is_terminal() || !task.has_callback() {
        return Ok(false);
    }
    notifier
        .notify(&task.callback, &Notification::for_task(task))
        .await?;
    Ok(true)
}

/// Send on a detached task; failures are logged and dropped.
pub(crate) fn dispatch(notifier: Arc<dyn Notifier>, task: &Task) {
    let task = task.clone();
    tokio::spawn(async move {
        if let Err(e) = deliver(notifier.as_ref(), &task).await {
            warn!(task.id = %task.id, "completion callback dropped: {e}");
        }
    });
}
