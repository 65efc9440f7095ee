//! In-memory task store.
//!
//! Each trait call takes the lock once, so every call is atomic and the
//! gap between `next_candidate` and `claim` stays open to other callers,
//! exactly as it is against Postgres.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{ClaimUpdate, FinishUpdate, ListQuery, TaskStore};
use crate::error::Result;
use crate::model::{Candidate, Status, Task, TaskCounts, TaskId};

#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: Mutex<HashMap<TaskId, Task>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored rows, in any status.
    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.lock().await.is_empty()
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn insert(&self, task: &Task) -> Result<()> {
        self.rows.lock().await.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn get(&self, id: &TaskId) -> Result<Option<Task>> {
        Ok(self.rows.lock().await.get(id).cloned())
    }

    async fn list(&self, query: &ListQuery) -> Result<Vec<Task>> {
        let rows = self.rows.lock().await;
        let mut tasks: Vec<Task> = rows
            .values()
            .filter(|t| t.queue == query.queue)
            .filter(|t| query.status.is_none_or(|s| t.status == s))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| {
            a.execution_plan_time
                .cmp(&b.execution_plan_time)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(tasks
            .into_iter()
            .skip(query.offset.max(0) as usize)
            .take(query.limit.max(0) as usize)
            .collect())
    }

    async fn counts(&self, queue: &str) -> Result<TaskCounts> {
        let rows = self.rows.lock().await;
        let mut counts = TaskCounts::default();
        for task in rows.values().filter(|t| t.queue == queue) {
            counts.add(task.status, 1);
        }
        Ok(counts)
    }

    async fn next_candidate(&self, queue: &str, now: DateTime<Utc>) -> Result<Option<Candidate>> {
        let rows = self.rows.lock().await;
        Ok(rows
            .values()
            .filter(|t| {
                t.queue == queue && t.status == Status::Pending && t.execution_plan_time <= now
            })
            .min_by(|a, b| {
                a.execution_plan_time
                    .cmp(&b.execution_plan_time)
                    .then_with(|| a.id.cmp(&b.id))
            })
            .map(Candidate::from))
    }

    async fn claim(&self, update: &ClaimUpdate) -> Result<bool> {
        let mut rows = self.rows.lock().await;
        let Some(task) = rows.get_mut(&update.id) else {
            return Ok(false);
        };
        if task.version != update.expected_version {
            return Ok(false);
        }
        task.status = Status::Executing;
        task.execution_id = update.token.0.clone();
        task.execution_start_time = Some(update.started_at);
        task.execution_expired_time = Some(update.expires_at);
        task.version += 1;
        Ok(true)
    }

    async fn finish(&self, update: &FinishUpdate) -> Result<bool> {
        let mut rows = self.rows.lock().await;
        let Some(task) = rows.get_mut(&update.id) else {
            return Ok(false);
        };
        if task.status != Status::Executing
            || task.version != update.expected_version
            || task.execution_id != update.token.0
        {
            return Ok(false);
        }
        task.status = update.status;
        task.retried = update.retried;
        task.execution_end_time = Some(update.ended_at);
        if let Some(result) = &update.task_result {
            task.task_result = result.clone();
        }
        if let Some(at) = update.requeue_at {
            task.execution_id.clear();
            task.execution_plan_time = at;
        }
        Ok(true)
    }

    async fn expired(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Candidate>> {
        let rows = self.rows.lock().await;
        let mut expired: Vec<&Task> = rows
            .values()
            .filter(|t| {
                t.status == Status::Executing && t.execution_expired_time.is_some_and(|e| e < now)
            })
            .collect();
        expired.sort_by_key(|t| t.execution_expired_time);
        Ok(expired
            .into_iter()
            .take(limit.max(0) as usize)
            .map(Candidate::from)
            .collect())
    }

    async fn reclaim(
        &self,
        id: &TaskId,
        expected_version: i64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut rows = self.rows.lock().await;
        let Some(task) = rows.get_mut(id) else {
            return Ok(false);
        };
        if task.version != expected_version || task.status != Status::Executing {
            return Ok(false);
        }
        task.status = Status::Pending;
        task.execution_id.clear();
        task.execution_plan_time = now;
        task.version += 1;
        Ok(true)
    }

    async fn purge_done(&self, queue: Option<&str>, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut rows = self.rows.lock().await;
        let before = rows.len();
        rows.retain(|_, t| {
            let purge = t.status == Status::Done
                && t.execution_end_time.is_some_and(|end| end < cutoff)
                && queue.is_none_or(|q| t.queue == q);
            !purge
        });
        Ok((before - rows.len()) as u64)
    }

    async fn delete(&self, id: &TaskId) -> Result<bool> {
        Ok(self.rows.lock().await.remove(id).is_some())
    }
}
