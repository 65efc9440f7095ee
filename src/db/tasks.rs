//! Postgres adapter for the task store.
//!
//! The claim and reclaim updates are version-gated single statements; the
//! affected-row count is the compare-and-swap result.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::model::{Candidate, Status, Task, TaskCounts, TaskId};
use crate::store::{ClaimUpdate, FinishUpdate, ListQuery, TaskStore};

const TASK_COLUMNS: &str = "id, queue, name, callback, timeout, status, max_retry, retried, \
     creation_time, execution_id, execution_plan_time, execution_start_time, \
     execution_end_time, execution_expired_time, version, task_data, task_result";

const CANDIDATE_COLUMNS: &str = "id, queue, name, timeout, version, task_data";

#[async_trait]
impl TaskStore for super::Db {
    async fn insert(&self, task: &Task) -> Result<()> {
        sqlx::query(
            "INSERT INTO tasks (id, queue, name, callback, timeout, status, max_retry, retried, creation_time, execution_id, execution_plan_time, execution_start_time, execution_end_time, execution_expired_time, version, task_data, task_result)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)",
        )
        .bind(task.id.as_str())
        .bind(&task.queue)
        .bind(&task.name)
        .bind(&task.callback)
        .bind(task.timeout)
        .bind(task.status.as_str())
        .bind(task.max_retry)
        .bind(task.retried)
        .bind(task.creation_time)
        .bind(&task.execution_id)
        .bind(task.execution_plan_time)
        .bind(task.execution_start_time)
        .bind(task.execution_end_time)
        .bind(task.execution_expired_time)
        .bind(task.version)
        .bind(&task.task_data)
        .bind(&task.task_result)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn get(&self, id: &TaskId) -> Result<Option<Task>> {
        let row: Option<TaskRow> =
            sqlx::query_as(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"))
                .bind(id.as_str())
                .fetch_optional(self.pool())
                .await?;
        row.map(TaskRow::try_into_task).transpose()
    }

    async fn list(&self, query: &ListQuery) -> Result<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE queue = $1 AND ($2::varchar IS NULL OR status = $2)
             ORDER BY execution_plan_time, id
             OFFSET $3 LIMIT $4"
        ))
        .bind(&query.queue)
        .bind(query.status.map(Status::as_str))
        .bind(query.offset)
        .bind(query.limit)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(TaskRow::try_into_task).collect()
    }

    async fn counts(&self, queue: &str) -> Result<TaskCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM tasks WHERE queue = $1 GROUP BY status")
                .bind(queue)
                .fetch_all(self.pool())
                .await?;
        let mut counts = TaskCounts::default();
        for (status, n) in rows {
            counts.add(status.parse()?, n as u64);
        }
        Ok(counts)
    }

    async fn next_candidate(&self, queue: &str, now: DateTime<Utc>) -> Result<Option<Candidate>> {
        let queue = queue.to_string();
        self.transaction(move |conn| {
            Box::pin(async move {
                let row: Option<CandidateRow> = sqlx::query_as(&format!(
                    "SELECT {CANDIDATE_COLUMNS} FROM tasks
                     WHERE queue = $1 AND status = 'pending' AND execution_plan_time <= $2
                     ORDER BY execution_plan_time
                     LIMIT 1"
                ))
                .bind(&queue)
                .bind(now)
                .fetch_optional(&mut *conn)
                .await?;
                Ok::<_, Error>(row.map(Candidate::from))
            })
        })
        .await
    }

    async fn claim(&self, update: &ClaimUpdate) -> Result<bool> {
        let rows_affected = sqlx::query(
            "UPDATE tasks SET status = 'executing', execution_id = $1, execution_start_time = $2, execution_expired_time = $3, version = version + 1
             WHERE id = $4 AND version = $5",
        )
        .bind(update.token.as_str())
        .bind(update.started_at)
        .bind(update.expires_at)
        .bind(update.id.as_str())
        .bind(update.expected_version)
        .execute(self.pool())
        .await?
        .rows_affected();
        Ok(rows_affected == 1)
    }

    async fn finish(&self, update: &FinishUpdate) -> Result<bool> {
        let rows_affected = sqlx::query(
            "UPDATE tasks SET status = $1, retried = $2, task_result = COALESCE($3, task_result), execution_end_time = $4,
                 execution_id = CASE WHEN $5::timestamptz IS NULL THEN execution_id ELSE '' END,
                 execution_plan_time = COALESCE($5, execution_plan_time)
             WHERE id = $6 AND execution_id = $7 AND version = $8 AND status = 'executing'",
        )
        .bind(update.status.as_str())
        .bind(update.retried)
        .bind(&update.task_result)
        .bind(update.ended_at)
        .bind(update.requeue_at)
        .bind(update.id.as_str())
        .bind(update.token.as_str())
        .bind(update.expected_version)
        .execute(self.pool())
        .await?
        .rows_affected();
        Ok(rows_affected == 1)
    }

    async fn expired(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Candidate>> {
        let rows: Vec<CandidateRow> = sqlx::query_as(&format!(
            "SELECT {CANDIDATE_COLUMNS} FROM tasks
             WHERE status = 'executing' AND execution_expired_time < $1
             ORDER BY execution_expired_time
             LIMIT $2"
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(Candidate::from).collect())
    }

    async fn reclaim(
        &self,
        id: &TaskId,
        expected_version: i64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let rows_affected = sqlx::query(
            "UPDATE tasks SET status = 'pending', execution_id = '', execution_plan_time = $1, version = version + 1
             WHERE id = $2 AND version = $3 AND status = 'executing'",
        )
        .bind(now)
        .bind(id.as_str())
        .bind(expected_version)
        .execute(self.pool())
        .await?
        .rows_affected();
        Ok(rows_affected == 1)
    }

    async fn purge_done(&self, queue: Option<&str>, cutoff: DateTime<Utc>) -> Result<u64> {
        let deleted = sqlx::query(
            "DELETE FROM tasks
             WHERE status = 'done' AND execution_end_time < $1 AND ($2::varchar IS NULL OR queue = $2)",
        )
        .bind(cutoff)
        .bind(queue)
        .execute(self.pool())
        .await?
        .rows_affected();
        Ok(deleted)
    }

    async fn delete(&self, id: &TaskId) -> Result<bool> {
        let deleted = sqlx::query("DELETE FROM tasks WHERE id = $1")
            .bind(id.as_str())
            .execute(self.pool())
            .await?
            .rows_affected();
        Ok(deleted > 0)
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    queue: String,
    name: String,
    callback: String,
    timeout: i64,
    status: String,
    max_retry: i32,
    retried: i32,
    creation_time: DateTime<Utc>,
    execution_id: String,
    execution_plan_time: DateTime<Utc>,
    execution_start_time: Option<DateTime<Utc>>,
    execution_end_time: Option<DateTime<Utc>>,
    execution_expired_time: Option<DateTime<Utc>>,
    version: i64,
    task_data: serde_json::Value,
    task_result: serde_json::Value,
}

impl TaskRow {
    fn try_into_task(self) -> Result<Task> {
        Ok(Task {
            id: TaskId(self.id),
            queue: self.queue,
            name: self.name,
            callback: self.callback,
            timeout: self.timeout,
            status: self.status.parse()?,
            max_retry: self.max_retry,
            retried: self.retried,
            creation_time: self.creation_time,
            execution_id: self.execution_id,
            execution_plan_time: self.execution_plan_time,
            execution_start_time: self.execution_start_time,
            execution_end_time: self.execution_end_time,
            execution_expired_time: self.execution_expired_time,
            version: self.version,
            task_data: self.task_data,
            task_result: self.task_result,
        })
    }
}

#[derive(sqlx::FromRow)]
struct CandidateRow {
    id: String,
    queue: String,
    name: String,
    timeout: i64,
    version: i64,
    task_data: serde_json::Value,
}

impl From<CandidateRow> for Candidate {
    fn from(row: CandidateRow) -> Self {
        Self {
            id: TaskId(row.id),
            queue: row.queue,
            name: row.name,
            timeout: row.timeout,
            version: row.version,
            task_data: row.task_data,
        }
    }
}
