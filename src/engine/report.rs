//! Result recorder: applies worker reports to claimed tasks.
//!
//! A report is accepted only from the worker holding the current claim token,
//! and only while the task is executing. The write is gated on the token and
//! version that were checked, so a reaper or a duplicate report racing this
//! one cannot be overwritten.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use opentelemetry::KeyValue;
use tracing::{Instrument, info, warn};

use super::Scheduler;
use crate::error::{Error, Result};
use crate::model::{ClaimToken, Report, Status, Task, TaskId};
use crate::store::FinishUpdate;
use crate::telemetry::{metrics, task as spans};

impl Scheduler {
    /// Record the outcome of a claimed task and return the updated task.
    ///
    /// # Errors
    ///
    /// [`Error::TokenMismatch`] if `token` no longer owns the task, and
    /// [`Error::NotExecuting`] if the task already left the executing state.
    /// Both mean the caller must drop its work; neither is retried.
    pub async fn report(&self, id: &TaskId, token: &ClaimToken, report: Report) -> Result<Task> {
        let span = spans::start_report_span(id.as_str(), report.is_success());

        async {
            let task = self.get_task(id).await?;
            if let Err(e) = check_claim(&task, token) {
                warn!(task.id = %id, "report rejected: {e}");
                return Err(e);
            }

            let now = self.clock.now();
            let update = self.plan_finish(&task, token, report, now);

            if !self.store.finish(&update).await? {
                // Someone moved the task between our read and our write.
                let current = self.get_task(id).await?;
                let e = check_claim(&current, token)
                    .err()
                    .unwrap_or_else(|| Error::NotExecuting {
                        task_id: id.clone(),
                        status: current.status,
                    });
                warn!(task.id = %id, "report lost a race: {e}");
                return Err(e);
            }

            let finished = apply(task, &update);
            spans::record_state_transition(
                &span,
                Status::Executing.as_str(),
                finished.status.as_str(),
            );
            info!(
                task.id = %finished.id,
                status = %finished.status,
                retried = finished.retried,
                "task reported"
            );
            metrics::reports().add(
                1,
                &[
                    KeyValue::new("queue", finished.queue.clone()),
                    KeyValue::new("status", finished.status.as_str()),
                ],
            );

            self.notify_if_terminal(&finished);
            Ok::<_, Error>(finished)
        }
        .instrument(span.clone())
        .await
    }

    /// Shorthand for a successful report.
    pub async fn complete(
        &self,
        id: &TaskId,
        token: &ClaimToken,
        result: serde_json::Value,
    ) -> Result<Task> {
        self.report(id, token, Report::Success(result)).await
    }

    /// Shorthand for a failed report without a result payload.
    pub async fn fail(&self, id: &TaskId, token: &ClaimToken) -> Result<Task> {
        self.report(id, token, Report::Failure(None)).await
    }

    fn plan_finish(
        &self,
        task: &Task,
        token: &ClaimToken,
        report: Report,
        now: DateTime<Utc>,
    ) -> FinishUpdate {
        let base = FinishUpdate {
            id: task.id.clone(),
            token: token.clone(),
            expected_version: task.version,
            status: Status::Done,
            retried: task.retried,
            task_result: None,
            ended_at: now,
            requeue_at: None,
        };

        match report {
            Report::Success(result) => FinishUpdate {
                task_result: Some(result),
                ..base
            },
            Report::Failure(result) => {
                let retried = task.retried.saturating_add(1);
                // The count before this failure decides: max_retry = 1
                // allows exactly one retry.
                if task.retried >= task.max_retry {
                    FinishUpdate {
                        status: Status::Error,
                        retried,
                        task_result: result,
                        ..base
                    }
                } else {
                    let delay = self.retry_policy.next_delay(retried);
                    let requeue_at = ChronoDuration::from_std(delay)
                        .ok()
                        .and_then(|d| now.checked_add_signed(d))
                        .unwrap_or(DateTime::<Utc>::MAX_UTC);
                    FinishUpdate {
                        status: Status::Pending,
                        retried,
                        task_result: result,
                        requeue_at: Some(requeue_at),
                        ..base
                    }
                }
            }
        }
    }
}

fn check_claim(task: &Task, token: &ClaimToken) -> Result<()> {
    if !task.is_claimed_by(token) {
        return Err(Error::TokenMismatch {
            task_id: task.id.clone(),
        });
    }
    if task.status != Status::Executing {
        return Err(Error::NotExecuting {
            task_id: task.id.clone(),
            status: task.status,
        });
    }
    Ok(())
}

/// The row as `update` leaves it.
fn apply(mut task: Task, update: &FinishUpdate) -> Task {
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
    task
}
