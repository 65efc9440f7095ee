//! Claim engine: optimistic, lock-free task claiming.
//!
//! One attempt reads the best pending candidate in its own transaction, then
//! issues a compare-and-swap update gated on the version it read. Between the
//! two, another claimant may win; the loser sees zero affected rows, sleeps a
//! random jitter, and tries again up to the policy's attempt limit.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use opentelemetry::KeyValue;
use tracing::{Instrument, debug, info};

use super::Scheduler;
use crate::error::{Error, Result};
use crate::model::{ClaimToken, ClaimedTask, DEFAULT_QUEUE};
use crate::store::ClaimUpdate;
use crate::telemetry::{metrics, task as spans};

/// Result of a claim call.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// The caller now owns this task until it reports or the claim expires.
    Claimed(ClaimedTask),
    /// No pending task was due on the queue.
    Empty,
    /// Every attempt lost its race to another claimant.
    Contended,
}

impl ClaimOutcome {
    /// Collapse `Empty` and `Contended` into "no task available".
    pub fn into_claimed(self) -> Option<ClaimedTask> {
        match self {
            ClaimOutcome::Claimed(task) => Some(task),
            ClaimOutcome::Empty | ClaimOutcome::Contended => None,
        }
    }

    pub fn is_claimed(&self) -> bool {
        matches!(self, ClaimOutcome::Claimed(_))
    }

    fn label(&self) -> &'static str {
        match self {
            ClaimOutcome::Claimed(_) => "claimed",
            ClaimOutcome::Empty => "empty",
            ClaimOutcome::Contended => "contended",
        }
    }
}

/// One read-then-CAS cycle.
enum Attempt {
    Claimed(ClaimedTask),
    Empty,
    Conflict,
}

impl Scheduler {
    /// Claim the next due task on `queue` (the default queue if empty).
    ///
    /// Never blocks waiting for work: returns [`ClaimOutcome::Empty`] right
    /// away when nothing is due.
    pub async fn claim(&self, queue: &str) -> Result<ClaimOutcome> {
        let queue = if queue.is_empty() { DEFAULT_QUEUE } else { queue };
        let span = spans::start_claim_span(queue);

        async {
            let attempts = self.claim_policy.max_attempts.max(1);
            for attempt in 1..=attempts {
                match self.attempt_claim(queue).await? {
                    Attempt::Claimed(task) => {
                        spans::record_claim(&span, task.id.as_str(), task.version);
                        spans::record_state_transition(&span, "pending", "executing");
                        info!(task.id = %task.id, version = task.version, attempt, "task claimed");
                        return Ok(self.finish_claim(queue, ClaimOutcome::Claimed(task)));
                    }
                    Attempt::Empty => return Ok(self.finish_claim(queue, ClaimOutcome::Empty)),
                    Attempt::Conflict => {
                        metrics::claim_conflicts()
                            .add(1, &[KeyValue::new("queue", queue.to_string())]);
                        if attempt < attempts {
                            tokio::time::sleep(self.claim_policy.jitter()).await;
                        }
                    }
                }
            }
            debug!(attempts, "claim gave up after repeated conflicts");
            Ok::<_, Error>(self.finish_claim(queue, ClaimOutcome::Contended))
        }
        .instrument(span.clone())
        .await
    }

    async fn attempt_claim(&self, queue: &str) -> Result<Attempt> {
        let now = self.clock.now();
        let Some(candidate) = self.store.next_candidate(queue, now).await? else {
            return Ok(Attempt::Empty);
        };

        let token = ClaimToken::generate(now);
        let expires_at = ChronoDuration::try_seconds(candidate.timeout)
            .and_then(|timeout| now.checked_add_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let update = ClaimUpdate {
            id: candidate.id.clone(),
            expected_version: candidate.version,
            token: token.clone(),
            started_at: now,
            expires_at,
        };

        if !self.store.claim(&update).await? {
            debug!(task.id = %candidate.id, expected = candidate.version, "version conflict");
            return Ok(Attempt::Conflict);
        }

        Ok(Attempt::Claimed(ClaimedTask {
            id: candidate.id,
            queue: candidate.queue,
            name: candidate.name,
            task_data: candidate.task_data,
            version: candidate.version + 1,
            token,
            expires_at,
        }))
    }

    fn finish_claim(&self, queue: &str, outcome: ClaimOutcome) -> ClaimOutcome {
        metrics::claims().add(
            1,
            &[
                KeyValue::new("queue", queue.to_string()),
                KeyValue::new("outcome", outcome.label()),
            ],
        );
        outcome
    }
}
