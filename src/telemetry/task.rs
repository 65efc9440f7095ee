//! Span helpers for the claim/report cycle.

use tracing::Span;

/// Span around one claim call. `task.id` and `version` are filled in on success.
pub fn start_claim_span(queue: &str) -> Span {
    tracing::info_span!(
        "task.claim",
        "task.queue" = queue,
        "task.id" = tracing::field::Empty,
        "task.version" = tracing::field::Empty,
    )
}

/// Record the claimed task on a span from [`start_claim_span`].
pub fn record_claim(span: &Span, task_id: &str, version: i64) {
    span.record("task.id", task_id);
    span.record("task.version", version);
}

/// Span around one worker report.
pub fn start_report_span(task_id: &str, success: bool) -> Span {
    tracing::info_span!(
        "task.report",
        "task.id" = task_id,
        "task.success" = success,
        "task.status" = tracing::field::Empty,
    )
}

/// Record a status transition as an event on `span`.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("task.status", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
