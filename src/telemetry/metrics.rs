//! Metric instrument factories.
//!
//! Instruments come from the globally registered `MeterProvider`; without
//! one they are no-ops.

use opentelemetry::metrics::{Counter, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("taskq")
}

/// Counter: task creation requests.
/// Labels: `queue`, `result` ("created" | "invalid_callback" | "invalid_timeout"
/// | "invalid_queue" | "invalid_name").
pub fn tasks_created() -> Counter<u64> {
    meter()
        .u64_counter("taskq.tasks.created")
        .with_description("Number of task creation requests")
        .build()
}

/// Counter: claim calls by outcome.
/// Labels: `queue`, `outcome` ("claimed" | "empty" | "contended").
pub fn claims() -> Counter<u64> {
    meter()
        .u64_counter("taskq.claims")
        .with_description("Number of claim calls by outcome")
        .build()
}

/// Counter: lost compare-and-swap races during claims.
/// Labels: `queue`.
pub fn claim_conflicts() -> Counter<u64> {
    meter()
        .u64_counter("taskq.claims.conflicts")
        .with_description("Number of lost claim races")
        .build()
}

/// Counter: accepted worker reports.
/// Labels: `queue`, `status` (status after the report).
pub fn reports() -> Counter<u64> {
    meter()
        .u64_counter("taskq.reports")
        .with_description("Number of accepted worker reports")
        .build()
}

/// Counter: expired claims taken back by the reaper.
pub fn reaped() -> Counter<u64> {
    meter()
        .u64_counter("taskq.reaped")
        .with_description("Number of expired claims reclaimed")
        .build()
}

/// Counter: finished tasks deleted by the retention sweeper.
pub fn purged() -> Counter<u64> {
    meter()
        .u64_counter("taskq.purged")
        .with_description("Number of finished tasks purged")
        .build()
}
