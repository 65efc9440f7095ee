//! Background passes that run beside the claim/report cycle.
//!
//! - The reaper takes back executing tasks whose claim expired without a
//!   report, using the same version-gated swap as a claim, so a slow worker
//!   that reports first keeps its result and a reclaimed worker's late
//!   report is refused.
//! - The sweeper deletes done tasks older than the retention window. It
//!   only ever touches terminal rows, so it is safe beside live claiming.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use opentelemetry::KeyValue;
use tokio::sync::Notify;
use tracing::{debug, error, info};

use super::Scheduler;
use crate::error::Result;

/// Done tasks are kept this long by default.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Expired claims reclaimed per store round-trip.
const REAP_BATCH: i64 = 100;

impl Scheduler {
    /// Reclaim every executing task whose claim has expired.
    ///
    /// Each task goes back to pending with its version bumped, its claim
    /// token cleared, and its retry count untouched. Returns how many were
    /// reclaimed; tasks whose version moved on are skipped.
    pub async fn reap_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut reclaimed = 0;

        loop {
            let expired = self.store.expired(now, REAP_BATCH).await?;
            let batch_len = expired.len();
            let mut progressed = false;

            for candidate in expired {
                if self
                    .store
                    .reclaim(&candidate.id, candidate.version, now)
                    .await?
                {
                    info!(
                        task.id = %candidate.id,
                        queue = %candidate.queue,
                        version = candidate.version + 1,
                        "expired claim reclaimed"
                    );
                    reclaimed += 1;
                    progressed = true;
                } else {
                    debug!(task.id = %candidate.id, "expired task moved on before reclaim");
                }
            }

            if (batch_len as i64) < REAP_BATCH || !progressed {
                break;
            }
        }

        if reclaimed > 0 {
            metrics_reaped(reclaimed);
        }
        Ok(reclaimed)
    }

    /// Delete done tasks that ended more than `retention` ago, on one queue
    /// or on all of them. Returns the number deleted.
    pub async fn cleanup(&self, queue: Option<&str>, retention: Duration) -> Result<u64> {
        let cutoff = cutoff(self.clock.now(), retention);
        let purged = self.store.purge_done(queue, cutoff).await?;
        if purged > 0 {
            info!(purged, queue = queue.unwrap_or("*"), %cutoff, "finished tasks purged");
            crate::telemetry::metrics::purged().add(
                purged,
                &[KeyValue::new("queue", queue.unwrap_or("*").to_string())],
            );
        }
        Ok(purged)
    }
}

fn metrics_reaped(n: usize) {
    crate::telemetry::metrics::reaped().add(n as u64, &[]);
}

fn cutoff(now: DateTime<Utc>, retention: Duration) -> DateTime<Utc> {
    ChronoDuration::from_std(retention)
        .ok()
        .and_then(|r| now.checked_sub_signed(r))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Periodically reclaims expired claims until shut down.
#[derive(Clone)]
pub struct Reaper {
    scheduler: Scheduler,
    interval: Duration,
    shutdown: Arc<Notify>,
}

impl Reaper {
    pub fn new(scheduler: Scheduler, interval: Duration) -> Self {
        Self {
            scheduler,
            interval,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Signal the reaper to stop. Takes effect between passes.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Run a pass immediately, then one every `interval`, until shutdown.
    pub async fn run(&self) -> Result<()> {
        info!(interval_secs = self.interval.as_secs(), "reaper started");
        run_every("reaper", self.interval, &self.shutdown, move || async move {
            self.scheduler.reap_expired().await.map(|_| ())
        })
        .await
    }
}

/// Periodically purges finished tasks past the retention window.
#[derive(Clone)]
pub struct Sweeper {
    scheduler: Scheduler,
    interval: Duration,
    retention: Duration,
    queue: Option<String>,
    shutdown: Arc<Notify>,
}

impl Sweeper {
    pub fn new(scheduler: Scheduler, interval: Duration) -> Self {
        Self {
            scheduler,
            interval,
            retention: DEFAULT_RETENTION,
            queue: None,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Only sweep `queue`. All queues by default.
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    pub async fn run(&self) -> Result<()> {
        info!(
            interval_secs = self.interval.as_secs(),
            retention_secs = self.retention.as_secs(),
            "sweeper started"
        );
        run_every("sweeper", self.interval, &self.shutdown, move || async move {
            self.scheduler
                .cleanup(self.queue.as_deref(), self.retention)
                .await
                .map(|_| ())
        })
        .await
    }
}

/// Drive `pass` on a fixed interval. A failed pass is logged and the loop
/// keeps going; only shutdown ends it.
async fn run_every<F, Fut>(
    name: &'static str,
    interval: Duration,
    shutdown: &Notify,
    mut pass: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    loop {
        if let Err(e) = pass().await {
            error!(task = name, "pass failed: {e}");
        }

        tokio::select! {
            _ = shutdown.notified() => {
                info!(task = name, "shutting down");
                return Ok(());
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
