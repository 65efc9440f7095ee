//! Integration tests for the scheduler against the in-memory store.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use taskq::clock::{Clock, ManualClock};
use taskq::engine::{
    ClaimOutcome, ClaimPolicy, DEFAULT_RETENTION, Notification, Notifier, Reaper, RetryPolicy,
    Scheduler, deliver,
};
use taskq::error::Error;
use taskq::model::*;
use taskq::store::{ClaimUpdate, FinishUpdate, ListQuery, MemoryStore, TaskStore};
use tokio::sync::mpsc;

struct Harness {
    scheduler: Scheduler,
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
    ));
    let scheduler = Scheduler::new(store.clone()).with_clock(clock.clone());
    Harness {
        scheduler,
        store,
        clock,
    }
}

async fn create(scheduler: &Scheduler, new: NewTask) -> TaskId {
    match scheduler.create_task(new).await.unwrap() {
        CreateResult::Created(id) => id,
        CreateResult::Rejected(r) => panic!("expected Created, got {r}"),
    }
}

async fn claim(scheduler: &Scheduler, queue: &str) -> ClaimedTask {
    scheduler
        .claim(queue)
        .await
        .unwrap()
        .into_claimed()
        .expect("should claim a task")
}

/// Forwards every notification to a channel.
struct RecordingNotifier {
    tx: mpsc::UnboundedSender<(String, Notification)>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, url: &str, notification: &Notification) -> taskq::Result<()> {
        let _ = self.tx.send((url.to_string(), notification.clone()));
        Ok(())
    }
}

/// Which race [`RacingStore`] stages.
#[derive(Debug, Clone, Copy)]
enum Race {
    /// Every claim compare-and-swap loses to another claimant.
    ClaimAlwaysLoses,
    /// The reaper takes the task back right before each finish write.
    ReapBeforeFinish,
}

/// `MemoryStore` with one race forced on every call.
struct RacingStore {
    inner: MemoryStore,
    race: Race,
    claim_calls: AtomicUsize,
}

impl RacingStore {
    fn new(race: Race) -> Self {
        Self {
            inner: MemoryStore::new(),
            race,
            claim_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl TaskStore for RacingStore {
    async fn insert(&self, task: &Task) -> taskq::Result<()> {
        self.inner.insert(task).await
    }

    async fn get(&self, id: &TaskId) -> taskq::Result<Option<Task>> {
        self.inner.get(id).await
    }

    async fn list(&self, query: &ListQuery) -> taskq::Result<Vec<Task>> {
        self.inner.list(query).await
    }

    async fn counts(&self, queue: &str) -> taskq::Result<TaskCounts> {
        self.inner.counts(queue).await
    }

    async fn next_candidate(
        &self,
        queue: &str,
        now: DateTime<Utc>,
    ) -> taskq::Result<Option<Candidate>> {
        self.inner.next_candidate(queue, now).await
    }

    async fn claim(&self, update: &ClaimUpdate) -> taskq::Result<bool> {
        self.claim_calls.fetch_add(1, Ordering::SeqCst);
        match self.race {
            Race::ClaimAlwaysLoses => Ok(false),
            Race::ReapBeforeFinish => self.inner.claim(update).await,
        }
    }

    async fn finish(&self, update: &FinishUpdate) -> taskq::Result<bool> {
        if let Race::ReapBeforeFinish = self.race {
            self.inner
                .reclaim(&update.id, update.expected_version, update.ended_at)
                .await?;
        }
        self.inner.finish(update).await
    }

    async fn expired(&self, now: DateTime<Utc>, limit: i64) -> taskq::Result<Vec<Candidate>> {
        self.inner.expired(now, limit).await
    }

    async fn reclaim(
        &self,
        id: &TaskId,
        expected_version: i64,
        now: DateTime<Utc>,
    ) -> taskq::Result<bool> {
        self.inner.reclaim(id, expected_version, now).await
    }

    async fn purge_done(&self, queue: Option<&str>, cutoff: DateTime<Utc>) -> taskq::Result<u64> {
        self.inner.purge_done(queue, cutoff).await
    }

    async fn delete(&self, id: &TaskId) -> taskq::Result<bool> {
        self.inner.delete(id).await
    }
}

// ---------------------------------------------------------------------------
// Creation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn create_applies_defaults() {
    let h = harness();
    let id = create(&h.scheduler, NewTask::new("", "")).await;

    let task = h.scheduler.get_task(&id).await.unwrap();
    assert_eq!(task.queue, DEFAULT_QUEUE);
    assert_eq!(task.name, DEFAULT_NAME);
    assert_eq!(task.status, Status::Pending);
    assert_eq!(task.version, 0);
    assert_eq!(task.retried, 0);
    assert_eq!(task.max_retry, DEFAULT_MAX_RETRY);
    assert_eq!(task.timeout, DEFAULT_TIMEOUT_SECS);
    assert_eq!(task.execution_plan_time, h.clock.now());
    assert!(task.execution_id.is_empty());
    assert_eq!(task.id.as_str().len(), 50);
}

#[tokio::test]
async fn create_rejects_non_http_callback_without_storing() {
    let h = harness();
    let result = h
        .scheduler
        .create_task(NewTask::new("q", "t").callback("ftp://example.com/done"))
        .await
        .unwrap();

    assert_eq!(result, CreateResult::Rejected(Rejection::InvalidCallback));
    assert!(h.store.is_empty().await);
}

#[tokio::test]
async fn create_rejects_non_positive_timeout_without_storing() {
    let h = harness();
    for timeout in [0, -5] {
        let result = h
            .scheduler
            .create_task(NewTask::new("q", "t").timeout_secs(timeout))
            .await
            .unwrap();
        assert_eq!(result, CreateResult::Rejected(Rejection::InvalidTimeout));
    }
    assert!(h.store.is_empty().await);
}

#[tokio::test]
async fn create_rejects_queue_and_name_wider_than_their_columns() {
    let h = harness();

    let result = h
        .scheduler
        .create_task(NewTask::new("q".repeat(MAX_QUEUE_LEN + 1), "t"))
        .await
        .unwrap();
    assert_eq!(result, CreateResult::Rejected(Rejection::InvalidQueue));

    let result = h
        .scheduler
        .create_task(NewTask::new("q", "n".repeat(MAX_NAME_LEN + 1)))
        .await
        .unwrap();
    assert_eq!(result, CreateResult::Rejected(Rejection::InvalidName));

    assert!(h.store.is_empty().await);
}

#[tokio::test]
async fn future_plan_time_hides_task_until_due() {
    let h = harness();
    let at = h.clock.now() + chrono::Duration::minutes(5);
    create(&h.scheduler, NewTask::new("q", "later").plan_at(at)).await;

    assert_eq!(h.scheduler.claim("q").await.unwrap(), ClaimOutcome::Empty);

    h.clock.advance(chrono::Duration::minutes(5));
    assert!(h.scheduler.claim("q").await.unwrap().is_claimed());
}

// ---------------------------------------------------------------------------
// Claiming
// ---------------------------------------------------------------------------

#[tokio::test]
async fn claim_on_empty_queue_returns_empty() {
    let h = harness();
    create(&h.scheduler, NewTask::new("other", "t")).await;
    assert_eq!(h.scheduler.claim("q").await.unwrap(), ClaimOutcome::Empty);
}

#[tokio::test]
async fn claim_marks_task_executing_with_token_and_expiry() {
    let h = harness();
    let id = create(
        &h.scheduler,
        NewTask::new("q", "t").data(json!({"n": 1})).timeout_secs(30),
    )
    .await;

    let claimed = claim(&h.scheduler, "q").await;
    assert_eq!(claimed.id, id);
    assert_eq!(claimed.version, 1);
    assert_eq!(claimed.task_data, json!({"n": 1}));

    let now = h.clock.now();
    let task = h.scheduler.get_task(&id).await.unwrap();
    assert_eq!(task.status, Status::Executing);
    assert!(task.is_claimed_by(&claimed.token));
    assert_eq!(task.execution_start_time, Some(now));
    assert_eq!(
        task.execution_expired_time,
        Some(now + chrono::Duration::seconds(30))
    );
    assert_eq!(claimed.expires_at, now + chrono::Duration::seconds(30));
}

#[tokio::test]
async fn claim_takes_earliest_planned_task_first() {
    let h = harness();
    let now = h.clock.now();
    let late = create(&h.scheduler, NewTask::new("q", "late")).await;
    let early = create(
        &h.scheduler,
        NewTask::new("q", "early").plan_at(now - chrono::Duration::minutes(1)),
    )
    .await;

    assert_eq!(claim(&h.scheduler, "q").await.id, early);
    assert_eq!(claim(&h.scheduler, "q").await.id, late);
}

#[tokio::test]
async fn version_increments_on_every_claim_of_the_same_task() {
    let h = harness();
    let id = create(&h.scheduler, NewTask::new("q", "t").max_retry(5)).await;

    for expected in 1..=4 {
        let claimed = claim(&h.scheduler, "q").await;
        assert_eq!(claimed.id, id);
        assert_eq!(claimed.version, expected);
        h.scheduler.fail(&id, &claimed.token).await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_hand_each_task_to_exactly_one_worker() {
    const WORKERS: usize = 12;
    const TASKS: usize = 4;

    let store = Arc::new(MemoryStore::new());
    let scheduler = Scheduler::new(store.clone()).with_claim_policy(ClaimPolicy {
        max_attempts: 50,
        max_jitter: Duration::from_millis(10),
    });
    for i in 0..TASKS {
        create(&scheduler, NewTask::new("q", format!("t{i}"))).await;
    }

    let handles: Vec<_> = (0..WORKERS)
        .map(|_| {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.claim("q").await.unwrap() })
        })
        .collect();

    let mut claimed = Vec::new();
    for handle in handles {
        if let ClaimOutcome::Claimed(task) = handle.await.unwrap() {
            claimed.push(task);
        }
    }

    assert_eq!(claimed.len(), TASKS);
    let ids: HashSet<_> = claimed.iter().map(|t| t.id.clone()).collect();
    let tokens: HashSet<_> = claimed.iter().map(|t| t.token.clone()).collect();
    assert_eq!(ids.len(), TASKS);
    assert_eq!(tokens.len(), TASKS);

    let counts = scheduler.counts("q").await.unwrap();
    assert_eq!(counts.executing, TASKS as u64);
    assert_eq!(counts.pending, 0);
}

#[tokio::test]
async fn claim_returns_contended_after_every_attempt_loses() {
    let store = Arc::new(RacingStore::new(Race::ClaimAlwaysLoses));
    let scheduler = Scheduler::new(store.clone());
    let id = create(&scheduler, NewTask::new("q", "t")).await;

    let outcome = scheduler.claim("q").await.unwrap();

    assert_eq!(outcome, ClaimOutcome::Contended);
    assert!(outcome.into_claimed().is_none());
    assert_eq!(
        store.claim_calls.load(Ordering::SeqCst),
        ClaimPolicy::default().max_attempts as usize
    );

    let task = scheduler.get_task(&id).await.unwrap();
    assert_eq!(task.status, Status::Pending);
    assert_eq!(task.version, 0);
}

#[tokio::test]
async fn claim_attempts_follow_the_policy() {
    let store = Arc::new(RacingStore::new(Race::ClaimAlwaysLoses));
    let scheduler = Scheduler::new(store.clone()).with_claim_policy(ClaimPolicy {
        max_attempts: 5,
        max_jitter: Duration::from_millis(1),
    });
    create(&scheduler, NewTask::new("q", "t")).await;

    assert_eq!(scheduler.claim("q").await.unwrap(), ClaimOutcome::Contended);
    assert_eq!(store.claim_calls.load(Ordering::SeqCst), 5);
}

// ---------------------------------------------------------------------------
// Reporting
// ---------------------------------------------------------------------------

#[tokio::test]
async fn report_that_loses_to_the_reaper_is_token_mismatch() {
    let store = Arc::new(RacingStore::new(Race::ReapBeforeFinish));
    let scheduler = Scheduler::new(store.clone());
    let id = create(&scheduler, NewTask::new("q", "t")).await;
    let claimed = claim(&scheduler, "q").await;

    let err = scheduler
        .complete(&id, &claimed.token, json!("too late"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TokenMismatch { .. }), "got {err:?}");

    let task = scheduler.get_task(&id).await.unwrap();
    assert_eq!(task.status, Status::Pending);
    assert_eq!(task.version, claimed.version + 1);
    assert!(task.execution_id.is_empty());
    assert_eq!(task.task_result, json!(null));
}

#[tokio::test]
async fn success_report_marks_task_done_with_result() {
    let h = harness();
    let id = create(&h.scheduler, NewTask::new("q", "t")).await;
    let claimed = claim(&h.scheduler, "q").await;

    h.clock.advance(chrono::Duration::seconds(3));
    let done = h
        .scheduler
        .complete(&id, &claimed.token, json!({"ok": true}))
        .await
        .unwrap();

    assert_eq!(done.status, Status::Done);
    assert_eq!(done.task_result, json!({"ok": true}));
    assert_eq!(done.execution_end_time, Some(h.clock.now()));
    assert_eq!(done.version, 1);
    assert_eq!(h.scheduler.get_task(&id).await.unwrap(), done);
}

#[tokio::test]
async fn wrong_token_is_rejected_and_leaves_task_unchanged() {
    let h = harness();
    let id = create(&h.scheduler, NewTask::new("q", "t")).await;
    claim(&h.scheduler, "q").await;
    let before = h.scheduler.get_task(&id).await.unwrap();

    let err = h
        .scheduler
        .complete(&id, &ClaimToken::from("not-the-token"), json!(null))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::TokenMismatch { .. }), "got {err:?}");
    assert!(err.is_protocol_violation());
    assert_eq!(h.scheduler.get_task(&id).await.unwrap(), before);
}

#[tokio::test]
async fn report_on_pending_task_is_rejected() {
    let h = harness();
    let id = create(&h.scheduler, NewTask::new("q", "t")).await;

    // An unclaimed task has an empty token, which never matches.
    let err = h
        .scheduler
        .fail(&id, &ClaimToken::from(""))
        .await
        .unwrap_err();
    assert!(err.is_protocol_violation(), "got {err:?}");
}

#[tokio::test]
async fn report_on_missing_task_is_not_found() {
    let h = harness();
    let err = h
        .scheduler
        .fail(&TaskId::from("missing"), &ClaimToken::from("t"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)), "got {err:?}");
}

#[tokio::test]
async fn second_success_report_is_not_executing() {
    let h = harness();
    let id = create(&h.scheduler, NewTask::new("q", "t")).await;
    let claimed = claim(&h.scheduler, "q").await;

    h.scheduler
        .complete(&id, &claimed.token, json!(1))
        .await
        .unwrap();
    let err = h
        .scheduler
        .complete(&id, &claimed.token, json!(2))
        .await
        .unwrap_err();

    assert!(
        matches!(err, Error::NotExecuting { status: Status::Done, .. }),
        "got {err:?}"
    );
    assert_eq!(
        h.scheduler.get_task(&id).await.unwrap().task_result,
        json!(1)
    );
}

#[tokio::test]
async fn failure_with_max_retry_one_allows_exactly_one_retry() {
    let h = harness();
    let id = create(&h.scheduler, NewTask::new("q", "t").max_retry(1)).await;

    let first = claim(&h.scheduler, "q").await;
    let task = h.scheduler.fail(&id, &first.token).await.unwrap();
    assert_eq!(task.status, Status::Pending);
    assert_eq!(task.retried, 1);
    assert!(task.execution_id.is_empty());

    let second = claim(&h.scheduler, "q").await;
    assert_eq!(second.version, first.version + 1);
    let task = h.scheduler.fail(&id, &second.token).await.unwrap();
    assert_eq!(task.status, Status::Error);
    assert_eq!(task.retried, 2);

    let err = h.scheduler.fail(&id, &second.token).await.unwrap_err();
    assert!(
        matches!(err, Error::NotExecuting { status: Status::Error, .. }),
        "got {err:?}"
    );
    assert_eq!(h.scheduler.claim("q").await.unwrap(), ClaimOutcome::Empty);
}

#[tokio::test]
async fn zero_max_retry_errors_on_first_failure() {
    let h = harness();
    let id = create(&h.scheduler, NewTask::new("q", "t").max_retry(0)).await;
    let claimed = claim(&h.scheduler, "q").await;

    let task = h
        .scheduler
        .report(&id, &claimed.token, Report::Failure(Some(json!("boom"))))
        .await
        .unwrap();
    assert_eq!(task.status, Status::Error);
    assert_eq!(task.retried, 1);
    assert_eq!(task.task_result, json!("boom"));
}

#[tokio::test]
async fn requeue_delay_keeps_failed_task_unclaimable_until_due() {
    let h = harness();
    let scheduler = h
        .scheduler
        .clone()
        .with_retry_policy(RetryPolicy::exponential(Duration::from_secs(30), 2.0));
    let id = create(&scheduler, NewTask::new("q", "t")).await;

    let claimed = claim(&scheduler, "q").await;
    let task = scheduler.fail(&id, &claimed.token).await.unwrap();
    assert_eq!(
        task.execution_plan_time,
        h.clock.now() + chrono::Duration::seconds(30)
    );

    h.clock.advance(chrono::Duration::seconds(29));
    assert_eq!(scheduler.claim("q").await.unwrap(), ClaimOutcome::Empty);

    h.clock.advance(chrono::Duration::seconds(1));
    assert_eq!(claim(&scheduler, "q").await.id, id);
}

#[tokio::test]
async fn end_to_end_fail_twice_with_max_retry_one() {
    let h = harness();
    let id = create(
        &h.scheduler,
        NewTask::new("q", "t1")
            .data(json!("x"))
            .max_retry(1)
            .timeout_secs(10),
    )
    .await;

    let first = claim(&h.scheduler, "q").await;
    assert_eq!(first.id, id);
    assert_eq!(first.version, 1);
    let task = h.scheduler.fail(&id, &first.token).await.unwrap();
    assert_eq!((task.status, task.retried), (Status::Pending, 1));

    let second = claim(&h.scheduler, "q").await;
    assert_eq!(second.id, id);
    assert_eq!(second.version, 2);
    assert_ne!(second.token, first.token);
    let task = h.scheduler.fail(&id, &second.token).await.unwrap();
    assert_eq!((task.status, task.retried), (Status::Error, 2));
}

// ---------------------------------------------------------------------------
// Reaper
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reaper_reclaims_expired_claim_and_stale_worker_is_refused() {
    let h = harness();
    let id = create(&h.scheduler, NewTask::new("q", "t").timeout_secs(10)).await;
    let stale = claim(&h.scheduler, "q").await;

    h.clock.advance(chrono::Duration::seconds(11));
    assert_eq!(h.scheduler.reap_expired().await.unwrap(), 1);

    let task = h.scheduler.get_task(&id).await.unwrap();
    assert_eq!(task.status, Status::Pending);
    assert_eq!(task.version, stale.version + 1);
    assert!(task.execution_id.is_empty());
    assert_eq!(task.retried, 0);

    let err = h
        .scheduler
        .complete(&id, &stale.token, json!("late"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TokenMismatch { .. }), "got {err:?}");

    let fresh = claim(&h.scheduler, "q").await;
    assert_eq!(fresh.id, id);
    assert_eq!(fresh.version, stale.version + 2);
}

#[tokio::test]
async fn reaper_leaves_unexpired_claims_alone() {
    let h = harness();
    let id = create(&h.scheduler, NewTask::new("q", "t").timeout_secs(60)).await;
    let claimed = claim(&h.scheduler, "q").await;

    h.clock.advance(chrono::Duration::seconds(59));
    assert_eq!(h.scheduler.reap_expired().await.unwrap(), 0);

    let task = h.scheduler.get_task(&id).await.unwrap();
    assert_eq!(task.status, Status::Executing);
    assert!(task.is_claimed_by(&claimed.token));
}

#[tokio::test]
async fn reaper_loop_stops_on_shutdown() {
    let h = harness();
    create(&h.scheduler, NewTask::new("q", "t").timeout_secs(1)).await;
    claim(&h.scheduler, "q").await;
    h.clock.advance(chrono::Duration::seconds(5));

    let reaper = Reaper::new(h.scheduler.clone(), Duration::from_secs(3600));
    reaper.shutdown();
    tokio::time::timeout(Duration::from_secs(5), reaper.run())
        .await
        .expect("reaper should stop")
        .unwrap();

    // The first pass runs before the shutdown is observed.
    assert_eq!(h.scheduler.counts("q").await.unwrap().pending, 1);
}

// ---------------------------------------------------------------------------
// Retention
// ---------------------------------------------------------------------------

#[tokio::test]
async fn retention_sweep_deletes_only_old_done_tasks() {
    let h = harness();

    let old_done = create(&h.scheduler, NewTask::new("q", "old-done")).await;
    let c = claim(&h.scheduler, "q").await;
    h.scheduler
        .complete(&old_done, &c.token, json!(null))
        .await
        .unwrap();

    let old_error = create(&h.scheduler, NewTask::new("q", "old-error").max_retry(0)).await;
    let c = claim(&h.scheduler, "q").await;
    h.scheduler.fail(&old_error, &c.token).await.unwrap();

    let old_pending = create(&h.scheduler, NewTask::new("q", "old-pending")).await;

    h.clock.advance(chrono::Duration::days(6));
    let recent_done = create(&h.scheduler, NewTask::new("q", "recent-done")).await;
    let c = claim(&h.scheduler, "q").await;
    assert_eq!(c.id, old_pending);
    let c2 = claim(&h.scheduler, "q").await;
    assert_eq!(c2.id, recent_done);
    h.scheduler
        .complete(&recent_done, &c2.token, json!(null))
        .await
        .unwrap();
    h.scheduler
        .fail(&old_pending, &c.token)
        .await
        .unwrap();

    h.clock.advance(chrono::Duration::days(2));
    let purged = h.scheduler.cleanup(None, DEFAULT_RETENTION).await.unwrap();
    assert_eq!(purged, 1);

    assert!(matches!(
        h.scheduler.get_task(&old_done).await,
        Err(Error::NotFound(_))
    ));
    for id in [&old_error, &old_pending, &recent_done] {
        assert!(h.scheduler.get_task(id).await.is_ok(), "{id} should remain");
    }
}

#[tokio::test]
async fn retention_sweep_can_target_one_queue() {
    let h = harness();
    for queue in ["a", "b"] {
        let id = create(&h.scheduler, NewTask::new(queue, "t")).await;
        let c = claim(&h.scheduler, queue).await;
        h.scheduler.complete(&id, &c.token, json!(null)).await.unwrap();
    }

    h.clock.advance(chrono::Duration::days(8));
    assert_eq!(
        h.scheduler
            .cleanup(Some("a"), DEFAULT_RETENTION)
            .await
            .unwrap(),
        1
    );
    assert_eq!(h.scheduler.counts("a").await.unwrap().total(), 0);
    assert_eq!(h.scheduler.counts("b").await.unwrap().done, 1);
}

// ---------------------------------------------------------------------------
// Notification
// ---------------------------------------------------------------------------

#[tokio::test]
async fn completion_notification_fires_once_for_tasks_with_callback() {
    let h = harness();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let scheduler = h
        .scheduler
        .clone()
        .with_notifier(Arc::new(RecordingNotifier { tx }));

    let with_cb = create(
        &scheduler,
        NewTask::new("q", "cb").callback("https://example.com/hook"),
    )
    .await;
    let c = claim(&scheduler, "q").await;
    scheduler
        .complete(&with_cb, &c.token, json!({"answer": 42}))
        .await
        .unwrap();

    let (url, note) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("notification should arrive")
        .expect("channel open");
    assert_eq!(url, "https://example.com/hook");
    assert_eq!(note.id, with_cb);
    assert_eq!(note.status, Status::Done);
    assert_eq!(note.result, json!({"answer": 42}));

    let without_cb = create(&scheduler, NewTask::new("q", "plain")).await;
    let c = claim(&scheduler, "q").await;
    scheduler
        .complete(&without_cb, &c.token, json!(null))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err(), "no further notifications expected");
}

#[tokio::test]
async fn notification_fires_on_error_but_not_on_requeue() {
    let h = harness();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let scheduler = h
        .scheduler
        .clone()
        .with_notifier(Arc::new(RecordingNotifier { tx }));

    let id = create(
        &scheduler,
        NewTask::new("q", "t")
            .callback("http://localhost/hook")
            .max_retry(1),
    )
    .await;

    let c = claim(&scheduler, "q").await;
    scheduler.fail(&id, &c.token).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err(), "requeue must not notify");

    let c = claim(&scheduler, "q").await;
    scheduler.fail(&id, &c.token).await.unwrap();
    let (_, note) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("notification should arrive")
        .expect("channel open");
    assert_eq!(note.status, Status::Error);
}

#[tokio::test]
async fn deliver_sends_the_finished_task_and_waits() {
    let h = harness();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let notifier = RecordingNotifier { tx };

    let id = create(
        &h.scheduler,
        NewTask::new("q", "t").callback("https://example.com/hook"),
    )
    .await;
    let c = claim(&h.scheduler, "q").await;
    let task = h.scheduler.fail(&id, &c.token).await.unwrap();
    assert!(!deliver(&notifier, &task).await.unwrap(), "requeued task is not announced");

    let c = claim(&h.scheduler, "q").await;
    let task = h
        .scheduler
        .complete(&id, &c.token, json!("ok"))
        .await
        .unwrap();
    assert!(deliver(&notifier, &task).await.unwrap());

    // Delivered before `deliver` returned, and only once.
    let (url, note) = rx.try_recv().expect("notification sent inline");
    assert_eq!(url, "https://example.com/hook");
    assert_eq!((note.id, note.status), (id, Status::Done));
    assert!(rx.try_recv().is_err());
}

// ---------------------------------------------------------------------------
// Listing and deletion
// ---------------------------------------------------------------------------

#[tokio::test]
async fn list_pages_in_plan_time_order_and_filters_status() {
    let h = harness();
    let base = h.clock.now();
    let mut ids = Vec::new();
    for i in 0..5 {
        let at = base - chrono::Duration::minutes(10 - i);
        ids.push(create(&h.scheduler, NewTask::new("q", format!("t{i}")).plan_at(at)).await);
    }
    claim(&h.scheduler, "q").await;

    let page = h
        .scheduler
        .list_tasks(&ListQuery::new("q").page(1, 2))
        .await
        .unwrap();
    let page_ids: Vec<_> = page.iter().map(|t| t.id.clone()).collect();
    assert_eq!(page_ids, ids[1..3].to_vec());

    let pending = h
        .scheduler
        .list_tasks(&ListQuery::new("q").status(Status::Pending))
        .await
        .unwrap();
    assert_eq!(pending.len(), 4);
    assert!(pending.iter().all(|t| t.status == Status::Pending));
}

#[tokio::test]
async fn list_rejects_bad_paging() {
    let h = harness();
    for (offset, limit) in [(-1, 10), (0, 0), (0, 101)] {
        let err = h
            .scheduler
            .list_tasks(&ListQuery::new("q").page(offset, limit))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)), "got {err:?}");
    }
}

#[tokio::test]
async fn delete_removes_task_in_any_status() {
    let h = harness();
    let id = create(&h.scheduler, NewTask::new("q", "t")).await;
    claim(&h.scheduler, "q").await;

    assert!(h.scheduler.delete_task(&id).await.unwrap());
    assert!(!h.scheduler.delete_task(&id).await.unwrap());
    assert!(h.store.get(&id).await.unwrap().is_none());
}
