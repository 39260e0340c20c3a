//! Scheduler poll loop tests.
//!
//! These tests validate that:
//! - Running jobs never exceed the permit count.
//! - Every exit path of a claimed job stops its heartbeat and frees its permit.
//! - A job whose executor is missing stays running in the store.
//! - Cancellation drains in-flight jobs through their release path.
//! - A claim that finishes after its deadline is handed back, not leaked.
//! - A worker whose job was reclaimed stops heartbeating and leaves the row.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use tempfile::TempDir;

use lease_cron::config::SchedulerConfig;
use lease_cron::db::Database;
use lease_cron::error::{Result, SchedulerError};
use lease_cron::scheduler::{FixedInterval, Job, JobStatus, NewJob, Scheduler};
use lease_cron::store::{JobStore, MemoryJobStore, SqliteJobStore};
use lease_cron::worker::{Executor, LocalFuncExecutor};

/// Executor that records concurrency and blocks until told to finish.
#[derive(Default)]
struct GateExecutor {
    running: AtomicUsize,
    peak: AtomicUsize,
    started: AtomicUsize,
    release: Notify,
}

#[async_trait]
impl Executor for GateExecutor {
    fn name(&self) -> &str {
        "gate"
    }

    async fn exec(&self, cancel: &CancellationToken, _job: &Job) -> Result<()> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.started.fetch_add(1, Ordering::SeqCst);

        let result = tokio::select! {
            _ = self.release.notified() => Ok(()),
            _ = cancel.cancelled() => Err(SchedulerError::Cancelled),
        };
        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

fn test_config(max_concurrency: usize) -> SchedulerConfig {
    SchedulerConfig::new(max_concurrency)
        .with_poll_backoff(Duration::from_millis(10))
        .with_heartbeat_interval(Duration::from_millis(50))
}

fn due_job(name: &str, executor: &str) -> NewJob {
    NewJob::new(name, executor).with_next_time(Utc::now() - chrono::Duration::seconds(1))
}

fn start(scheduler: Arc<Scheduler>) -> (CancellationToken, tokio::task::JoinHandle<Result<()>>) {
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let handle = tokio::spawn(async move { scheduler.run(token).await });
    (shutdown, handle)
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_third_job_waits_for_a_permit() {
    let store = Arc::new(MemoryJobStore::new());
    for name in ["a", "b", "c"] {
        store.insert(due_job(name, "gate")).unwrap();
    }
    let gate = Arc::new(GateExecutor::default());
    let mut scheduler = Scheduler::new(
        store.clone(),
        Arc::new(FixedInterval(Duration::from_secs(3600))),
        test_config(2),
    );
    scheduler.register_executor(gate.clone());
    let scheduler = Arc::new(scheduler);
    let (shutdown, handle) = start(scheduler.clone());

    wait_for(|| gate.started.load(Ordering::SeqCst) == 2).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The third job has not even been claimed while both permits are taken
    assert_eq!(gate.started.load(Ordering::SeqCst), 2);
    assert_eq!(scheduler.in_flight(), 2);
    let running = store
        .jobs()
        .unwrap()
        .into_iter()
        .filter(|j| j.status == JobStatus::Running)
        .count();
    assert_eq!(running, 2);

    gate.release.notify_one();
    wait_for(|| gate.started.load(Ordering::SeqCst) == 3).await;

    gate.release.notify_waiters();
    gate.release.notify_one();
    shutdown.cancel();
    handle.await.unwrap().unwrap();

    assert_eq!(gate.peak.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrency_never_exceeds_permits() {
    let store = Arc::new(MemoryJobStore::new());
    for i in 0..20 {
        store.insert(due_job(&format!("burst-{}", i), "local")).unwrap();
    }

    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicUsize::new(0));
    let local = Arc::new(LocalFuncExecutor::new());
    for i in 0..20 {
        let (running, peak, done) = (running.clone(), peak.clone(), done.clone());
        local.register_func(format!("burst-{}", i), move |_cancel, _job| {
            let (running, peak, done) = (running.clone(), peak.clone(), done.clone());
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
    }

    let mut scheduler = Scheduler::new(
        store.clone(),
        Arc::new(FixedInterval(Duration::from_secs(3600))),
        test_config(3),
    );
    scheduler.register_executor(local);
    let (shutdown, handle) = start(Arc::new(scheduler));

    wait_for(|| done.load(Ordering::SeqCst) == 20).await;
    shutdown.cancel();
    handle.await.unwrap().unwrap();

    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert!(peak.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn test_successful_job_released_and_rescheduled() {
    let store = Arc::new(MemoryJobStore::new());
    let id = store.insert(due_job("report", "local")).unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let local = Arc::new(LocalFuncExecutor::new());
    let counter = runs.clone();
    local.register_func("report", move |_cancel, _job| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });

    let mut scheduler = Scheduler::new(
        store.clone(),
        Arc::new(FixedInterval(Duration::from_secs(3600))),
        test_config(4),
    );
    scheduler.register_executor(local);
    let scheduler = Arc::new(scheduler);
    let before = Utc::now();
    let (shutdown, handle) = start(scheduler.clone());

    wait_for(|| {
        store
            .jobs()
            .unwrap()
            .iter()
            .any(|j| j.id == id && j.status == JobStatus::Waiting && j.version == 1)
    })
    .await;
    shutdown.cancel();
    handle.await.unwrap().unwrap();

    let job = store.find(id).await.unwrap().unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(job.next_time >= before + chrono::Duration::minutes(59));
    assert_eq!(scheduler.leaser().active_heartbeats(), 0);
    assert_eq!(scheduler.in_flight(), 0);
}

#[tokio::test]
async fn test_failed_job_released_without_rescheduling() {
    let store = Arc::new(MemoryJobStore::new());
    let id = store.insert(due_job("flaky", "local")).unwrap();
    let original = store.find(id).await.unwrap().unwrap().next_time;
    let attempts = Arc::new(AtomicUsize::new(0));
    let local = Arc::new(LocalFuncExecutor::new());
    let counter = attempts.clone();
    local.register_func("flaky", move |_cancel, _job| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(SchedulerError::ExecutionFailed("boom".to_string()))
        }
    });

    let mut scheduler = Scheduler::new(
        store.clone(),
        Arc::new(FixedInterval(Duration::from_secs(3600))),
        test_config(1),
    );
    scheduler.register_executor(local);
    let scheduler = Arc::new(scheduler);
    let (shutdown, handle) = start(scheduler.clone());

    // A failed job is still due, so it keeps being picked up
    wait_for(|| attempts.load(Ordering::SeqCst) >= 2).await;
    shutdown.cancel();
    handle.await.unwrap().unwrap();

    let job = store.find(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Waiting);
    assert_eq!(job.next_time, original);
    assert!(job.version >= 2);
    assert_eq!(scheduler.leaser().active_heartbeats(), 0);
    assert_eq!(scheduler.in_flight(), 0);
}

struct PanicExecutor {
    runs: AtomicUsize,
}

#[async_trait]
impl Executor for PanicExecutor {
    fn name(&self) -> &str {
        "panic"
    }

    async fn exec(&self, _cancel: &CancellationToken, _job: &Job) -> Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        panic!("job blew up");
    }
}

#[tokio::test]
async fn test_panicking_job_still_released() {
    let store = Arc::new(MemoryJobStore::new());
    let id = store.insert(due_job("panics", "panic")).unwrap();
    let executor = Arc::new(PanicExecutor {
        runs: AtomicUsize::new(0),
    });

    let mut scheduler = Scheduler::new(
        store.clone(),
        Arc::new(FixedInterval(Duration::from_secs(3600))),
        test_config(1),
    );
    scheduler.register_executor(executor.clone());
    let scheduler = Arc::new(scheduler);
    let (shutdown, handle) = start(scheduler.clone());

    // Claimed again after the first panic, so the first lease was released
    wait_for(|| executor.runs.load(Ordering::SeqCst) >= 2).await;
    shutdown.cancel();
    handle.await.unwrap().unwrap();

    assert_eq!(store.find(id).await.unwrap().unwrap().status, JobStatus::Waiting);
    assert_eq!(scheduler.leaser().active_heartbeats(), 0);
    assert_eq!(scheduler.in_flight(), 0);
}

#[tokio::test]
async fn test_missing_executor_leaves_job_running() {
    let store = Arc::new(MemoryJobStore::new());
    let id = store.insert(due_job("orphan", "remote")).unwrap();
    let gate = Arc::new(GateExecutor::default());

    let mut scheduler = Scheduler::new(
        store.clone(),
        Arc::new(FixedInterval(Duration::from_secs(3600))),
        test_config(1),
    );
    scheduler.register_executor(gate.clone());
    let scheduler = Arc::new(scheduler);
    let (shutdown, handle) = start(scheduler.clone());

    wait_for(|| store.jobs().unwrap()[0].version == 1).await;
    wait_for(|| scheduler.in_flight() == 0).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let job = store.find(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.version, 1);
    assert_eq!(gate.started.load(Ordering::SeqCst), 0);
    assert_eq!(scheduler.leaser().active_heartbeats(), 0);
    assert_eq!(scheduler.in_flight(), 0);

    shutdown.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_heartbeat_refreshed_while_job_runs() {
    let store = Arc::new(MemoryJobStore::new());
    let id = store.insert(due_job("long", "gate")).unwrap();
    let gate = Arc::new(GateExecutor::default());

    let mut scheduler = Scheduler::new(
        store.clone(),
        Arc::new(FixedInterval(Duration::from_secs(3600))),
        test_config(1),
    );
    scheduler.register_executor(gate.clone());
    let scheduler = Arc::new(scheduler);
    let (shutdown, handle) = start(scheduler.clone());

    wait_for(|| gate.started.load(Ordering::SeqCst) == 1).await;
    let claimed_at = store.find(id).await.unwrap().unwrap().heartbeat_at;
    assert_eq!(scheduler.leaser().active_heartbeats(), 1);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let refreshed = store.find(id).await.unwrap().unwrap().heartbeat_at;
    assert!(refreshed > claimed_at);

    gate.release.notify_one();
    wait_for(|| scheduler.leaser().active_heartbeats() == 0).await;
    shutdown.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_shutdown_cancels_and_releases_running_jobs() {
    let store = Arc::new(MemoryJobStore::new());
    store.insert(due_job("one", "gate")).unwrap();
    store.insert(due_job("two", "gate")).unwrap();
    let gate = Arc::new(GateExecutor::default());

    let mut scheduler = Scheduler::new(
        store.clone(),
        Arc::new(FixedInterval(Duration::from_secs(3600))),
        test_config(4),
    );
    scheduler.register_executor(gate.clone());
    let scheduler = Arc::new(scheduler);
    let (shutdown, handle) = start(scheduler.clone());

    wait_for(|| gate.started.load(Ordering::SeqCst) == 2).await;
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("scheduler did not stop")
        .unwrap()
        .unwrap();

    // Cancelled jobs failed, so they went back to waiting without a reschedule
    for job in store.jobs().unwrap() {
        assert_eq!(job.status, JobStatus::Waiting);
        assert_eq!(job.version, 1);
    }
    assert_eq!(gate.running.load(Ordering::SeqCst), 0);
    assert_eq!(scheduler.leaser().active_heartbeats(), 0);
    assert_eq!(scheduler.in_flight(), 0);
}

#[tokio::test]
async fn test_leaser_release_and_abandon_stop_heartbeat() {
    let store = Arc::new(MemoryJobStore::new());
    let first = store.insert(due_job("first", "local")).unwrap();
    store.insert(due_job("second", "local")).unwrap();
    let scheduler = Scheduler::new(
        store.clone(),
        Arc::new(FixedInterval(Duration::from_secs(60))),
        test_config(2),
    );
    let leaser = scheduler.leaser();

    let (job, lease) = leaser.preempt().await.unwrap();
    assert_eq!(lease.job_id(), job.id);
    let (_, other) = leaser.preempt().await.unwrap();
    assert_eq!(leaser.active_heartbeats(), 2);

    leaser.release(lease).await;
    leaser.abandon(other).await;
    assert_eq!(leaser.active_heartbeats(), 0);

    assert_eq!(store.find(first).await.unwrap().unwrap().status, JobStatus::Waiting);
    let statuses: Vec<_> = store.jobs().unwrap().into_iter().map(|j| j.status).collect();
    assert_eq!(statuses, vec![JobStatus::Waiting, JobStatus::Running]);
}

#[tokio::test]
async fn test_dropped_lease_stops_heartbeat() {
    let store = Arc::new(MemoryJobStore::new());
    store.insert(due_job("dropped", "local")).unwrap();
    let scheduler = Scheduler::new(
        store.clone(),
        Arc::new(FixedInterval(Duration::from_secs(60))),
        test_config(1),
    );
    let leaser = scheduler.leaser();

    let (_job, lease) = leaser.preempt().await.unwrap();
    assert_eq!(leaser.active_heartbeats(), 1);
    drop(lease);

    wait_for(|| leaser.active_heartbeats() == 0).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_claim_past_deadline_is_handed_back() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("jobs.db");
    let store = Arc::new(SqliteJobStore::new(Database::open(&path).unwrap()).unwrap());
    let id = store.insert(due_job("contended", "local")).await.unwrap();

    // Another process holds the database for far longer than the claim deadline
    let (locked_tx, locked_rx) = std::sync::mpsc::channel();
    let holder = std::thread::spawn(move || {
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch("BEGIN EXCLUSIVE").unwrap();
        locked_tx.send(()).unwrap();
        std::thread::sleep(Duration::from_secs(2));
        conn.execute_batch("COMMIT").unwrap();
    });
    locked_rx.recv().unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let local = Arc::new(LocalFuncExecutor::new());
    let counter = calls.clone();
    local.register_func("contended", move |_cancel, _job| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });

    let mut scheduler = Scheduler::new(
        store.clone(),
        Arc::new(FixedInterval(Duration::from_secs(3600))),
        test_config(1)
            .with_claim_timeout(Duration::from_millis(300))
            .with_release_timeout(Duration::from_secs(2))
            .with_poll_backoff(Duration::from_millis(50)),
    );
    scheduler.register_executor(local);
    let scheduler = Arc::new(scheduler);
    let (shutdown, handle) = start(scheduler.clone());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let job = store.find(id).await.unwrap().unwrap();
        if calls.load(Ordering::SeqCst) >= 1 && job.status == JobStatus::Waiting {
            assert!(job.next_time > Utc::now());
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job stuck: status={} version={} calls={}",
            job.status,
            job.version,
            calls.load(Ordering::SeqCst)
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    shutdown.cancel();
    handle.await.unwrap().unwrap();
    holder.join().unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.find(id).await.unwrap().unwrap().status, JobStatus::Waiting);
    assert_eq!(scheduler.leaser().active_heartbeats(), 0);
    assert_eq!(scheduler.in_flight(), 0);
}

#[tokio::test]
async fn test_claim_abandoned_on_shutdown_is_handed_back() {
    let store = Arc::new(MemoryJobStore::new());
    let id = store.insert(due_job("late", "local")).unwrap();
    let scheduler = Scheduler::new(
        store.clone(),
        Arc::new(FixedInterval(Duration::from_secs(60))),
        test_config(1),
    );
    let leaser = scheduler.leaser();

    let shutdown = CancellationToken::new();
    shutdown.cancel();
    let err = leaser
        .preempt_within(Duration::from_secs(1), &shutdown)
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::Cancelled));

    leaser.drain_late_claims().await;
    let job = store.find(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Waiting);
    assert_eq!(job.version, 1);
    assert_eq!(leaser.active_heartbeats(), 0);
}

#[tokio::test]
async fn test_preempt_within_deadline_returns_lease() {
    let store = Arc::new(MemoryJobStore::new());
    let id = store.insert(due_job("quick", "local")).unwrap();
    let scheduler = Scheduler::new(
        store.clone(),
        Arc::new(FixedInterval(Duration::from_secs(60))),
        test_config(1),
    );
    let leaser = scheduler.leaser();

    let (job, lease) = leaser
        .preempt_within(Duration::from_secs(1), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(job.id, id);
    assert_eq!(lease.version(), 1);
    assert!(matches!(
        leaser
            .preempt_within(Duration::from_secs(1), &CancellationToken::new())
            .await,
        Err(SchedulerError::NoClaimableJob)
    ));

    leaser.release(lease).await;
    assert_eq!(store.find(id).await.unwrap().unwrap().status, JobStatus::Waiting);
}

#[tokio::test]
async fn test_reclaimed_job_is_left_to_new_owner() {
    let store = Arc::new(MemoryJobStore::new().with_stale_after(Some(Duration::from_millis(50))));
    let id = store.insert(due_job("slow", "local")).unwrap();
    let scheduler = Scheduler::new(
        store.clone(),
        Arc::new(FixedInterval(Duration::from_secs(60))),
        test_config(1).with_heartbeat_interval(Duration::from_secs(3600)),
    );
    let leaser = scheduler.leaser();

    let (job, lease) = leaser.preempt().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let reclaimed = store.preempt().await.unwrap();
    assert_eq!(reclaimed.version, lease.version() + 1);

    // The first worker completes after losing the job
    assert!(matches!(
        leaser.reset_next_time(&job).await,
        Err(SchedulerError::LeaseLost(_))
    ));
    leaser.release(lease).await;

    let row = store.find(id).await.unwrap().unwrap();
    assert_eq!(row.status, JobStatus::Running);
    assert_eq!(row.version, reclaimed.version);
    assert_eq!(row.next_time, reclaimed.next_time);
    assert!(matches!(
        store.preempt().await,
        Err(SchedulerError::NoClaimableJob)
    ));
}

#[tokio::test]
async fn test_heartbeat_stops_when_job_is_reclaimed() {
    let store = Arc::new(MemoryJobStore::new());
    store.insert(due_job("taken", "local")).unwrap();
    let scheduler = Scheduler::new(
        store.clone(),
        Arc::new(FixedInterval(Duration::from_secs(60))),
        test_config(1).with_heartbeat_interval(Duration::from_millis(20)),
    );
    let leaser = scheduler.leaser();

    let (mut job, lease) = leaser.preempt().await.unwrap();
    assert_eq!(leaser.active_heartbeats(), 1);

    // Someone else claims the row under a newer version
    job.version += 1;
    store.put(job).unwrap();
    wait_for(|| leaser.active_heartbeats() == 0).await;

    leaser.abandon(lease).await;
}
