//! End-to-end lifecycle checks against a file-backed store shared by several
//! independent connections, the way separate worker processes would share it.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use autosubmit_core::SchedulerConfig;
use autosubmit_scheduler::{
    ClaimEngine, DispatchOutcome, DispatchWorker, Dispatcher, ExecutionReport, ExecutionRequest,
    Executor, ExecutorError, JobStatus, JobStore, Reconciler, Transition,
};
use chrono::{Duration as ChronoDuration, Utc};

struct CountingOk {
    calls: AtomicU32,
}

#[async_trait]
impl Executor for CountingOk {
    fn name(&self) -> &str {
        "counting-ok"
    }
    async fn execute(&self, _req: &ExecutionRequest) -> Result<ExecutionReport, ExecutorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ExecutionReport {
            ok: true,
            error: None,
            detail: None,
        })
    }
}

struct AlwaysFail;

#[async_trait]
impl Executor for AlwaysFail {
    fn name(&self) -> &str {
        "always-fail"
    }
    async fn execute(&self, _req: &ExecutionRequest) -> Result<ExecutionReport, ExecutorError> {
        Err(ExecutorError::Rejected {
            status: 422,
            message: "required field missing".to_string(),
        })
    }
}

/// Takes 1.5 s per call and records which jobs it ran.
struct Slow {
    ran: std::sync::Mutex<Vec<String>>,
}

#[async_trait]
impl Executor for Slow {
    fn name(&self) -> &str {
        "slow"
    }
    async fn execute(&self, req: &ExecutionRequest) -> Result<ExecutionReport, ExecutorError> {
        tokio::time::sleep(Duration::from_millis(1500)).await;
        self.ran.lock().unwrap().push(req.job_id.clone());
        Ok(ExecutionReport {
            ok: true,
            error: None,
            detail: None,
        })
    }
}

fn config() -> SchedulerConfig {
    SchedulerConfig {
        lease_secs: 5,
        execution_timeout_secs: 2,
        max_attempts: 3,
        retry_backoff_secs: 0,
        dispatch_concurrency: 10,
        ..SchedulerConfig::default()
    }
}

/// A temp database plus a way to open independent connections to it.
struct Db {
    _dir: tempfile::TempDir,
    path: std::path::PathBuf,
}

impl Db {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        Self { _dir: dir, path }
    }

    fn open(&self) -> Arc<JobStore> {
        Arc::new(JobStore::open(&self.path, Duration::from_secs(10)).unwrap())
    }
}

#[tokio::test]
async fn scenario_a_due_job_is_claimed_and_completed() {
    let db = Db::new();
    let store = db.open();
    let job = store
        .for_owner("student-1")
        .create("https://forms.example/f/1", Utc::now() - ChronoDuration::seconds(1))
        .unwrap();

    let claimed = ClaimEngine::new(Arc::clone(&store), &config())
        .claim_batch(10)
        .unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, job.id);

    let executor = Arc::new(CountingOk {
        calls: AtomicU32::new(0),
    });
    let dispatcher = Dispatcher::new(Arc::clone(&store), executor.clone(), &config());
    assert_eq!(
        dispatcher.dispatch(&claimed[0]).await.unwrap(),
        DispatchOutcome::Completed
    );
    assert_eq!(executor.calls.load(Ordering::SeqCst), 1);

    let stored = store.for_owner("student-1").get(&job.id).unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
    assert_eq!(stored.attempt_count, 1);
    assert!(stored.claim_token.is_none());
    assert!(stored.claim_deadline.is_none());
}

#[test]
fn scenario_b_racing_claims_yield_one_winner() {
    let db = Db::new();
    let now = Utc::now();
    db.open()
        .for_owner("student-1")
        .create("https://forms.example/f/1", now - ChronoDuration::seconds(1))
        .unwrap();

    // Two engines, each with its own connection, both observe the job as due.
    let a = db.open();
    let b = db.open();
    let seen_by_a = a.list_due(now, 10).unwrap();
    let seen_by_b = b.list_due(now, 10).unwrap();
    assert_eq!(seen_by_a.len(), 1);
    assert_eq!(seen_by_b.len(), 1);

    let claimed_a = ClaimEngine::new(Arc::clone(&a), &config())
        .claim_batch_at(10, now)
        .unwrap();
    let claimed_b = ClaimEngine::new(Arc::clone(&b), &config())
        .claim_batch_at(10, now)
        .unwrap();
    assert_eq!(claimed_a.len() + claimed_b.len(), 1);

    // The loser's conditional update on the observed candidate also misses.
    let late = b
        .try_claim(
            &seen_by_b[0].id,
            "late-token",
            now + ChronoDuration::seconds(5),
            now,
            3,
        )
        .unwrap();
    assert!(late.is_none());
}

#[test]
fn concurrent_claimers_never_share_a_job() {
    let db = Db::new();
    let now = Utc::now();
    let seed = db.open();
    for i in 0..40 {
        seed.for_owner(&format!("student-{}", i % 4))
            .create(&format!("https://forms.example/f/{i}"), now - ChronoDuration::seconds(i))
            .unwrap();
    }

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let store = db.open();
            std::thread::spawn(move || {
                let engine = ClaimEngine::new(store, &config());
                let mut mine = Vec::new();
                loop {
                    let batch = engine.claim_batch_at(3, now).unwrap();
                    if batch.is_empty() {
                        break;
                    }
                    mine.extend(batch.into_iter().map(|j| j.id));
                }
                mine
            })
        })
        .collect();

    let mut all: Vec<String> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    let total = all.len();
    all.sort();
    all.dedup();
    assert_eq!(total, 40, "every job claimed");
    assert_eq!(all.len(), 40, "no job claimed twice");
}

#[test]
fn scenario_c_expired_lease_is_reconciled() {
    let db = Db::new();
    let store = db.open();
    let now = Utc::now();
    let job = store.for_owner("student-1").create("t", now).unwrap();

    ClaimEngine::new(Arc::clone(&store), &config())
        .claim_batch_at(10, now)
        .unwrap();

    // A separate reconciler process, 6 s later.
    let report = Reconciler::new(db.open(), &config())
        .reconcile_once(now + ChronoDuration::seconds(6))
        .unwrap();
    assert_eq!(report.requeued, 1);

    let stored = store.get_any(&job.id).unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Pending);
    assert_eq!(stored.attempt_count, 1);
    assert!(stored.claim_token.is_none());
    assert!(stored.claim_deadline.is_none());
}

#[tokio::test]
async fn scenario_d_last_attempt_failure_is_terminal() {
    let db = Db::new();
    let store = db.open();
    let cfg = config();
    let job = store.for_owner("student-1").create("t", Utc::now()).unwrap();
    let engine = ClaimEngine::new(Arc::clone(&store), &cfg);
    let dispatcher = Dispatcher::new(Arc::clone(&store), Arc::new(AlwaysFail), &cfg);

    for attempt in 1..cfg.max_attempts {
        let claimed = engine.claim_batch(10).unwrap().remove(0);
        assert_eq!(claimed.attempt_count, attempt);
        assert!(matches!(
            dispatcher.dispatch(&claimed).await.unwrap(),
            DispatchOutcome::Retrying { .. }
        ));
    }

    // attempt_count == max - 1 going in; this failure exhausts the job.
    let claimed = engine.claim_batch(10).unwrap().remove(0);
    assert_eq!(claimed.attempt_count, cfg.max_attempts);
    assert_eq!(
        dispatcher.dispatch(&claimed).await.unwrap(),
        DispatchOutcome::Failed {
            attempt: cfg.max_attempts
        }
    );

    let stored = store.get_any(&job.id).unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.attempt_count, cfg.max_attempts);
    assert_eq!(
        stored.last_error.as_deref(),
        Some("executor rejected request (422): required field missing")
    );
    assert!(engine.claim_batch(10).unwrap().is_empty());
}

#[tokio::test]
async fn scenario_e_deleted_while_claimed_is_not_an_error() {
    let db = Db::new();
    let store = db.open();
    let job = store.for_owner("student-1").create("t", Utc::now()).unwrap();
    let claimed = ClaimEngine::new(Arc::clone(&store), &config())
        .claim_batch(10)
        .unwrap()
        .remove(0);

    // The owner deletes through the API's own connection.
    db.open().for_owner("student-1").delete(&job.id).unwrap();

    let ok = Dispatcher::new(
        Arc::clone(&store),
        Arc::new(CountingOk {
            calls: AtomicU32::new(0),
        }),
        &config(),
    );
    assert_eq!(ok.dispatch(&claimed).await.unwrap(), DispatchOutcome::Cancelled);

    let fail = Dispatcher::new(Arc::clone(&store), Arc::new(AlwaysFail), &config());
    assert_eq!(fail.dispatch(&claimed).await.unwrap(), DispatchOutcome::Cancelled);
    assert!(store.get_any(&job.id).unwrap().is_none());
}

#[tokio::test]
async fn completed_job_survives_a_late_reconcile() {
    let db = Db::new();
    let store = db.open();
    let now = Utc::now();
    let job = store.for_owner("student-1").create("t", now).unwrap();
    let claimed = ClaimEngine::new(Arc::clone(&store), &config())
        .claim_batch(10)
        .unwrap()
        .remove(0);
    let expired = store
        .list_expired_claims(claimed.claim_deadline.unwrap() + ChronoDuration::seconds(1))
        .unwrap();
    assert_eq!(expired.len(), 1);

    // The dispatcher finishes between the reconciler's scan and its write.
    Dispatcher::new(
        Arc::clone(&store),
        Arc::new(CountingOk {
            calls: AtomicU32::new(0),
        }),
        &config(),
    )
    .dispatch(&claimed)
    .await
    .unwrap();

    let stale = &expired[0];
    assert_eq!(
        store
            .reclaim(
                &stale.id,
                stale.claim_token.as_deref().unwrap(),
                stale.claim_deadline.unwrap(),
                stale.claim_deadline.unwrap() + ChronoDuration::seconds(1),
                3,
            )
            .unwrap(),
        Transition::Superseded
    );
    assert_eq!(
        store.get_any(&job.id).unwrap().unwrap().status,
        JobStatus::Completed
    );
}

#[tokio::test]
async fn queued_job_whose_lease_ran_short_is_never_run_twice() {
    let db = Db::new();
    let store = db.open();
    // Two jobs dispatched one at a time: the second waits 1.5 s of its 3 s
    // lease, leaving less than the 2 s execution timeout.
    let cfg = SchedulerConfig {
        lease_secs: 3,
        execution_timeout_secs: 2,
        batch_size: 2,
        dispatch_concurrency: 1,
        max_attempts: 3,
        retry_backoff_secs: 0,
        ..SchedulerConfig::default()
    };
    let now = Utc::now();
    store.for_owner("student-1").create("first", now - ChronoDuration::seconds(2)).unwrap();
    store.for_owner("student-2").create("second", now - ChronoDuration::seconds(1)).unwrap();

    let executor = Arc::new(Slow {
        ran: std::sync::Mutex::new(Vec::new()),
    });
    let worker = DispatchWorker::new(
        ClaimEngine::new(Arc::clone(&store), &cfg),
        Dispatcher::new(Arc::clone(&store), executor.clone(), &cfg),
        &cfg,
    );

    let summary = worker.tick().await.unwrap();
    assert_eq!(summary.claimed, 2);
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.discarded, 1);
    assert_eq!(executor.ran.lock().unwrap().len(), 1);

    // Another replica reaps the stale claim and runs the job exactly once more.
    let reconciled = Reconciler::new(db.open(), &cfg)
        .reconcile_once(Utc::now() + ChronoDuration::seconds(5))
        .unwrap();
    assert_eq!(reconciled.requeued, 1);
    let second = worker.tick().await.unwrap();
    assert_eq!(second.completed, 1);

    let mut ran = executor.ran.lock().unwrap().clone();
    assert_eq!(ran.len(), 2);
    ran.sort();
    ran.dedup();
    assert_eq!(ran.len(), 2, "a job was executed twice");
    assert_eq!(store.status_counts().unwrap().completed, 2);
}
