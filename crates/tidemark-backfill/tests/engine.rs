//! End-to-end tests of the backfill engine: plan, run, retry, resume,
//! cancel, and the guards, driven through a mock SQL executor.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tidemark_backfill::{
    BackfillEngine, BackfillError, CancelOutcome, ChunkStatus, ExecuteOptions, FaultInjection,
    PlanRequest, PlanStatus, ResolvedBackfill, StateStore,
};
use tidemark_backfill::options::BackfillConfigFile;
use tidemark_core::{EnvironmentFingerprint, SqlError, SqlExecutor, StatementOutcome};

/// Records every statement, tracks peak concurrency, and optionally sleeps to
/// keep chunks in flight long enough to observe.
#[derive(Default)]
struct MockExecutor {
    statements: Mutex<Vec<String>>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MockExecutor {
    fn new() -> Self {
        Self::default()
    }

    fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    fn statements(&self) -> Vec<String> {
        self.statements.lock().clone()
    }

    fn peak(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SqlExecutor for MockExecutor {
    async fn execute(&self, statement: &str) -> Result<StatementOutcome, SqlError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        self.statements.lock().push(statement.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(StatementOutcome::default())
    }
}

fn ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

const SQL: &str = "INSERT INTO {target} SELECT * FROM raw \
                   WHERE {time_column} >= '{from}' AND {time_column} < '{to}' \
                   /* token: {token} */";

fn engine_with(
    dir: &tempfile::TempDir,
    executor: Arc<MockExecutor>,
    environment: Option<EnvironmentFingerprint>,
) -> BackfillEngine {
    BackfillEngine::new(
        StateStore::new(dir.path()),
        ResolvedBackfill::default(),
        environment,
        executor,
    )
}

fn two_day_request() -> PlanRequest {
    PlanRequest {
        target: "events".to_string(),
        window: Some((ts("2024-01-01T00:00:00Z"), ts("2024-01-03T00:00:00Z"))),
        chunk_hours: None,
        time_column: None,
        sql_template: SQL.to_string(),
        force_window: false,
    }
}

#[tokio::test]
async fn happy_path_runs_every_chunk_once() {
    let dir = tempfile::tempdir().unwrap();
    let executor = Arc::new(MockExecutor::new());
    let engine = engine_with(&dir, Arc::clone(&executor), None);

    let outcome = engine.plan(two_day_request()).unwrap();
    assert!(!outcome.already_existed);
    assert_eq!(outcome.plan.chunks.len(), 2);

    // Planning the same window again loads the existing plan.
    let again = engine.plan(two_day_request()).unwrap();
    assert!(again.already_existed);
    assert_eq!(again.plan.plan_id, outcome.plan.plan_id);

    let run = engine
        .run(&outcome.plan.plan_id, ExecuteOptions::default())
        .await
        .unwrap();

    assert_eq!(run.status, PlanStatus::Completed);
    assert!(run.all_chunks_succeeded());
    for chunk in &run.chunks {
        assert_eq!(chunk.status, ChunkStatus::Done);
        assert_eq!(chunk.attempts, 1);
    }

    // Each chunk's rendered statement went to the executor exactly once.
    // Completion order is unconstrained, so match by token.
    let statements = executor.statements();
    assert_eq!(statements.len(), 2);
    for chunk in &outcome.plan.chunks {
        let hits = statements
            .iter()
            .filter(|s| s.contains(&chunk.idempotency_token))
            .count();
        assert_eq!(hits, 1);
    }
    for stmt in &statements {
        assert!(stmt.contains("INSERT INTO events"));
        assert!(stmt.contains("event_time >="));
    }

    let summary = engine.status(&outcome.plan.plan_id).unwrap();
    assert_eq!(summary.chunks.total, 2);
    assert_eq!(summary.chunks.done, 2);
    assert_eq!(summary.status, PlanStatus::Completed);

    // The event log saw the full lifecycle.
    let events = engine
        .store()
        .read_events(&outcome.plan.plan_id)
        .unwrap();
    assert!(events.len() >= 6); // started + 2x(chunk started/done) + completed
}

#[tokio::test]
async fn simulated_failures_retry_until_done() {
    let dir = tempfile::tempdir().unwrap();
    let executor = Arc::new(MockExecutor::new());
    let engine = engine_with(&dir, Arc::clone(&executor), None);

    let outcome = engine.plan(two_day_request()).unwrap();
    let opts = ExecuteOptions {
        fault: Some(FaultInjection {
            fail_chunk_id: 1,
            fail_count: 2,
        }),
        ..Default::default()
    };
    let run = engine.run(&outcome.plan.plan_id, opts).await.unwrap();

    // Two injected failures, third attempt succeeds (max_retries = 3).
    assert_eq!(run.status, PlanStatus::Completed);
    assert_eq!(run.chunk(0).unwrap().attempts, 1);
    assert_eq!(run.chunk(1).unwrap().attempts, 3);
    assert_eq!(run.chunk(1).unwrap().status, ChunkStatus::Done);

    let summary = engine.status(&outcome.plan.plan_id).unwrap();
    assert_eq!(summary.chunks.total, 2);
    assert_eq!(summary.chunks.done, 2);
}

#[tokio::test]
async fn exhausted_retries_leave_chunk_failed_and_run_continues() {
    let dir = tempfile::tempdir().unwrap();
    let executor = Arc::new(MockExecutor::new());
    let engine = engine_with(&dir, Arc::clone(&executor), None);

    let outcome = engine.plan(two_day_request()).unwrap();
    let opts = ExecuteOptions {
        fault: Some(FaultInjection {
            fail_chunk_id: 0,
            fail_count: 10,
        }),
        ..Default::default()
    };
    let run = engine.run(&outcome.plan.plan_id, opts).await.unwrap();

    assert_eq!(run.status, PlanStatus::Failed);
    let failed = run.chunk(0).unwrap();
    assert_eq!(failed.status, ChunkStatus::Failed);
    assert_eq!(failed.attempts, 3);
    assert!(failed.last_error.as_deref().unwrap().contains("injected"));

    // Failure is local: the other chunk still completed.
    assert_eq!(run.chunk(1).unwrap().status, ChunkStatus::Done);

    // Doctor points at the recovery path.
    let report = engine.doctor(&outcome.plan.plan_id).unwrap();
    assert!(!report.is_healthy());
    assert!(report
        .recommendations
        .iter()
        .any(|r| r.contains("--replay-failed")));
}

#[tokio::test]
async fn resume_skips_done_chunks_and_replays_failed_on_request() {
    let dir = tempfile::tempdir().unwrap();
    let executor = Arc::new(MockExecutor::new());
    let engine = engine_with(&dir, Arc::clone(&executor), None);

    let outcome = engine.plan(two_day_request()).unwrap();
    let plan_id = outcome.plan.plan_id.clone();
    let chunk0_token = outcome.plan.chunks[0].idempotency_token.clone();

    let opts = ExecuteOptions {
        fault: Some(FaultInjection {
            fail_chunk_id: 1,
            fail_count: 10,
        }),
        ..Default::default()
    };
    let run = engine.run(&plan_id, opts).await.unwrap();
    assert_eq!(run.status, PlanStatus::Failed);

    // A failed run is terminal; a plain resume is refused.
    let plain = engine.resume(&plan_id, ExecuteOptions::default()).await;
    assert!(matches!(plain, Err(BackfillError::RunNotResumable { .. })));

    // Replay-aware resume re-executes only the failed chunk.
    let resumed = engine
        .resume(
            &plan_id,
            ExecuteOptions {
                replay_failed: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(resumed.status, PlanStatus::Completed);
    assert!(resumed.replay_failed);
    assert!(!resumed.replay_done);
    assert_eq!(resumed.chunk(1).unwrap().status, ChunkStatus::Done);
    assert_eq!(resumed.chunk(1).unwrap().attempts, 1);

    // Chunk 0 was done before the resume and never re-ran: its token shows
    // up exactly once across every statement the executor ever saw.
    let hits = executor
        .statements()
        .iter()
        .filter(|s| s.contains(&chunk0_token))
        .count();
    assert_eq!(hits, 1);
}

#[tokio::test]
async fn skip_failed_completes_without_reexecuting() {
    let dir = tempfile::tempdir().unwrap();
    let executor = Arc::new(MockExecutor::new());
    let engine = engine_with(&dir, Arc::clone(&executor), None);

    let outcome = engine.plan(two_day_request()).unwrap();
    let plan_id = outcome.plan.plan_id.clone();
    let chunk0_token = outcome.plan.chunks[0].idempotency_token.clone();

    let run = engine
        .run(
            &plan_id,
            ExecuteOptions {
                fault: Some(FaultInjection {
                    fail_chunk_id: 0,
                    fail_count: 10,
                }),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(run.status, PlanStatus::Failed);

    let resumed = engine
        .resume(
            &plan_id,
            ExecuteOptions {
                skip_failed: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(resumed.status, PlanStatus::Completed);
    assert_eq!(resumed.chunk(0).unwrap().status, ChunkStatus::Skipped);
    assert_eq!(resumed.chunk(1).unwrap().status, ChunkStatus::Done);

    // The skipped chunk's statement never reached the executor.
    assert!(executor
        .statements()
        .iter()
        .all(|s| !s.contains(&chunk0_token)));

    let summary = engine.status(&plan_id).unwrap();
    assert_eq!(summary.chunks.skipped, 1);
    assert_eq!(summary.chunks.done, 1);
}

#[tokio::test]
async fn second_run_requires_resume() {
    let dir = tempfile::tempdir().unwrap();
    let executor = Arc::new(MockExecutor::new());
    let engine = engine_with(&dir, Arc::clone(&executor), None);

    let outcome = engine.plan(two_day_request()).unwrap();
    engine
        .run(&outcome.plan.plan_id, ExecuteOptions::default())
        .await
        .unwrap();

    let again = engine
        .run(&outcome.plan.plan_id, ExecuteOptions::default())
        .await;
    assert!(matches!(
        again,
        Err(BackfillError::RunAlreadyExists {
            status: PlanStatus::Completed,
            ..
        })
    ));
}

#[tokio::test]
async fn environment_guard_blocks_mismatch_unless_forced() {
    let prod = EnvironmentFingerprint {
        endpoint: "https://prod.example.com".to_string(),
        database: "analytics".to_string(),
    };
    let staging = EnvironmentFingerprint {
        endpoint: "https://staging.example.com".to_string(),
        database: "analytics".to_string(),
    };

    let dir = tempfile::tempdir().unwrap();
    let executor = Arc::new(MockExecutor::new());

    // Plan bound to prod.
    let prod_engine = engine_with(&dir, Arc::clone(&executor), Some(prod.clone()));
    let outcome = prod_engine.plan(two_day_request()).unwrap();
    assert_eq!(outcome.plan.environment, Some(prod));

    // Running from staging is blocked.
    let staging_engine = engine_with(&dir, Arc::clone(&executor), Some(staging));
    let blocked = staging_engine
        .run(&outcome.plan.plan_id, ExecuteOptions::default())
        .await;
    assert!(matches!(
        blocked,
        Err(BackfillError::EnvironmentMismatch { .. })
    ));

    // Forcing records the override on the run for audit.
    let forced = staging_engine
        .run(
            &outcome.plan.plan_id,
            ExecuteOptions {
                force_environment: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(forced.status, PlanStatus::Completed);
    assert!(forced.forced.contains(&"--force-environment".to_string()));
}

#[tokio::test]
async fn unbound_plan_runs_against_any_environment() {
    let dir = tempfile::tempdir().unwrap();
    let executor = Arc::new(MockExecutor::new());

    // Planned offline, no fingerprint.
    let offline = engine_with(&dir, Arc::clone(&executor), None);
    let outcome = offline.plan(two_day_request()).unwrap();
    assert!(outcome.plan.environment.is_none());

    let live = engine_with(
        &dir,
        Arc::clone(&executor),
        Some(EnvironmentFingerprint {
            endpoint: "https://prod.example.com".to_string(),
            database: "analytics".to_string(),
        }),
    );
    let run = live
        .run(&outcome.plan.plan_id, ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(run.status, PlanStatus::Completed);
}

#[tokio::test]
async fn overlap_guard_blocks_unless_forced() {
    let dir = tempfile::tempdir().unwrap();
    let executor = Arc::new(MockExecutor::new());
    let engine = engine_with(&dir, Arc::clone(&executor), None);

    let first = engine.plan(two_day_request()).unwrap();

    let mut overlapping = two_day_request();
    overlapping.window = Some((ts("2024-01-02T00:00:00Z"), ts("2024-01-04T00:00:00Z")));
    let second = engine.plan(overlapping).unwrap();
    assert_ne!(first.plan.plan_id, second.plan.plan_id);

    // The first plan has no run yet, so it still "touches" the window.
    let blocked = engine
        .run(&second.plan.plan_id, ExecuteOptions::default())
        .await;
    assert!(matches!(blocked, Err(BackfillError::OverlapBlocked { .. })));

    let forced = engine
        .run(
            &second.plan.plan_id,
            ExecuteOptions {
                force_overlap: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(forced.status, PlanStatus::Completed);
    assert!(forced.forced.contains(&"--force-overlap".to_string()));

    // Once the overlapping neighbor completed, the first plan runs cleanly.
    let run = engine
        .run(&first.plan.plan_id, ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(run.status, PlanStatus::Completed);
}

#[tokio::test]
async fn concurrency_stays_within_bound() {
    let dir = tempfile::tempdir().unwrap();
    let executor = Arc::new(MockExecutor::with_delay(Duration::from_millis(100)));

    let file = BackfillConfigFile {
        max_parallel_chunks: Some(2),
        ..Default::default()
    };
    let engine = BackfillEngine::new(
        StateStore::new(dir.path()),
        ResolvedBackfill::from_file(file),
        None,
        Arc::clone(&executor) as Arc<dyn SqlExecutor>,
    );

    let mut req = two_day_request();
    req.window = Some((ts("2024-01-01T00:00:00Z"), ts("2024-01-07T00:00:00Z")));
    let outcome = engine.plan(req).unwrap();
    assert_eq!(outcome.plan.chunks.len(), 6);

    let run = engine
        .run(&outcome.plan.plan_id, ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(run.status, PlanStatus::Completed);
    assert!(executor.peak() >= 2, "parallelism was never exercised");
    assert!(executor.peak() <= 2, "dispatch exceeded max_parallel_chunks");
}

#[tokio::test]
async fn cancel_mid_run_leaves_no_chunk_running() {
    let dir = tempfile::tempdir().unwrap();
    let executor = Arc::new(MockExecutor::with_delay(Duration::from_millis(150)));
    let engine = engine_with(&dir, Arc::clone(&executor), None);

    let mut req = two_day_request();
    req.window = Some((ts("2024-01-01T00:00:00Z"), ts("2024-01-07T00:00:00Z")));
    let outcome = engine.plan(req).unwrap();
    let plan_id = outcome.plan.plan_id.clone();

    let coordinator = engine.coordinator();
    let cancel = coordinator.cancel_handle();
    let handle =
        tokio::spawn(async move { coordinator.run(&plan_id, ExecuteOptions::default()).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.request();

    let run = handle.await.unwrap().unwrap();
    assert_eq!(run.status, PlanStatus::Cancelled);
    // In-flight attempts were drained; nothing is stuck in `running`.
    assert!(run
        .chunks
        .iter()
        .all(|c| c.status != ChunkStatus::Running));
    // The cancel arrived before the whole window was processed.
    assert!(run.chunks.iter().any(|c| c.status == ChunkStatus::Pending));

    // On-disk state agrees with the returned state.
    let persisted = engine.store().load_run(&outcome.plan.plan_id).unwrap();
    assert_eq!(persisted.status, PlanStatus::Cancelled);
    assert!(persisted
        .chunks
        .iter()
        .all(|c| c.status != ChunkStatus::Running));
}

#[tokio::test]
async fn pause_request_stops_coordinator_and_resume_finishes() {
    let dir = tempfile::tempdir().unwrap();
    let executor = Arc::new(MockExecutor::with_delay(Duration::from_millis(120)));
    let engine = engine_with(&dir, Arc::clone(&executor), None);

    let mut req = two_day_request();
    req.window = Some((ts("2024-01-01T00:00:00Z"), ts("2024-01-06T00:00:00Z")));
    let outcome = engine.plan(req).unwrap();
    let plan_id = outcome.plan.plan_id.clone();

    let coordinator = engine.coordinator();
    let spawn_id = plan_id.clone();
    let handle =
        tokio::spawn(async move { coordinator.run(&spawn_id, ExecuteOptions::default()).await });

    // Let the run acquire its lock, then ask it to pause via the marker.
    tokio::time::sleep(Duration::from_millis(60)).await;
    match engine.cancel(&plan_id, true).unwrap() {
        CancelOutcome::Signalled => {}
        CancelOutcome::Applied(_) => panic!("coordinator should have held the lock"),
    }

    let run = handle.await.unwrap().unwrap();
    assert_eq!(run.status, PlanStatus::Paused);

    // Paused is not terminal: a plain resume completes the rest.
    let resumed = engine
        .resume(&plan_id, ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(resumed.status, PlanStatus::Completed);
    assert!(resumed.all_chunks_succeeded());
}
