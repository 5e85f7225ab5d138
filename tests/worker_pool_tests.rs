mod test_harness;

use std::time::Duration;

use queuectl::scheduler::dead_letter::MAX_RETRIES_EXCEEDED;
use queuectl::scheduler::JobState;
use queuectl::QueueError;
use test_harness::{assert_eventually, Script, ScriptedRunner, TestDb};
use tokio_util::sync::CancellationToken;

const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_pool_completes_successful_job() {
    let db = TestDb::new();
    let runner = ScriptedRunner::new();
    let mut engine = db.engine(runner.clone());

    engine.submit("j1", "echo hello", None).unwrap();
    engine.start_pool(1).unwrap();

    assert_eventually(
        || {
            let queue = engine.queue();
            async move {
                queue.get("j1").unwrap().map(|job| job.state) == Some(JobState::Completed)
            }
        },
        SETTLE_TIMEOUT,
        "j1 should complete",
    )
    .await;

    engine.stop_pool().await.unwrap();
    assert_eq!(engine.queue().get("j1").unwrap().unwrap().attempts, 0);
    assert_eq!(runner.call_count("echo hello"), 1);

    // The job ends up in exactly one state
    assert!(engine.list(JobState::Pending).unwrap().is_empty());
    assert!(engine.list(JobState::Processing).unwrap().is_empty());
    assert_eq!(engine.list(JobState::Completed).unwrap().len(), 1);
}

#[tokio::test]
async fn test_pool_dead_letters_exhausted_job_and_requeue_resets_it() {
    let db = TestDb::new();
    let runner = ScriptedRunner::new().script("exit 1", Script::Exit(1));
    let mut engine = db.engine(runner.clone());

    engine.submit("j2", "exit 1", Some(2)).unwrap();
    engine.start_pool(1).unwrap();

    assert_eventually(
        || {
            let dead_letters = engine.dead_letters();
            async move { dead_letters.get("j2").unwrap().is_some() }
        },
        SETTLE_TIMEOUT,
        "j2 should land in the dead-letter queue",
    )
    .await;
    engine.stop_pool().await.unwrap();

    let records = engine.dead_letter_list().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].job.id, "j2");
    assert_eq!(records[0].job.attempts, 2);
    assert_eq!(records[0].failed_reason, MAX_RETRIES_EXCEEDED);
    assert!(engine.queue().get("j2").unwrap().is_none());
    assert_eq!(runner.call_count("exit 1"), 2);

    assert!(engine.dead_letter_requeue("j2").unwrap());
    let job = engine.queue().get("j2").unwrap().unwrap();
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempts, 0);
    assert!(engine.dead_letter_list().unwrap().is_empty());

    assert!(!engine.dead_letter_requeue("j2").unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_each_job_runs_exactly_once_across_workers() {
    let db = TestDb::new();
    let runner = ScriptedRunner::new();
    let mut engine = db.engine(runner.clone());

    const JOBS: usize = 40;
    for i in 0..JOBS {
        engine
            .submit(&format!("job-{i}"), &format!("echo {i}"), None)
            .unwrap();
    }
    engine.start_pool(4).unwrap();

    assert_eventually(
        || {
            let queue = engine.queue();
            async move { queue.count_by_state(JobState::Completed).unwrap() == JOBS as u64 }
        },
        SETTLE_TIMEOUT,
        "all jobs should complete",
    )
    .await;
    engine.stop_pool().await.unwrap();

    assert_eq!(runner.calls().len(), JOBS);
    for i in 0..JOBS {
        assert_eq!(runner.call_count(&format!("echo {i}")), 1);
    }
}

#[tokio::test]
async fn test_stop_waits_for_in_flight_job() {
    let db = TestDb::new();
    let runner = ScriptedRunner::new().script("slow", Script::Sleep(Duration::from_millis(300)));
    let mut engine = db.engine(runner);

    engine.submit("slow", "slow", None).unwrap();
    engine.start_pool(1).unwrap();

    assert_eventually(
        || {
            let queue = engine.queue();
            async move {
                queue.get("slow").unwrap().map(|job| job.state) == Some(JobState::Processing)
            }
        },
        SETTLE_TIMEOUT,
        "slow job should be picked up",
    )
    .await;

    engine.stop_pool().await.unwrap();

    assert_eq!(
        engine.queue().get("slow").unwrap().unwrap().state,
        JobState::Completed
    );
    assert_eq!(engine.active_worker_count(), 0);
}

#[tokio::test]
async fn test_stopped_pool_claims_nothing_new() {
    let db = TestDb::new();
    let runner = ScriptedRunner::new();
    let mut engine = db.engine(runner.clone());

    engine.start_pool(2).unwrap();
    assert_eq!(engine.active_worker_count(), 2);
    engine.stop_pool().await.unwrap();
    assert_eq!(engine.active_worker_count(), 0);

    engine.submit("late", "echo late", None).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(
        engine.queue().get("late").unwrap().unwrap().state,
        JobState::Pending
    );
    assert!(runner.calls().is_empty());
}

#[tokio::test]
async fn test_cancelling_token_stops_workers() {
    let db = TestDb::new();
    let mut engine = db.engine(ScriptedRunner::new());
    let token = CancellationToken::new();

    engine.start_pool_with_token(3, token.clone()).unwrap();
    token.cancel();

    assert_eventually(
        || {
            let engine = &engine;
            async move { engine.active_worker_count() == 0 }
        },
        SETTLE_TIMEOUT,
        "workers should exit after cancellation",
    )
    .await;
    engine.stop_pool().await.unwrap();
}

#[tokio::test]
async fn test_stop_request_reaches_running_pool() {
    let db = TestDb::new();
    let mut engine = db.engine(ScriptedRunner::new());
    let token = CancellationToken::new();
    engine.start_pool_with_token(2, token.clone()).unwrap();

    // A second engine on the same database, as another process would have
    let other = db.engine(ScriptedRunner::new());
    assert_eq!(other.status().unwrap().active_workers, 2);
    assert_eq!(other.request_stop().unwrap(), 1);

    assert_eventually(
        || {
            let token = &token;
            async move { token.is_cancelled() }
        },
        SETTLE_TIMEOUT,
        "heartbeat should observe the stop request",
    )
    .await;

    engine.stop_pool().await.unwrap();
    assert_eq!(other.status().unwrap().active_workers, 0);
    assert_eq!(other.request_stop().unwrap(), 0);
}

#[tokio::test]
async fn test_start_pool_rejects_zero_workers() {
    let db = TestDb::new();
    let mut engine = db.engine(ScriptedRunner::new());
    assert!(matches!(
        engine.start_pool(0),
        Err(QueueError::InvalidInput(_))
    ));
    assert_eq!(engine.status().unwrap().active_workers, 0);
}

#[tokio::test]
async fn test_start_pool_twice_is_rejected() {
    let db = TestDb::new();
    let mut engine = db.engine(ScriptedRunner::new());

    engine.start_pool(1).unwrap();
    assert!(matches!(
        engine.start_pool(1),
        Err(QueueError::PoolAlreadyRunning)
    ));

    engine.stop_pool().await.unwrap();
    engine.start_pool(1).unwrap();
    engine.stop_pool().await.unwrap();
}

#[tokio::test]
async fn test_stop_pool_without_pool_is_noop() {
    let db = TestDb::new();
    let mut engine = db.engine(ScriptedRunner::new());
    engine.stop_pool().await.unwrap();
    assert_eq!(engine.active_worker_count(), 0);
}
