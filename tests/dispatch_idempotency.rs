mod common;
use crate::common::{init_tracing, no_overrides, runner_with_dispatcher, with_timeout};

use std::collections::BTreeMap;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use sigstep::dispatch::{Dispatcher, TaskFailure, TaskSpec, TaskState};
use sigstep::exec::{FailureReason, IterationStatus, RunOptions, RunOutcome};
use sigstep::fs::mock::MockFileSystem;
use sigstep::sig::{MemorySignatureStore, SignatureStore};
use sigstep_test_utils::builders::StepBuilder;
use sigstep_test_utils::fake_remote::FakeRemote;

type TestResult = Result<(), Box<dyn Error>>;

fn spec(body: &str, host: &str) -> TaskSpec {
    TaskSpec {
        step: "s".to_string(),
        index: 0,
        body: body.to_string(),
        bindings: BTreeMap::new(),
        outputs: vec![],
        host: host.to_string(),
    }
}

async fn wait_for_executions(
    executions: &Arc<std::sync::Mutex<Vec<TaskSpec>>>,
    count: usize,
) {
    for _ in 0..100 {
        if executions.lock().unwrap().len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {} executions", count);
}

#[tokio::test]
async fn identical_submissions_share_one_task_and_one_execution() -> TestResult {
    init_tracing();

    let (remote, gate) = FakeRemote::succeeding().gated();
    let executions = remote.executions();
    let dispatcher = Dispatcher::new(Arc::new(remote));

    let id1 = dispatcher.submit(spec("echo hi", "worker1"), false);
    wait_for_executions(&executions, 1).await;

    // Same content and host while the first instance is still running.
    let id2 = dispatcher.submit(spec("echo hi", "worker1"), false);
    assert_eq!(id1, id2);
    assert_eq!(executions.lock().unwrap().len(), 1);

    gate.notify_one();
    let state = with_timeout(dispatcher.wait(&id1)).await?;
    assert_eq!(state, TaskState::Succeeded);

    // Resubmission after success is also idempotent.
    let id3 = dispatcher.submit(spec("echo hi", "worker1"), false);
    assert_eq!(id1, id3);
    assert_eq!(executions.lock().unwrap().len(), 1);

    // Different content gets a different task.
    let other = dispatcher.submit(spec("echo bye", "worker1"), false);
    assert_ne!(id1, other);

    Ok(())
}

#[tokio::test]
async fn force_requeues_despite_prior_success() -> TestResult {
    init_tracing();

    let remote = FakeRemote::succeeding();
    let executions = remote.executions();
    let dispatcher = Dispatcher::new(Arc::new(remote));

    let id = dispatcher.submit(spec("echo hi", "worker1"), false);
    let state = with_timeout(dispatcher.wait(&id)).await?;
    assert_eq!(state, TaskState::Succeeded);
    assert_eq!(executions.lock().unwrap().len(), 1);

    let id2 = dispatcher.submit(spec("echo hi", "worker1"), true);
    assert_eq!(id, id2);
    let state = with_timeout(dispatcher.wait(&id2)).await?;
    assert_eq!(state, TaskState::Succeeded);
    assert_eq!(executions.lock().unwrap().len(), 2);

    Ok(())
}

#[tokio::test]
async fn unreachable_host_is_reported_not_retried_by_dispatcher() -> TestResult {
    init_tracing();

    let remote = FakeRemote::succeeding().unreachable_times(1);
    let executions = remote.executions();
    let dispatcher = Dispatcher::new(Arc::new(remote));

    let id = dispatcher.submit(spec("echo hi", "badhost"), false);
    let state = with_timeout(dispatcher.wait(&id)).await?;
    assert!(matches!(
        state,
        TaskState::Failed(TaskFailure::Unreachable(_))
    ));
    // The dispatcher made exactly one attempt.
    assert_eq!(executions.lock().unwrap().len(), 0);

    // A failed task may be resubmitted without force; the budget is spent,
    // so this attempt goes through.
    let id2 = dispatcher.submit(spec("echo hi", "badhost"), false);
    assert_eq!(id, id2);
    let state = with_timeout(dispatcher.wait(&id2)).await?;
    assert_eq!(state, TaskState::Succeeded);
    assert_eq!(executions.lock().unwrap().len(), 1);

    Ok(())
}

#[tokio::test]
async fn executor_retries_unreachable_dispatch_with_backoff() -> TestResult {
    init_tracing();

    let remote = FakeRemote::succeeding().unreachable_times(2);
    let executions = remote.executions();
    let dispatcher = Dispatcher::new(Arc::new(remote));

    let step = StepBuilder::new("ext", "echo {i}")
        .param_int("num", 1)
        .range("i", "num")
        .external("worker1")
        .build();

    let store: Arc<dyn SignatureStore> = Arc::new(MemorySignatureStore::new());
    let runner = runner_with_dispatcher(
        Arc::clone(&store),
        Arc::new(MockFileSystem::new()),
        dispatcher,
        RunOptions {
            retry_base_delay: Duration::from_millis(10),
            ..RunOptions::default()
        },
    );

    let report = with_timeout(runner.run(&step, &no_overrides())).await?;
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(executions.lock().unwrap().len(), 1);

    Ok(())
}

#[tokio::test]
async fn executor_gives_up_after_bounded_attempts() -> TestResult {
    init_tracing();

    let remote = FakeRemote::succeeding().unreachable_times(10);
    let dispatcher = Dispatcher::new(Arc::new(remote));

    let step = StepBuilder::new("ext", "echo {i}")
        .param_int("num", 1)
        .range("i", "num")
        .external("downhost")
        .build();

    let store: Arc<dyn SignatureStore> = Arc::new(MemorySignatureStore::new());
    let runner = runner_with_dispatcher(
        Arc::clone(&store),
        Arc::new(MockFileSystem::new()),
        dispatcher,
        RunOptions {
            max_dispatch_attempts: 3,
            retry_base_delay: Duration::from_millis(5),
            ..RunOptions::default()
        },
    );

    let report = with_timeout(runner.run(&step, &no_overrides())).await?;
    assert_eq!(report.outcome, RunOutcome::Failed);
    assert!(matches!(
        report.iterations[0].status,
        IterationStatus::Failed(FailureReason::Dispatch {
            unreachable: true,
            ..
        })
    ));

    Ok(())
}

#[tokio::test]
async fn external_success_commits_signature_and_later_runs_skip() -> TestResult {
    init_tracing();

    let remote = FakeRemote::succeeding();
    let executions = remote.executions();
    let dispatcher = Dispatcher::new(Arc::new(remote));

    let step = StepBuilder::new("ext", "echo {i}")
        .param_int("num", 2)
        .range("i", "num")
        .external("worker1")
        .build();

    let store: Arc<dyn SignatureStore> = Arc::new(MemorySignatureStore::new());
    let runner = runner_with_dispatcher(
        Arc::clone(&store),
        Arc::new(MockFileSystem::new()),
        dispatcher,
        RunOptions::default(),
    );

    let first = with_timeout(runner.run(&step, &no_overrides())).await?;
    assert_eq!(first.completed(), 2);
    assert_eq!(executions.lock().unwrap().len(), 2);

    // The second run never reaches the dispatcher.
    let second = with_timeout(runner.run(&step, &no_overrides())).await?;
    assert_eq!(second.skipped(), 2);
    assert_eq!(executions.lock().unwrap().len(), 2);

    Ok(())
}

#[tokio::test]
async fn remote_task_failure_marks_iteration_failed() -> TestResult {
    init_tracing();

    let remote = FakeRemote::with_exit_code(2);
    let dispatcher = Dispatcher::new(Arc::new(remote));

    let step = StepBuilder::new("ext", "exit 2")
        .param_int("num", 1)
        .range("i", "num")
        .external("worker1")
        .build();

    let store: Arc<dyn SignatureStore> = Arc::new(MemorySignatureStore::new());
    let runner = runner_with_dispatcher(
        Arc::clone(&store),
        Arc::new(MockFileSystem::new()),
        dispatcher,
        RunOptions::default(),
    );

    let report = with_timeout(runner.run(&step, &no_overrides())).await?;
    assert_eq!(report.outcome, RunOutcome::Failed);
    assert!(matches!(
        report.iterations[0].status,
        IterationStatus::Failed(FailureReason::Dispatch {
            unreachable: false,
            ..
        })
    ));

    Ok(())
}
