mod common;
use crate::common::{init_tracing, no_overrides, overrides, runner_with_action};

use std::error::Error;
use std::sync::Arc;

use sigstep::exec::{IterationStatus, RunOptions, RunOutcome};
use sigstep::fs::mock::MockFileSystem;
use sigstep::fs::RealFileSystem;
use sigstep::sig::{FileSignatureStore, MemorySignatureStore, SignatureKey, SignatureStore};
use sigstep_test_utils::builders::StepBuilder;
use sigstep_test_utils::fake_action::FakeAction;

type TestResult = Result<(), Box<dyn Error>>;

fn statuses(report: &sigstep::exec::RunReport) -> Vec<IterationStatus> {
    report.iterations.iter().map(|it| it.status.clone()).collect()
}

#[tokio::test]
async fn second_run_with_unchanged_parameters_skips_everything() -> TestResult {
    init_tracing();

    let step = StepBuilder::new("no_task", "echo {i}")
        .param_int("num", 2)
        .range("i", "num")
        .build();

    let store: Arc<dyn SignatureStore> = Arc::new(MemorySignatureStore::new());
    let fs = Arc::new(MockFileSystem::new());

    let action = FakeAction::succeeding();
    let executed = action.executed();
    let runner =
        runner_with_action(Arc::clone(&store), fs.clone(), Arc::new(action), RunOptions::default());

    let first = runner.run(&step, &no_overrides()).await?;
    assert_eq!(first.outcome, RunOutcome::Completed);
    assert_eq!(first.completed(), 2);
    assert_eq!(executed.lock().unwrap().len(), 2);

    let second = runner.run(&step, &no_overrides()).await?;
    assert_eq!(second.outcome, RunOutcome::Completed);
    assert_eq!(
        statuses(&second),
        vec![IterationStatus::Skipped, IterationStatus::Skipped]
    );
    // No new executions happened.
    assert_eq!(executed.lock().unwrap().len(), 2);

    Ok(())
}

#[tokio::test]
async fn growing_the_iteration_count_runs_only_new_indices() -> TestResult {
    init_tracing();

    let step = StepBuilder::new("no_task", "echo {i}")
        .param_int("num", 2)
        .range("i", "num")
        .build();

    let store: Arc<dyn SignatureStore> = Arc::new(MemorySignatureStore::new());
    let fs = Arc::new(MockFileSystem::new());
    let action = FakeAction::succeeding();
    let executed = action.executed();
    let runner =
        runner_with_action(Arc::clone(&store), fs, Arc::new(action), RunOptions::default());

    runner.run(&step, &no_overrides()).await?;
    assert_eq!(executed.lock().unwrap().len(), 2);

    // num: 2 → 3. Indices 0 and 1 keep their per-index signatures even
    // though the overall parameter changed.
    let report = runner.run(&step, &overrides(&[("num", 3)])).await?;
    assert_eq!(
        statuses(&report),
        vec![
            IterationStatus::Skipped,
            IterationStatus::Skipped,
            IterationStatus::Completed,
        ]
    );

    let bodies: Vec<String> = executed
        .lock()
        .unwrap()
        .iter()
        .map(|e| e.body.clone())
        .collect();
    assert_eq!(bodies, vec!["echo 0", "echo 1", "echo 2"]);

    Ok(())
}

#[tokio::test]
async fn deleting_a_recorded_output_forces_that_iteration_to_rerun() -> TestResult {
    init_tracing();

    let step = StepBuilder::new("outputs", "touch {i}")
        .param_int("num", 2)
        .range("i", "num")
        .output("test_{i}.txt")
        .build();

    let store: Arc<dyn SignatureStore> = Arc::new(MemorySignatureStore::new());
    let fs = Arc::new(MockFileSystem::new());
    let action = FakeAction::succeeding();
    let executed = action.executed();
    let runner = runner_with_action(
        Arc::clone(&store),
        fs.clone(),
        Arc::new(action),
        RunOptions::default(),
    );

    runner.run(&step, &no_overrides()).await?;
    // The fake action doesn't touch the (mock) disk; create the outputs
    // the records point at so the signatures are valid.
    fs.add_file("test_0.txt", "x");
    fs.add_file("test_1.txt", "x");

    let second = runner.run(&step, &no_overrides()).await?;
    assert_eq!(second.skipped(), 2);
    assert_eq!(executed.lock().unwrap().len(), 2);

    // Parameters unchanged, but a recorded output disappeared.
    fs.delete_file("test_1.txt");

    let third = runner.run(&step, &no_overrides()).await?;
    assert_eq!(
        statuses(&third),
        vec![IterationStatus::Skipped, IterationStatus::Completed]
    );
    assert_eq!(executed.lock().unwrap().len(), 3);

    Ok(())
}

#[tokio::test]
async fn changing_the_action_body_invalidates_signatures() -> TestResult {
    init_tracing();

    let store: Arc<dyn SignatureStore> = Arc::new(MemorySignatureStore::new());
    let fs = Arc::new(MockFileSystem::new());
    let action = FakeAction::succeeding();
    let executed = action.executed();
    let runner =
        runner_with_action(Arc::clone(&store), fs, Arc::new(action), RunOptions::default());

    let step = StepBuilder::new("s", "echo old {i}")
        .param_int("num", 2)
        .range("i", "num")
        .build();
    runner.run(&step, &no_overrides()).await?;

    let edited = StepBuilder::new("s", "echo new {i}")
        .param_int("num", 2)
        .range("i", "num")
        .build();
    let report = runner.run(&edited, &no_overrides()).await?;

    assert_eq!(report.skipped(), 0);
    assert_eq!(report.completed(), 2);
    assert_eq!(executed.lock().unwrap().len(), 4);

    Ok(())
}

#[tokio::test]
async fn force_bypasses_valid_signatures_for_the_whole_run() -> TestResult {
    init_tracing();

    let step = StepBuilder::new("s", "echo {i}")
        .param_int("num", 2)
        .range("i", "num")
        .build();

    let store: Arc<dyn SignatureStore> = Arc::new(MemorySignatureStore::new());
    let fs = Arc::new(MockFileSystem::new());
    let action = FakeAction::succeeding();
    let executed = action.executed();

    let runner = runner_with_action(
        Arc::clone(&store),
        fs.clone(),
        Arc::new(action),
        RunOptions::default(),
    );
    runner.run(&step, &no_overrides()).await?;
    assert_eq!(executed.lock().unwrap().len(), 2);

    let forced_action = FakeAction::succeeding();
    let forced_executed = forced_action.executed();
    let forced_runner = runner_with_action(
        Arc::clone(&store),
        fs,
        Arc::new(forced_action),
        RunOptions {
            force: true,
            ..RunOptions::default()
        },
    );

    let report = forced_runner.run(&step, &no_overrides()).await?;
    assert_eq!(report.skipped(), 0);
    assert_eq!(report.completed(), 2);
    assert_eq!(forced_executed.lock().unwrap().len(), 2);

    Ok(())
}

#[tokio::test]
async fn failed_iterations_do_not_commit_signatures() -> TestResult {
    init_tracing();

    let step = StepBuilder::new("s", "exit 1 # {i}")
        .param_int("num", 2)
        .range("i", "num")
        .build();

    let store: Arc<dyn SignatureStore> = Arc::new(MemorySignatureStore::new());
    let fs = Arc::new(MockFileSystem::new());
    let runner = runner_with_action(
        Arc::clone(&store),
        fs,
        Arc::new(FakeAction::with_exit_code(1)),
        RunOptions::default(),
    );

    let report = runner.run(&step, &no_overrides()).await?;
    assert_eq!(report.outcome, RunOutcome::Failed);
    assert_eq!(report.failed(), 2);

    assert!(store.lookup(&SignatureKey::new("s", 0))?.is_none());
    assert!(store.lookup(&SignatureKey::new("s", 1))?.is_none());

    Ok(())
}

/// End-to-end scenario with the real shell action and a disk-backed store:
/// `num=2` produces `test_0.txt` and `test_1.txt`; an immediate re-run with
/// `num=3` produces only `test_2.txt` while iterations 0 and 1 are skipped.
/// Signatures survive a store reopen (separate "process").
#[tokio::test]
async fn shell_scenario_with_persistent_store() -> TestResult {
    init_tracing();

    let dir = tempfile::tempdir()?;
    let dir_str = dir.path().to_str().unwrap().to_string();

    let step = StepBuilder::new(
        "no_task",
        "echo \"Test_{i}.txt generated\" && touch {dir}/test_{i}.txt",
    )
    .param_int("num", 2)
    .param("dir", sigstep::config::ParamValue::Str(dir_str))
    .range("i", "num")
    .output("{dir}/test_{i}.txt")
    .build();

    let fs: Arc<dyn sigstep::fs::FileSystem> = Arc::new(RealFileSystem);

    {
        let store: Arc<dyn SignatureStore> =
            Arc::new(FileSignatureStore::open(dir.path(), Arc::clone(&fs)));
        let runner = sigstep::exec::StepRunner::new(
            store,
            fs.clone(),
            sigstep::exec::ActionRegistry::with_defaults(),
            None,
            RunOptions::default(),
        );
        let first = runner.run(&step, &no_overrides()).await?;
        assert_eq!(first.completed(), 2);
        assert!(dir.path().join("test_0.txt").is_file());
        assert!(dir.path().join("test_1.txt").is_file());
    }

    // A fresh store instance over the same root observes the signatures of
    // the previous run.
    let store: Arc<dyn SignatureStore> =
        Arc::new(FileSignatureStore::open(dir.path(), Arc::clone(&fs)));
    let runner = sigstep::exec::StepRunner::new(
        store,
        fs,
        sigstep::exec::ActionRegistry::with_defaults(),
        None,
        RunOptions::default(),
    );

    let report = runner.run(&step, &overrides(&[("num", 3)])).await?;
    assert_eq!(
        statuses(&report),
        vec![
            IterationStatus::Skipped,
            IterationStatus::Skipped,
            IterationStatus::Completed,
        ]
    );
    assert!(dir.path().join("test_2.txt").is_file());

    Ok(())
}
