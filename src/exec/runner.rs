// src/exec/runner.rs

//! Per-iteration state machine and bounded-parallel step runner.
//!
//! Each iteration moves through
//! `PENDING → {SKIPPED | RUNNING → {COMPLETED | FAILED}}`:
//!
//! - a valid saved signature short-circuits to `SKIPPED` with no side
//!   effects and no dispatcher interaction;
//! - local actions occupy a worker permit for their whole execution;
//! - external iterations submit to the dispatcher and suspend *without*
//!   holding a worker permit, which is the reason external tasks are split
//!   from the inline case;
//! - cancellation propagates to running local processes (killed) and to
//!   external tasks (dispatcher `cancel`), while already-terminal
//!   iterations are unaffected.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::model::{ParamValue, Step};
use crate::dispatch::{Dispatcher, TaskFailure, TaskSpec, TaskState};
use crate::errors::{Result, SigstepError};
use crate::expand::{expand, template, IterationContext};
use crate::fs::FileSystem;
use crate::sig::{fingerprint, record_is_valid, SignatureKey, SignatureRecord, SignatureStore};

use super::action::{ActionExecutor, ActionOutcome, ActionRegistry};

/// Options for one run of a step.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Maximum number of concurrently executing local actions.
    pub workers: usize,
    /// Bypass signature validity checks for every iteration of this run.
    pub force: bool,
    /// Stop scheduling new iterations after the first failure; in-flight
    /// iterations still finish and report.
    pub stop_on_first_failure: bool,
    /// Attempts for external dispatch when the host is unreachable.
    pub max_dispatch_attempts: u32,
    /// Delay before the first dispatch retry; doubles per attempt.
    pub retry_base_delay: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            force: false,
            stop_on_first_failure: false,
            max_dispatch_attempts: 3,
            retry_base_delay: Duration::from_millis(500),
        }
    }
}

/// Terminal (or not-reached) status of one iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationStatus {
    /// Never started (run stopped early).
    Pending,
    /// Ignored due to a saved signature.
    Skipped,
    Completed,
    Failed(FailureReason),
}

/// Why an iteration failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// Local action ran and exited non-zero.
    Action { exit_code: i32 },
    /// External dispatch failed (exit status or unreachable host).
    Dispatch { unreachable: bool, message: String },
    /// The run was cancelled before this iteration finished.
    Cancelled,
}

/// Aggregate outcome of a run: the worst outcome among its iterations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone)]
pub struct IterationReport {
    pub index: usize,
    pub status: IterationStatus,
}

/// Final report for one step run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub step: String,
    pub iterations: Vec<IterationReport>,
    pub outcome: RunOutcome,
}

impl RunReport {
    pub fn count(&self, pred: impl Fn(&IterationStatus) -> bool) -> usize {
        self.iterations.iter().filter(|it| pred(&it.status)).count()
    }

    pub fn skipped(&self) -> usize {
        self.count(|s| matches!(s, IterationStatus::Skipped))
    }

    pub fn completed(&self) -> usize {
        self.count(|s| matches!(s, IterationStatus::Completed))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, IterationStatus::Failed(_)))
    }
}

/// Handle used to cancel an in-flight run.
pub struct RunCancel {
    tx: watch::Sender<bool>,
}

impl RunCancel {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, rx)
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Shared state cloned into every iteration future.
struct RunShared {
    step_name: String,
    external: bool,
    host: Option<String>,
    store: Arc<dyn SignatureStore>,
    fs: Arc<dyn FileSystem>,
    action: Arc<dyn ActionExecutor>,
    dispatcher: Option<Arc<Dispatcher>>,
    options: RunOptions,
    semaphore: Arc<Semaphore>,
    stop: Arc<AtomicBool>,
}

/// Runs one step's full iteration sequence.
pub struct StepRunner {
    store: Arc<dyn SignatureStore>,
    fs: Arc<dyn FileSystem>,
    actions: ActionRegistry,
    dispatcher: Option<Arc<Dispatcher>>,
    options: RunOptions,
}

impl StepRunner {
    pub fn new(
        store: Arc<dyn SignatureStore>,
        fs: Arc<dyn FileSystem>,
        actions: ActionRegistry,
        dispatcher: Option<Arc<Dispatcher>>,
        options: RunOptions,
    ) -> Self {
        Self {
            store,
            fs,
            actions,
            dispatcher,
            options,
        }
    }

    /// Run the step to completion without external cancellation.
    pub async fn run(
        &self,
        step: &Step,
        overrides: &BTreeMap<String, ParamValue>,
    ) -> Result<RunReport> {
        let (_cancel, rx) = RunCancel::new();
        self.run_with_cancel(step, overrides, rx).await
    }

    /// Run the step, aborting in-flight work when `cancel` flips to true.
    pub async fn run_with_cancel(
        &self,
        step: &Step,
        overrides: &BTreeMap<String, ParamValue>,
        cancel: watch::Receiver<bool>,
    ) -> Result<RunReport> {
        let expansion = expand(step, overrides)?;
        expansion.check_output_collisions()?;

        let action = self.actions.get(&step.kind)?;
        if step.external && self.dispatcher.is_none() {
            return Err(SigstepError::ConfigError(format!(
                "step '{}' is external but no dispatcher is configured",
                step.name
            )));
        }

        let total = expansion.len();
        info!(
            step = %step.name,
            iterations = total,
            external = step.external,
            force = self.options.force,
            "starting step run"
        );

        let shared = Arc::new(RunShared {
            step_name: step.name.clone(),
            external: step.external,
            host: step.host.clone(),
            store: Arc::clone(&self.store),
            fs: Arc::clone(&self.fs),
            action,
            dispatcher: self.dispatcher.clone(),
            options: self.options.clone(),
            semaphore: Arc::new(Semaphore::new(self.options.workers.max(1))),
            stop: Arc::new(AtomicBool::new(false)),
        });

        // Render every body up front so template errors surface before any
        // execution, then fan out.
        let mut prepared = Vec::with_capacity(total);
        for ctx in expansion.contexts() {
            let ctx = ctx?;
            let body = template::render(&step.action, &ctx.bindings)?;
            prepared.push((ctx, body));
        }

        let mut join_set: JoinSet<(usize, IterationStatus)> = JoinSet::new();
        for (ctx, body) in prepared {
            let shared = Arc::clone(&shared);
            let cancel = cancel.clone();
            join_set.spawn(run_iteration(shared, ctx, body, cancel));
        }

        let mut statuses = vec![IterationStatus::Pending; total];
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, status)) => statuses[index] = status,
                Err(err) => error!(step = %step.name, error = %err, "iteration task panicked"),
            }
        }

        if let Err(err) = self.store.flush() {
            warn!(step = %step.name, error = %err, "failed to flush signature store");
        }

        let report = build_report(&step.name, statuses);
        info!(
            step = %report.step,
            outcome = ?report.outcome,
            skipped = report.skipped(),
            completed = report.completed(),
            failed = report.failed(),
            "step run finished"
        );
        Ok(report)
    }
}

fn build_report(step: &str, statuses: Vec<IterationStatus>) -> RunReport {
    let mut outcome = RunOutcome::Completed;
    for status in &statuses {
        match status {
            IterationStatus::Failed(FailureReason::Cancelled) => {
                if outcome == RunOutcome::Completed {
                    outcome = RunOutcome::Cancelled;
                }
            }
            IterationStatus::Failed(_) => outcome = RunOutcome::Failed,
            _ => {}
        }
    }

    RunReport {
        step: step.to_string(),
        iterations: statuses
            .into_iter()
            .enumerate()
            .map(|(index, status)| IterationReport { index, status })
            .collect(),
        outcome,
    }
}

/// Drive a single iteration to a terminal status.
async fn run_iteration(
    shared: Arc<RunShared>,
    ctx: IterationContext,
    body: String,
    mut cancel: watch::Receiver<bool>,
) -> (usize, IterationStatus) {
    let index = ctx.index;
    let key = SignatureKey::new(&shared.step_name, index);
    let current_fp = fingerprint(&ctx.bindings, &body);

    // PENDING: consult the signature store first; a valid record means no
    // side effects and no dispatcher interaction at all.
    if !shared.options.force {
        match shared.store.lookup(&key) {
            Ok(Some(record)) if record_is_valid(&record, &current_fp, shared.fs.as_ref()) => {
                info!(key = %key, "iteration ignored due to saved signature");
                return (index, IterationStatus::Skipped);
            }
            Ok(_) => {}
            Err(err) => {
                // Store trouble must never hide required work; treat the
                // record as absent and execute.
                warn!(key = %key, error = %err, "signature lookup failed; treating as absent");
            }
        }
    }

    if shared.stop.load(Ordering::Relaxed) {
        debug!(key = %key, "run stopped before iteration started");
        return (index, IterationStatus::Pending);
    }
    if *cancel.borrow() {
        return (index, IterationStatus::Failed(FailureReason::Cancelled));
    }

    let status = if shared.external {
        run_external(&shared, &ctx, &body, &mut cancel).await
    } else {
        run_local(&shared, &ctx, &body, &mut cancel).await
    };

    if matches!(
        status,
        IterationStatus::Failed(FailureReason::Action { .. })
            | IterationStatus::Failed(FailureReason::Dispatch { .. })
    ) && shared.options.stop_on_first_failure
    {
        shared.stop.store(true, Ordering::Relaxed);
    }

    if status == IterationStatus::Completed {
        let record = SignatureRecord {
            fingerprint: current_fp,
            outputs: ctx.outputs.clone(),
        };
        if let Err(err) = shared.store.commit(&key, record) {
            // Under-caching is safe: the iteration completed, it will just
            // re-run next time.
            warn!(key = %key, error = %err, "signature commit failed");
        }
    }

    (index, status)
}

/// RUNNING (local): execute the action inline, holding a worker permit.
async fn run_local(
    shared: &Arc<RunShared>,
    ctx: &IterationContext,
    body: &str,
    cancel: &mut watch::Receiver<bool>,
) -> IterationStatus {
    let _permit = tokio::select! {
        permit = Arc::clone(&shared.semaphore).acquire_owned() => match permit {
            Ok(p) => p,
            Err(_) => return IterationStatus::Pending,
        },
        _ = wait_cancelled(cancel) => {
            return IterationStatus::Failed(FailureReason::Cancelled);
        }
    };

    if shared.stop.load(Ordering::Relaxed) {
        return IterationStatus::Pending;
    }

    info!(step = %shared.step_name, index = ctx.index, "running iteration");

    let (cancel_tx, cancel_rx) = oneshot::channel();
    let mut fut = shared
        .action
        .execute(body.to_string(), ctx.bindings.clone(), cancel_rx);

    let outcome = tokio::select! {
        result = &mut fut => result,
        _ = wait_cancelled(cancel) => {
            let _ = cancel_tx.send(());
            fut.await
        }
    };

    match outcome {
        Ok(ActionOutcome::Finished(out)) => {
            if !out.stdout.is_empty() {
                // Action output belongs to the caller's stdout.
                print!("{}", out.stdout);
            }
            if !out.stderr.is_empty() {
                debug!(step = %shared.step_name, index = ctx.index, "stderr: {}", out.stderr.trim_end());
            }
            if out.exit_code == 0 {
                IterationStatus::Completed
            } else {
                warn!(
                    step = %shared.step_name,
                    index = ctx.index,
                    exit_code = out.exit_code,
                    "iteration action failed"
                );
                IterationStatus::Failed(FailureReason::Action {
                    exit_code: out.exit_code,
                })
            }
        }
        Ok(ActionOutcome::Cancelled) => {
            IterationStatus::Failed(FailureReason::Cancelled)
        }
        Err(err) => {
            warn!(step = %shared.step_name, index = ctx.index, error = %err, "action could not start");
            IterationStatus::Failed(FailureReason::Action { exit_code: -1 })
        }
    }
}

/// RUNNING (external): hand off to the dispatcher and suspend until the
/// task reaches a terminal state. No worker permit is held while waiting.
async fn run_external(
    shared: &Arc<RunShared>,
    ctx: &IterationContext,
    body: &str,
    cancel: &mut watch::Receiver<bool>,
) -> IterationStatus {
    let Some(dispatcher) = shared.dispatcher.as_ref() else {
        // Checked before the fan-out; kept as a guard.
        return IterationStatus::Failed(FailureReason::Dispatch {
            unreachable: false,
            message: "no dispatcher configured".to_string(),
        });
    };
    let host = shared.host.clone().unwrap_or_else(|| "localhost".to_string());

    let spec = TaskSpec {
        step: shared.step_name.clone(),
        index: ctx.index,
        body: body.to_string(),
        bindings: ctx.bindings.clone(),
        outputs: ctx.outputs.clone(),
        host,
    };

    let mut delay = shared.options.retry_base_delay;
    let attempts = shared.options.max_dispatch_attempts.max(1);

    for attempt in 1..=attempts {
        let task_id = dispatcher.submit(spec.clone(), shared.options.force);
        debug!(
            step = %shared.step_name,
            index = ctx.index,
            task = %task_id,
            attempt,
            "iteration dispatched"
        );

        let state = tokio::select! {
            waited = dispatcher.wait(&task_id) => match waited {
                Ok(state) => state,
                Err(err) => {
                    warn!(task = %task_id, error = %err, "lost track of dispatched task");
                    return IterationStatus::Failed(FailureReason::Dispatch {
                        unreachable: false,
                        message: err.to_string(),
                    });
                }
            },
            _ = wait_cancelled(cancel) => {
                dispatcher.cancel(&task_id);
                match dispatcher.wait(&task_id).await {
                    Ok(state) => state,
                    Err(_) => TaskState::Cancelled,
                }
            }
        };

        match state {
            TaskState::Succeeded => return IterationStatus::Completed,
            TaskState::Cancelled => {
                return IterationStatus::Failed(FailureReason::Cancelled)
            }
            TaskState::Failed(TaskFailure::Unreachable(message)) => {
                if attempt < attempts {
                    warn!(
                        task = %task_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "host unreachable; retrying dispatch"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    continue;
                }
                return IterationStatus::Failed(FailureReason::Dispatch {
                    unreachable: true,
                    message,
                });
            }
            TaskState::Failed(TaskFailure::Exit(code)) => {
                return IterationStatus::Failed(FailureReason::Dispatch {
                    unreachable: false,
                    message: format!("task exited with code {}", code),
                });
            }
            TaskState::Queued | TaskState::Running => {
                // wait() only returns terminal states; keep a guard.
                return IterationStatus::Failed(FailureReason::Dispatch {
                    unreachable: false,
                    message: format!("unexpected non-terminal state {:?}", state),
                });
            }
        }
    }

    IterationStatus::Failed(FailureReason::Dispatch {
        unreachable: true,
        message: "dispatch attempts exhausted".to_string(),
    })
}

/// Resolve once the run-wide cancel flag flips to true; never resolves if
/// the flag stays false (including when the handle is dropped).
async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    if *rx.borrow() {
        return;
    }
    loop {
        if rx.changed().await.is_err() {
            // Cancel handle dropped without firing.
            std::future::pending::<()>().await;
        }
        if *rx.borrow() {
            return;
        }
    }
}
