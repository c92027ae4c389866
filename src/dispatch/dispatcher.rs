// src/dispatch/dispatcher.rs

//! Task table and lifecycle driver.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use chrono::Utc;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use crate::errors::{Result, SigstepError};

use super::remote::{RemoteExecutor, RemoteOutcome};
use super::task::{task_id, TaskFailure, TaskId, TaskRecord, TaskSpec, TaskState};

/// Result of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The cancel signal was delivered to the running/queued task.
    Requested,
    /// The task was already terminal; nothing to do.
    AlreadyTerminal,
    /// No task with that id is known.
    UnknownTask,
}

/// Internal bookkeeping for one submitted task.
///
/// `epoch` distinguishes instances when a force-resubmission replaces the
/// entry while a previous driver is still winding down; a stale driver's
/// state updates are ignored.
struct TaskEntry {
    record: TaskRecord,
    epoch: u64,
    state_tx: watch::Sender<TaskState>,
    cancel: Option<oneshot::Sender<()>>,
}

/// Tracks submitted tasks and relays their state.
///
/// The dispatcher owns each task for its full lifecycle; monitors and
/// presentation layers only hold ids. The actual work happens out of line
/// through the [`RemoteExecutor`]; the dispatcher drives it and publishes
/// transitions on a per-task `watch` channel.
pub struct Dispatcher {
    remote: Arc<dyn RemoteExecutor>,
    tasks: Mutex<HashMap<TaskId, TaskEntry>>,
    epochs: AtomicU64,
}

impl Dispatcher {
    pub fn new(remote: Arc<dyn RemoteExecutor>) -> Arc<Self> {
        Arc::new(Self {
            remote,
            tasks: Mutex::new(HashMap::new()),
            epochs: AtomicU64::new(0),
        })
    }

    /// Submit a unit of work; returns its stable identifier.
    ///
    /// If a task with the same identifier already exists in a non-terminal
    /// or `Succeeded` state, the existing id is returned without
    /// re-queuing. `force` requeues regardless of prior state.
    pub fn submit(self: &Arc<Self>, spec: TaskSpec, force: bool) -> TaskId {
        let id = task_id(&spec);

        {
            let mut map = self.tasks.lock().unwrap();

            if let Some(existing) = map.get(&id) {
                let reusable = !existing.record.state.is_terminal()
                    || existing.record.state == TaskState::Succeeded;
                if reusable && !force {
                    debug!(
                        task = %id,
                        state = ?existing.record.state,
                        "idempotent resubmission; returning existing task"
                    );
                    return id;
                }
                debug!(task = %id, force, "requeuing task");
            }

            let (state_tx, _) = watch::channel(TaskState::Queued);
            let (cancel_tx, cancel_rx) = oneshot::channel();
            let epoch = self.epochs.fetch_add(1, Ordering::Relaxed);
            let now = Utc::now();

            map.insert(
                id.clone(),
                TaskEntry {
                    record: TaskRecord {
                        id: id.clone(),
                        host: spec.host.clone(),
                        state: TaskState::Queued,
                        submitted_at: now,
                        updated_at: now,
                    },
                    epoch,
                    state_tx,
                    cancel: Some(cancel_tx),
                },
            );

            info!(task = %id, host = %spec.host, step = %spec.step, index = spec.index, "task queued");

            let dispatcher = Arc::clone(self);
            let driver_id = id.clone();
            tokio::spawn(async move {
                dispatcher.drive(driver_id, epoch, spec, cancel_rx).await;
            });
        }

        id
    }

    /// Current state of a task. Never blocks on the work itself.
    pub fn get_status(&self, id: &str) -> Option<TaskState> {
        let map = self.tasks.lock().unwrap();
        map.get(id).map(|entry| entry.record.state.clone())
    }

    /// Full bookkeeping record, for presentation-layer lookups.
    pub fn task_info(&self, id: &str) -> Option<TaskRecord> {
        let map = self.tasks.lock().unwrap();
        map.get(id).map(|entry| entry.record.clone())
    }

    /// Ids of every task the dispatcher currently tracks.
    pub fn task_ids(&self) -> Vec<TaskId> {
        let map = self.tasks.lock().unwrap();
        map.keys().cloned().collect()
    }

    /// Request transition to `Cancelled`.
    ///
    /// Cancelling a terminal task is a no-op reported as such, not an
    /// error.
    pub fn cancel(&self, id: &str) -> CancelOutcome {
        let mut map = self.tasks.lock().unwrap();
        let Some(entry) = map.get_mut(id) else {
            return CancelOutcome::UnknownTask;
        };

        if entry.record.state.is_terminal() {
            debug!(task = %id, state = ?entry.record.state, "cancel requested for terminal task; no-op");
            return CancelOutcome::AlreadyTerminal;
        }

        match entry.cancel.take() {
            Some(cancel) => {
                if cancel.send(()).is_err() {
                    debug!(task = %id, "driver already finishing while cancelling");
                }
            }
            None => {
                debug!(task = %id, "cancel already requested");
            }
        }

        info!(task = %id, "cancellation requested");
        CancelOutcome::Requested
    }

    /// Wait until the task reaches a terminal state and return it.
    pub async fn wait(&self, id: &str) -> Result<TaskState> {
        let mut rx = {
            let map = self.tasks.lock().unwrap();
            let entry = map
                .get(id)
                .ok_or_else(|| SigstepError::UnknownTask(id.to_string()))?;
            entry.state_tx.subscribe()
        };

        loop {
            let state = rx.borrow_and_update().clone();
            if state.is_terminal() {
                return Ok(state);
            }
            rx.changed()
                .await
                .map_err(|_| anyhow!("task '{}' was superseded while waiting", id))?;
        }
    }

    /// Drive one task instance to a terminal state.
    async fn drive(
        self: Arc<Self>,
        id: TaskId,
        epoch: u64,
        spec: TaskSpec,
        cancel_rx: oneshot::Receiver<()>,
    ) {
        self.set_state(&id, epoch, TaskState::Running);

        let outcome = self.remote.execute(spec, cancel_rx).await;

        let terminal = match outcome {
            Ok(RemoteOutcome::Exited(0)) => TaskState::Succeeded,
            Ok(RemoteOutcome::Exited(code)) => TaskState::Failed(TaskFailure::Exit(code)),
            Ok(RemoteOutcome::Cancelled) => TaskState::Cancelled,
            Err(err) => {
                warn!(task = %id, error = %err, "target host unreachable");
                TaskState::Failed(TaskFailure::Unreachable(err.to_string()))
            }
        };

        self.set_state(&id, epoch, terminal);
    }

    /// Apply a state transition for the given instance.
    ///
    /// Ignored if the entry was replaced (stale epoch) or is already
    /// terminal — a task that reached `Cancelled` can never move to
    /// `Succeeded`.
    fn set_state(&self, id: &str, epoch: u64, new: TaskState) {
        let mut map = self.tasks.lock().unwrap();
        let Some(entry) = map.get_mut(id) else {
            return;
        };
        if entry.epoch != epoch {
            debug!(task = %id, "dropping state update from superseded instance");
            return;
        }
        if entry.record.state.is_terminal() {
            debug!(
                task = %id,
                current = ?entry.record.state,
                attempted = ?new,
                "ignoring transition out of terminal state"
            );
            return;
        }

        debug!(task = %id, old = ?entry.record.state, new = ?new, "task state transition");
        entry.record.state = new.clone();
        entry.record.updated_at = Utc::now();
        let _ = entry.state_tx.send_replace(new);
    }
}
