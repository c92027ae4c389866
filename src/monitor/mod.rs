// src/monitor/mod.rs

//! Status monitor: polls dispatcher state for outstanding tasks and emits
//! transition events to a registered sink.
//!
//! The monitor only *references* tasks; the dispatcher owns them. Both
//! push (event sink) and pull (`Dispatcher::get_status`) consumers are
//! supported, so no cooperative event loop is required of the
//! presentation layer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dispatch::{CancelOutcome, Dispatcher, TaskId, TaskState};

/// One observed state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskEvent {
    pub task_id: TaskId,
    pub host: String,
    pub old_state: TaskState,
    pub new_state: TaskState,
    pub timestamp: DateTime<Utc>,
}

/// Consumer of task transition events (the presentation layer).
pub trait EventSink: Send + Sync {
    fn emit(&self, event: TaskEvent);
}

/// Sink that forwards events over an unbounded channel.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<TaskEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TaskEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: TaskEvent) {
        if self.tx.send(event).is_err() {
            debug!("event sink receiver dropped; discarding event");
        }
    }
}

/// Sink that logs transitions, for CLI runs without a richer front end.
#[derive(Debug, Clone, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: TaskEvent) {
        info!(
            task = %event.task_id,
            host = %event.host,
            old = ?event.old_state,
            new = ?event.new_state,
            "task state changed"
        );
    }
}

/// Which tasks the monitor tracks.
#[derive(Debug, Clone)]
pub enum Tracked {
    /// A fixed set of task ids.
    Ids(Vec<TaskId>),
    /// Everything the dispatcher knows about, re-listed every poll so
    /// late submissions are picked up.
    All,
}

/// Polls the dispatcher and reports state transitions.
pub struct StatusMonitor {
    dispatcher: Arc<Dispatcher>,
    interval: Duration,
    sink: Arc<dyn EventSink>,
}

/// Handle to a spawned monitor loop.
pub struct MonitorHandle {
    dispatcher: Arc<Dispatcher>,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl MonitorHandle {
    /// Forward a cancellation request to the dispatcher.
    pub fn request_cancel(&self, task_id: &str) -> CancelOutcome {
        self.dispatcher.cancel(task_id)
    }

    /// Ask the loop to stop and wait for it.
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        if let Err(err) = self.handle.await {
            warn!(error = %err, "monitor task ended abnormally");
        }
    }
}

impl StatusMonitor {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        interval: Duration,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            dispatcher,
            interval,
            sink,
        }
    }

    /// Forward a cancellation request to the dispatcher.
    pub fn request_cancel(&self, task_id: &str) -> CancelOutcome {
        self.dispatcher.cancel(task_id)
    }

    /// Spawn the polling loop.
    ///
    /// The loop ends when shut down, or once every tracked task is
    /// terminal (fixed-id mode only; in `All` mode new tasks may keep
    /// appearing, so it runs until shutdown).
    pub fn spawn(self, tracked: Tracked) -> MonitorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dispatcher = Arc::clone(&self.dispatcher);
        let handle = tokio::spawn(poll_loop(
            self.dispatcher,
            self.interval,
            self.sink,
            tracked,
            shutdown_rx,
        ));
        MonitorHandle {
            dispatcher,
            shutdown: shutdown_tx,
            handle,
        }
    }
}

async fn poll_loop(
    dispatcher: Arc<Dispatcher>,
    interval: Duration,
    sink: Arc<dyn EventSink>,
    tracked: Tracked,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval_ms = interval.as_millis() as u64, "status monitor started");

    // Every task starts Queued; emitting diffs against that baseline means
    // a task first observed as Running still yields its Queued→Running
    // event.
    let mut last_seen: HashMap<TaskId, TaskState> = HashMap::new();
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        let ids: Vec<TaskId> = match &tracked {
            Tracked::Ids(ids) => ids.clone(),
            Tracked::All => dispatcher.task_ids(),
        };

        let mut all_terminal = !ids.is_empty();
        for id in ids {
            // One task's lookup trouble must not abort polling the rest.
            let Some(state) = dispatcher.get_status(&id) else {
                warn!(task = %id, "status lookup failed; will retry next poll");
                all_terminal = false;
                continue;
            };

            if !state.is_terminal() {
                all_terminal = false;
            }

            let old = last_seen.get(&id).cloned().unwrap_or(TaskState::Queued);
            if old != state {
                let host = dispatcher
                    .task_info(&id)
                    .map(|record| record.host)
                    .unwrap_or_default();
                sink.emit(TaskEvent {
                    task_id: id.clone(),
                    host,
                    old_state: old,
                    new_state: state.clone(),
                    timestamp: Utc::now(),
                });
            }
            last_seen.insert(id, state);
        }

        if matches!(tracked, Tracked::Ids(_)) && all_terminal {
            debug!("all tracked tasks terminal; monitor stopping");
            break;
        }
    }

    info!("status monitor stopped");
}
