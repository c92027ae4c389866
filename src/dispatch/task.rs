// src/dispatch/task.rs

//! Task model: content-derived identifiers, states, records.

use std::collections::BTreeMap;
use std::path::PathBuf;

use blake3::Hasher;
use chrono::{DateTime, Utc};

/// Canonical task identifier type.
///
/// Derived from a fingerprint of the task content (see [`task_id`]), not
/// random, so resubmission of identical work is idempotent.
pub type TaskId = String;

/// One unit of work handed to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    pub step: String,
    pub index: usize,
    /// Rendered action body (variables already substituted).
    pub body: String,
    /// Bound variables, also exported to the execution environment.
    pub bindings: BTreeMap<String, String>,
    /// Resolved output paths the work is expected to produce.
    pub outputs: Vec<PathBuf>,
    /// Target host ("localhost" executes in-process-host).
    pub host: String,
}

/// Why a task failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskFailure {
    /// The target host could not be reached (or the transport failed
    /// before the work produced an exit status).
    Unreachable(String),
    /// The work ran and exited non-zero.
    Exit(i32),
}

/// Dispatcher-side task state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Running,
    Succeeded,
    Failed(TaskFailure),
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed(_) | TaskState::Cancelled
        )
    }
}

/// Bookkeeping record for one task, owned by the dispatcher.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: TaskId,
    pub host: String,
    pub state: TaskState,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Derive the stable identifier for a task from its content and host.
///
/// Two submissions with identical rendered body, bindings, outputs, and
/// host produce the same id.
pub fn task_id(spec: &TaskSpec) -> TaskId {
    let mut hasher = Hasher::new();
    hasher.update(spec.host.as_bytes());
    hasher.update(b"\n");
    hasher.update(spec.body.as_bytes());
    hasher.update(b"\n");
    for (name, value) in &spec.bindings {
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b"\n");
    }
    for output in &spec.outputs {
        hasher.update(output.to_string_lossy().as_bytes());
        hasher.update(b"\n");
    }
    let hex = hasher.finalize().to_hex();
    format!("t{}", &hex.as_str()[..16])
}
