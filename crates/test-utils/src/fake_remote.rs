use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use tokio::sync::{oneshot, Notify};

use sigstep::dispatch::{RemoteExecutor, RemoteOutcome, TaskSpec};

/// A fake remote executor for dispatcher tests:
///
/// - records every `execute` call (the "underlying executions")
/// - can fail with an unreachable-host error for the first N calls
/// - can hold completions behind a gate so tests control when a task
///   finishes; gated executions honour cancellation.
pub struct FakeRemote {
    exit_code: i32,
    unreachable_budget: Arc<Mutex<u32>>,
    gate: Option<Arc<Notify>>,
    executions: Arc<Mutex<Vec<TaskSpec>>>,
}

impl FakeRemote {
    /// Fake whose tasks complete immediately with exit code 0.
    pub fn succeeding() -> Self {
        Self::with_exit_code(0)
    }

    pub fn with_exit_code(exit_code: i32) -> Self {
        Self {
            exit_code,
            unreachable_budget: Arc::new(Mutex::new(0)),
            gate: None,
            executions: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Fail the first `n` executions with an unreachable-host error.
    pub fn unreachable_times(mut self, n: u32) -> Self {
        self.unreachable_budget = Arc::new(Mutex::new(n));
        self
    }

    /// Hold each execution until the returned gate is notified.
    pub fn gated(mut self) -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        self.gate = Some(Arc::clone(&gate));
        (self, gate)
    }

    /// Shared handle to the execution log.
    pub fn executions(&self) -> Arc<Mutex<Vec<TaskSpec>>> {
        Arc::clone(&self.executions)
    }

    pub fn execution_count(&self) -> usize {
        self.executions.lock().unwrap().len()
    }
}

impl RemoteExecutor for FakeRemote {
    fn execute(
        &self,
        spec: TaskSpec,
        mut cancel: oneshot::Receiver<()>,
    ) -> Pin<Box<dyn Future<Output = Result<RemoteOutcome>> + Send + 'static>> {
        let exit_code = self.exit_code;
        let budget = Arc::clone(&self.unreachable_budget);
        let gate = self.gate.clone();
        let executions = Arc::clone(&self.executions);

        Box::pin(async move {
            {
                let mut remaining = budget.lock().unwrap();
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(anyhow!("fake: host '{}' unreachable", spec.host));
                }
            }

            {
                let mut guard = executions.lock().unwrap();
                guard.push(spec);
            }

            if let Some(gate) = gate {
                tokio::select! {
                    _ = gate.notified() => {}
                    _ = &mut cancel => return Ok(RemoteOutcome::Cancelled),
                }
            }

            Ok(RemoteOutcome::Exited(exit_code))
        })
    }
}
