use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tokio::sync::oneshot;

use sigstep::exec::{ActionExecutor, ActionOutcome, ActionOutput};

/// A fake action executor that:
/// - records every executed body (with its bound variables)
/// - immediately reports completion with a scripted exit code.
pub struct FakeAction {
    exit_code: i32,
    executed: Arc<Mutex<Vec<ExecutedAction>>>,
}

/// One recorded execution.
#[derive(Debug, Clone)]
pub struct ExecutedAction {
    pub body: String,
    pub vars: BTreeMap<String, String>,
}

impl FakeAction {
    /// Fake whose actions all succeed.
    pub fn succeeding() -> Self {
        Self::with_exit_code(0)
    }

    pub fn with_exit_code(exit_code: i32) -> Self {
        Self {
            exit_code,
            executed: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Shared handle to the execution log.
    pub fn executed(&self) -> Arc<Mutex<Vec<ExecutedAction>>> {
        Arc::clone(&self.executed)
    }

    pub fn execution_count(&self) -> usize {
        self.executed.lock().unwrap().len()
    }
}

impl ActionExecutor for FakeAction {
    fn execute(
        &self,
        body: String,
        vars: BTreeMap<String, String>,
        _cancel: oneshot::Receiver<()>,
    ) -> Pin<Box<dyn Future<Output = Result<ActionOutcome>> + Send + 'static>> {
        let exit_code = self.exit_code;
        let executed = Arc::clone(&self.executed);

        Box::pin(async move {
            {
                let mut guard = executed.lock().unwrap();
                guard.push(ExecutedAction { body, vars });
            }

            Ok(ActionOutcome::Finished(ActionOutput {
                exit_code,
                stdout: String::new(),
                stderr: String::new(),
            }))
        })
    }
}
