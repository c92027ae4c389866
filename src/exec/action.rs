// src/exec/action.rs

//! Pluggable action executor abstraction.
//!
//! The step runner talks to an `ActionExecutor` instead of spawning
//! processes itself. Action bodies are opaque to the engine; the executor
//! registered for a step's declared `kind` interprets them. Tests can
//! register fakes that never touch a process.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::errors::SigstepError;

/// Captured result of a finished local action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// How a local action ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Finished(ActionOutput),
    /// The cancel channel fired and the action was killed.
    Cancelled,
}

/// Trait abstracting local (inline) action execution.
///
/// An `Err` means the action could not be started at all; a non-zero exit
/// travels inside [`ActionOutput`].
pub trait ActionExecutor: Send + Sync {
    fn execute(
        &self,
        body: String,
        vars: BTreeMap<String, String>,
        cancel: oneshot::Receiver<()>,
    ) -> Pin<Box<dyn Future<Output = Result<ActionOutcome>> + Send + 'static>>;
}

/// Action executors keyed by declared action kind.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    executors: HashMap<String, Arc<dyn ActionExecutor>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `shell` kind.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("shell", Arc::new(ShellAction::new()));
        registry
    }

    pub fn register(&mut self, kind: impl Into<String>, executor: Arc<dyn ActionExecutor>) {
        self.executors.insert(kind.into(), executor);
    }

    pub fn get(&self, kind: &str) -> crate::errors::Result<Arc<dyn ActionExecutor>> {
        self.executors
            .get(kind)
            .cloned()
            .ok_or_else(|| SigstepError::UnknownActionKind(kind.to_string()))
    }
}

/// Built-in executor for `kind = "shell"`: runs the body through `sh -c`
/// with the bound variables in the environment.
#[derive(Debug, Clone, Default)]
pub struct ShellAction;

impl ShellAction {
    pub fn new() -> Self {
        Self
    }
}

impl ActionExecutor for ShellAction {
    fn execute(
        &self,
        body: String,
        vars: BTreeMap<String, String>,
        cancel: oneshot::Receiver<()>,
    ) -> Pin<Box<dyn Future<Output = Result<ActionOutcome>> + Send + 'static>> {
        Box::pin(run_shell(body, vars, cancel))
    }
}

async fn run_shell(
    body: String,
    vars: BTreeMap<String, String>,
    mut cancel: oneshot::Receiver<()>,
) -> Result<ActionOutcome> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(&body);
    for (name, value) in &vars {
        cmd.env(name, value);
    }
    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().context("spawning shell action")?;

    // Drain both streams concurrently so pipe buffers don't fill while we
    // wait for the exit status.
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let out_task = tokio::spawn(read_stream(stdout));
    let err_task = tokio::spawn(read_stream(stderr));

    tokio::select! {
        status_res = child.wait() => {
            let status = status_res.context("waiting for shell action")?;
            let exit_code = status.code().unwrap_or(-1);
            let stdout = out_task.await.unwrap_or_default();
            let stderr = err_task.await.unwrap_or_default();

            info!(exit_code, "shell action exited");
            Ok(ActionOutcome::Finished(ActionOutput {
                exit_code,
                stdout,
                stderr,
            }))
        }

        result = &mut cancel => {
            if result.is_ok() {
                info!("cancellation requested; killing shell action");
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "failed to kill shell action on cancellation");
                }
            }
            // Sender dropped without firing also lands here; the child is
            // killed on drop either way.
            Ok(ActionOutcome::Cancelled)
        }
    }
}

async fn read_stream<R>(stream: Option<R>) -> String
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let mut buf = String::new();
    if let Some(mut stream) = stream {
        let _ = stream.read_to_string(&mut buf).await;
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_vars() -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    #[tokio::test]
    async fn shell_action_captures_stdout_and_exit_code() {
        let action = ShellAction::new();
        let (_cancel_tx, cancel_rx) = oneshot::channel();

        let outcome = action
            .execute("echo hello".to_string(), no_vars(), cancel_rx)
            .await
            .unwrap();

        match outcome {
            ActionOutcome::Finished(out) => {
                assert_eq!(out.exit_code, 0);
                assert_eq!(out.stdout.trim(), "hello");
            }
            ActionOutcome::Cancelled => panic!("unexpected cancellation"),
        }
    }

    #[tokio::test]
    async fn shell_action_reports_nonzero_exit() {
        let action = ShellAction::new();
        let (_cancel_tx, cancel_rx) = oneshot::channel();

        let outcome = action
            .execute("exit 3".to_string(), no_vars(), cancel_rx)
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            ActionOutcome::Finished(ActionOutput { exit_code: 3, .. })
        ));
    }

    #[tokio::test]
    async fn shell_action_sees_bound_variables() {
        let action = ShellAction::new();
        let (_cancel_tx, cancel_rx) = oneshot::channel();
        let mut vars = BTreeMap::new();
        vars.insert("i".to_string(), "7".to_string());

        let outcome = action
            .execute("echo \"$i\"".to_string(), vars, cancel_rx)
            .await
            .unwrap();

        match outcome {
            ActionOutcome::Finished(out) => assert_eq!(out.stdout.trim(), "7"),
            ActionOutcome::Cancelled => panic!("unexpected cancellation"),
        }
    }

    #[tokio::test]
    async fn shell_action_can_be_cancelled() {
        let action = ShellAction::new();
        let (cancel_tx, cancel_rx) = oneshot::channel();

        let fut = action.execute("sleep 100".to_string(), no_vars(), cancel_rx);
        let handle = tokio::spawn(fut);

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        cancel_tx.send(()).unwrap();

        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome, ActionOutcome::Cancelled);
    }

    #[test]
    fn registry_rejects_unknown_kind() {
        let registry = ActionRegistry::with_defaults();
        assert!(registry.get("shell").is_ok());
        assert!(matches!(
            registry.get("python"),
            Err(SigstepError::UnknownActionKind(_))
        ));
    }
}
