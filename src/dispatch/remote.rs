// src/dispatch/remote.rs

//! Remote execution backend abstraction.
//!
//! The dispatcher talks to a `RemoteExecutor` instead of spawning
//! processes itself. This makes it easy to swap in a fake executor in
//! tests while keeping the production transport here.
//!
//! - [`SshRemote`] is the shipped implementation: it runs the task body
//!   through `ssh <host>` (plain `sh -c` for `localhost`).
//! - Tests can provide their own `RemoteExecutor` that scripts outcomes
//!   and never touches a process.

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;

use anyhow::{anyhow, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::task::TaskSpec;

/// How a remotely executed task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOutcome {
    /// The work ran to completion with this exit code.
    Exited(i32),
    /// The cancel channel fired and the work was killed.
    Cancelled,
}

/// Trait abstracting how a task reaches its target host.
///
/// An `Err` from `execute` means the host could not be reached (transport
/// failure before an exit status existed); the dispatcher reports it as
/// `FAILED` with the "unreachable" sub-reason and never retries itself.
pub trait RemoteExecutor: Send + Sync {
    fn execute(
        &self,
        spec: TaskSpec,
        cancel: oneshot::Receiver<()>,
    ) -> Pin<Box<dyn Future<Output = Result<RemoteOutcome>> + Send + 'static>>;
}

/// `ssh` exit code that signals a transport error rather than a remote
/// command failure.
const SSH_TRANSPORT_ERROR: i32 = 255;

/// Production transport: `ssh <host> <body>`, or `sh -c <body>` when the
/// host is `localhost`.
#[derive(Debug, Clone, Default)]
pub struct SshRemote;

impl SshRemote {
    pub fn new() -> Self {
        Self
    }
}

impl RemoteExecutor for SshRemote {
    fn execute(
        &self,
        spec: TaskSpec,
        cancel: oneshot::Receiver<()>,
    ) -> Pin<Box<dyn Future<Output = Result<RemoteOutcome>> + Send + 'static>> {
        Box::pin(run_over_transport(spec, cancel))
    }
}

async fn run_over_transport(
    spec: TaskSpec,
    mut cancel: oneshot::Receiver<()>,
) -> Result<RemoteOutcome> {
    let local = spec.host == "localhost";

    let mut cmd = if local {
        let mut c = Command::new("sh");
        c.arg("-c").arg(&spec.body);
        for (name, value) in &spec.bindings {
            c.env(name, value);
        }
        c
    } else {
        // Bound variables travel as assignments prefixed to the body,
        // since ssh does not forward the local environment.
        let mut script = String::new();
        for (name, value) in &spec.bindings {
            script.push_str(&format!("{}={}; ", name, shell_quote(value)));
        }
        script.push_str(&spec.body);

        let mut c = Command::new("ssh");
        c.arg(&spec.host).arg(script);
        c
    };

    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    info!(
        step = %spec.step,
        index = spec.index,
        host = %spec.host,
        "starting task process"
    );

    let mut child = cmd.spawn().with_context(|| {
        format!(
            "spawning transport for task of step '{}' on host '{}'",
            spec.step, spec.host
        )
    })?;

    // Consume both streams so buffers don't fill; log at debug.
    if let Some(stdout) = child.stdout.take() {
        let step = spec.step.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(step = %step, "stdout: {}", line);
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let step = spec.step.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(step = %step, "stderr: {}", line);
            }
        });
    }

    tokio::select! {
        status_res = child.wait() => {
            let status = status_res.with_context(|| {
                format!("waiting for task process of step '{}'", spec.step)
            })?;
            let code = status.code().unwrap_or(-1);

            if !local && code == SSH_TRANSPORT_ERROR {
                return Err(anyhow!("ssh transport to host '{}' failed", spec.host));
            }

            info!(
                step = %spec.step,
                index = spec.index,
                host = %spec.host,
                exit_code = code,
                "task process exited"
            );
            Ok(RemoteOutcome::Exited(code))
        }

        result = &mut cancel => {
            if result.is_err() {
                debug!(
                    step = %spec.step,
                    host = %spec.host,
                    "cancel channel closed without explicit cancellation"
                );
                // Child will be killed on drop due to kill_on_drop(true).
                return Ok(RemoteOutcome::Cancelled);
            }

            info!(
                step = %spec.step,
                index = spec.index,
                host = %spec.host,
                "cancellation requested; killing task process"
            );
            if let Err(e) = child.kill().await {
                warn!(
                    step = %spec.step,
                    host = %spec.host,
                    error = %e,
                    "failed to kill task process on cancellation"
                );
            }
            Ok(RemoteOutcome::Cancelled)
        }
    }
}

/// Single-quote a value for inclusion in a remote shell script.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
