// src/lib.rs

pub mod cli;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod exec;
pub mod expand;
pub mod fs;
pub mod logging;
pub mod monitor;
pub mod sig;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use crate::cli::CliArgs;
use crate::config::loader::load_and_validate;
use crate::config::model::Step;
use crate::dispatch::{Dispatcher, SshRemote};
use crate::errors::SigstepError;
use crate::exec::{ActionRegistry, RunCancel, RunOptions, RunOutcome, RunReport, StepRunner};
use crate::fs::RealFileSystem;
use crate::monitor::{LogSink, StatusMonitor, Tracked};
use crate::sig::FileSignatureStore;

/// Poll interval for the task status monitor during CLI runs.
const MONITOR_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - step-file loading
/// - signature store (opened at run start, flushed at run end)
/// - action registry + task dispatcher
/// - status monitor for external steps
/// - Ctrl-C handling
pub async fn run(args: CliArgs) -> Result<()> {
    let step_file = load_and_validate(&args.config)?;
    let step = step_file
        .get(&args.step)
        .ok_or_else(|| SigstepError::StepNotFound(args.step.clone()))?
        .clone();

    let overrides = cli::parse_overrides(&args.set)?;

    if args.dry_run {
        print_dry_run(&step, &overrides)?;
        return Ok(());
    }

    let fs: Arc<dyn fs::FileSystem> = Arc::new(RealFileSystem);
    let store = Arc::new(FileSignatureStore::open(&args.store, Arc::clone(&fs)));
    let dispatcher = Dispatcher::new(Arc::new(SshRemote::new()));

    let options = RunOptions {
        workers: args.workers,
        force: args.force,
        stop_on_first_failure: args.stop_on_first_failure,
        ..RunOptions::default()
    };

    let runner = StepRunner::new(
        store,
        fs,
        ActionRegistry::with_defaults(),
        Some(Arc::clone(&dispatcher)),
        options,
    );

    // Surface task transitions for external steps while the run is active.
    let monitor_handle = if step.external {
        let monitor = StatusMonitor::new(
            Arc::clone(&dispatcher),
            MONITOR_POLL_INTERVAL,
            Arc::new(LogSink),
        );
        Some(monitor.spawn(Tracked::All))
    } else {
        None
    };

    // Ctrl-C → cancel the run (kill local actions, cancel external tasks).
    let (cancel, cancel_rx) = RunCancel::new();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            eprintln!("failed to listen for Ctrl+C: {e}");
            return;
        }
        warn!("interrupt received; cancelling run");
        cancel.cancel();
    });

    let report = runner.run_with_cancel(&step, &overrides, cancel_rx).await?;

    if let Some(handle) = monitor_handle {
        handle.shutdown().await;
    }

    print_summary(&report);

    match report.outcome {
        RunOutcome::Completed => Ok(()),
        RunOutcome::Cancelled => Err(anyhow::anyhow!("run cancelled")),
        RunOutcome::Failed => Err(anyhow::anyhow!(
            "step '{}' failed ({} of {} iterations)",
            report.step,
            report.failed(),
            report.iterations.len()
        )),
    }
}

/// Print the expansion without executing anything.
fn print_dry_run(
    step: &Step,
    overrides: &std::collections::BTreeMap<String, config::model::ParamValue>,
) -> Result<()> {
    let expansion = expand::expand(step, overrides)?;
    expansion.check_output_collisions()?;

    println!("sigstep dry-run");
    println!("  step: {}", step.name);
    println!("  kind: {}", step.kind);
    if step.external {
        println!(
            "  external: true (host: {})",
            step.host.as_deref().unwrap_or("localhost")
        );
    }
    println!("  iterations: {}", expansion.len());
    println!();

    for ctx in expansion.contexts() {
        let ctx = ctx?;
        let body = expand::template::render(&step.action, &ctx.bindings)?;
        println!("  [{}]", ctx.index);
        for (name, value) in &ctx.bindings {
            println!("      {name} = {value}");
        }
        if !ctx.outputs.is_empty() {
            println!("      outputs: {:?}", ctx.outputs);
        }
        println!("      action: {}", body.trim_end());
    }

    info!("dry-run complete (no execution)");
    Ok(())
}

fn print_summary(report: &RunReport) {
    println!();
    println!(
        "step '{}': {:?} ({} skipped, {} completed, {} failed of {})",
        report.step,
        report.outcome,
        report.skipped(),
        report.completed(),
        report.failed(),
        report.iterations.len()
    );
    for it in &report.iterations {
        if let exec::IterationStatus::Failed(reason) = &it.status {
            println!("  iteration {} failed: {:?}", it.index, reason);
        }
    }
}
