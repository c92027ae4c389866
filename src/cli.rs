// src/cli.rs

//! CLI argument parsing using `clap`.

use std::collections::BTreeMap;

use clap::{Parser, ValueEnum};

use crate::config::model::ParamValue;
use crate::errors::{Result, SigstepError};

/// Command-line arguments for `sigstep`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "sigstep",
    version,
    about = "Run a workflow step over its parameter set, skipping iterations with valid saved signatures.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the step file (TOML).
    ///
    /// Default: `Sigstep.toml` in the current working directory.
    #[arg(long, value_name = "PATH", default_value = "Sigstep.toml")]
    pub config: String,

    /// Name of the step to run.
    #[arg(long, value_name = "NAME")]
    pub step: String,

    /// Parameter overrides, `name=value` (repeatable).
    #[arg(long = "set", value_name = "NAME=VALUE")]
    pub set: Vec<String>,

    /// Bypass signature validity checks for this run only.
    #[arg(long)]
    pub force: bool,

    /// Maximum number of concurrently executing local actions.
    #[arg(long, value_name = "N", default_value_t = 4)]
    pub workers: usize,

    /// Directory holding the signature store (`<dir>/.sigstep/signatures`).
    #[arg(long, value_name = "DIR", default_value = ".")]
    pub store: String,

    /// Stop scheduling new iterations after the first failure.
    #[arg(long)]
    pub stop_on_first_failure: bool,

    /// Print the expanded iterations without executing anything.
    #[arg(long)]
    pub dry_run: bool,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `SIGSTEP_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}

/// Parse repeated `--set name=value` flags into parameter overrides.
pub fn parse_overrides(pairs: &[String]) -> Result<BTreeMap<String, ParamValue>> {
    let mut overrides = BTreeMap::new();
    for pair in pairs {
        let Some((name, value)) = pair.split_once('=') else {
            return Err(SigstepError::ConfigError(format!(
                "invalid --set '{}': expected name=value",
                pair
            )));
        };
        let name = name.trim();
        if name.is_empty() {
            return Err(SigstepError::ConfigError(format!(
                "invalid --set '{}': empty parameter name",
                pair
            )));
        }
        overrides.insert(name.to_string(), ParamValue::parse(value));
    }
    Ok(overrides)
}
