// src/errors.rs

//! Crate-wide error aliases and helpers.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SigstepError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Step not found: {0}")]
    StepNotFound(String),

    #[error("Zipped iteration sequences have unequal lengths: {0}")]
    ArityMismatch(String),

    #[error("Iterations {first} and {second} both resolve output path {path:?}")]
    OutputCollision {
        first: usize,
        second: usize,
        path: PathBuf,
    },

    #[error("Undefined template variable: {{{0}}}")]
    UndefinedVariable(String),

    #[error("Unknown action kind: {0}")]
    UnknownActionKind(String),

    #[error("Unknown task: {0}")]
    UnknownTask(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, SigstepError>;
