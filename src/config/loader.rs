// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::model::{RawStepFile, StepFile};
use crate::errors::Result;

/// Load a step file from a given path and return the raw `RawStepFile`.
///
/// This only performs TOML deserialization; it does **not** perform semantic
/// validation (range references, external hosts, etc.). Use
/// [`load_and_validate`] for that.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawStepFile> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;

    let config: RawStepFile = toml::from_str(&contents)?;

    Ok(config)
}

/// Load a step file from path and run basic validation.
///
/// This is the recommended entry point for the rest of the application:
///
/// - Reads TOML.
/// - Applies defaults (handled by `serde` + `Default` impls).
/// - Checks for:
///   - empty action bodies,
///   - `range` sequences referencing unknown or non-integer parameters,
///   - external steps without a target host.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<StepFile> {
    let raw = load_from_path(&path)?;
    let config = StepFile::try_from(raw)?;
    Ok(config)
}

/// Helper to resolve a default config path.
///
/// Currently this just returns `Sigstep.toml` in the current working
/// directory, but this function exists so you can later:
///
/// - Respect an env var (e.g. `SIGSTEP_CONFIG`).
/// - Look for multiple default locations.
/// - Support project-local config discovery.
pub fn default_config_path() -> PathBuf {
    PathBuf::from("Sigstep.toml")
}
