// src/config/mod.rs

//! Step-definition configuration: TOML model, loader, validation.
//!
//! The engine itself only consumes the validated [`model::StepFile`] /
//! [`model::Step`] types; any other workflow-definition front end can
//! construct them directly and skip the TOML layer.

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{default_config_path, load_and_validate, load_from_path};
pub use model::{
    CombineMode, ParamValue, RawStep, RawStepFile, SequenceSpec, Step, StepFile,
};
