// src/config/validate.rs

use std::collections::BTreeMap;

use crate::config::model::{RawStep, RawStepFile, SequenceSpec, Step, StepFile};
use crate::errors::{Result, SigstepError};

impl TryFrom<RawStepFile> for StepFile {
    type Error = SigstepError;

    fn try_from(raw: RawStepFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;

        let steps: BTreeMap<String, Step> = raw
            .step
            .into_iter()
            .map(|(name, raw_step)| {
                let step = Step::from_raw(name.clone(), raw_step);
                (name, step)
            })
            .collect();

        Ok(StepFile::new_unchecked(steps))
    }
}

fn validate_raw_config(cfg: &RawStepFile) -> Result<()> {
    ensure_has_steps(cfg)?;
    for (name, step) in cfg.step.iter() {
        validate_action(name, step)?;
        validate_sequences(name, step)?;
        validate_external(name, step)?;
    }
    Ok(())
}

fn ensure_has_steps(cfg: &RawStepFile) -> Result<()> {
    if cfg.step.is_empty() {
        return Err(SigstepError::ConfigError(
            "config must contain at least one [step.<name>] section".to_string(),
        ));
    }
    Ok(())
}

fn validate_action(name: &str, step: &RawStep) -> Result<()> {
    if step.action.trim().is_empty() {
        return Err(SigstepError::ConfigError(format!(
            "step '{}' has an empty action body",
            name
        )));
    }
    Ok(())
}

fn validate_sequences(name: &str, step: &RawStep) -> Result<()> {
    for (var, spec) in step.for_each.iter() {
        match spec {
            SequenceSpec::Values { values } => {
                if values.is_empty() {
                    return Err(SigstepError::ConfigError(format!(
                        "step '{}': for_each variable '{}' has an empty value list",
                        name, var
                    )));
                }
            }
            SequenceSpec::Range { range } => {
                // A literal integer is fine; otherwise the name must refer
                // to an integer-valued parameter (its default may still be
                // overridden at run time, but the declared default must be
                // an integer so the reference is well-formed).
                if range.trim().parse::<i64>().is_ok() {
                    continue;
                }
                match step.params.get(range.trim()) {
                    Some(v) if v.as_int().is_some() => {}
                    Some(_) => {
                        return Err(SigstepError::ConfigError(format!(
                            "step '{}': range sequence '{}' refers to parameter '{}' \
                             which is not an integer",
                            name, var, range
                        )));
                    }
                    None => {
                        return Err(SigstepError::ConfigError(format!(
                            "step '{}': range sequence '{}' refers to unknown parameter '{}'",
                            name, var, range
                        )));
                    }
                }
            }
        }
        if step.params.contains_key(var) {
            return Err(SigstepError::ConfigError(format!(
                "step '{}': for_each variable '{}' shadows a parameter of the same name",
                name, var
            )));
        }
    }
    Ok(())
}

fn validate_external(name: &str, step: &RawStep) -> Result<()> {
    if step.external && step.host.as_deref().map_or(true, |h| h.trim().is_empty()) {
        return Err(SigstepError::ConfigError(format!(
            "step '{}' is external but declares no target host",
            name
        )));
    }
    if !step.external && step.host.is_some() {
        return Err(SigstepError::ConfigError(format!(
            "step '{}' declares a host but is not external",
            name
        )));
    }
    Ok(())
}
