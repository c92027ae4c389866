// src/expand/iter.rs

//! Expansion of a step's `for_each` declaration into iteration contexts.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use crate::config::model::{CombineMode, ParamValue, SequenceSpec, Step};
use crate::errors::{Result, SigstepError};
use crate::expand::template;

/// One concrete binding of the iteration variables, plus the resolved
/// output paths for that binding.
///
/// `bindings` contains the step's (merged) parameters as well as the
/// iteration variables, rendered to text, so templates can refer to both.
#[derive(Debug, Clone, PartialEq)]
pub struct IterationContext {
    pub index: usize,
    pub bindings: BTreeMap<String, String>,
    pub outputs: Vec<PathBuf>,
}

/// A finite, restartable sequence of [`IterationContext`]s.
///
/// Contexts are produced on demand from the resolved sequences; iterating
/// twice yields identical contexts in identical order, which is what makes
/// per-index signature keys stable across runs.
#[derive(Debug, Clone)]
pub struct Expansion {
    params: BTreeMap<String, String>,
    /// Variable name → resolved values, in lexicographic name order.
    sequences: Vec<(String, Vec<String>)>,
    mode: CombineMode,
    output_templates: Vec<String>,
    len: usize,
}

/// Expand a step against merged parameters (defaults + run overrides).
///
/// Fails with `ArityMismatch` before producing any context if zipped
/// sequences have unequal lengths.
pub fn expand(step: &Step, overrides: &BTreeMap<String, ParamValue>) -> Result<Expansion> {
    let mut params = step.params.clone();
    for (name, value) in overrides {
        if !params.contains_key(name) {
            return Err(SigstepError::ConfigError(format!(
                "step '{}' has no parameter '{}' to override",
                step.name, name
            )));
        }
        params.insert(name.clone(), value.clone());
    }

    let sequences = resolve_sequences(step, &params)?;

    let len = match step.combine {
        _ if sequences.is_empty() => 1,
        CombineMode::Zip => {
            let first_len = sequences[0].1.len();
            if let Some((name, seq)) = sequences.iter().find(|(_, s)| s.len() != first_len) {
                return Err(SigstepError::ArityMismatch(format!(
                    "step '{}': '{}' has {} values, '{}' has {}",
                    step.name,
                    sequences[0].0,
                    first_len,
                    name,
                    seq.len()
                )));
            }
            first_len
        }
        CombineMode::Cross => sequences.iter().map(|(_, s)| s.len()).product(),
    };

    let params_text = params
        .iter()
        .map(|(k, v)| (k.clone(), v.to_string()))
        .collect();

    Ok(Expansion {
        params: params_text,
        sequences,
        mode: step.combine,
        output_templates: step.outputs.clone(),
        len,
    })
}

impl Expansion {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Produce the context at `index`.
    pub fn context(&self, index: usize) -> Result<IterationContext> {
        debug_assert!(index < self.len);

        let mut bindings = self.params.clone();

        match self.mode {
            CombineMode::Zip => {
                for (name, seq) in &self.sequences {
                    bindings.insert(name.clone(), seq[index].clone());
                }
            }
            CombineMode::Cross => {
                // Row-major: the last variable (lexicographically) varies
                // fastest.
                let mut remainder = index;
                for (name, seq) in self.sequences.iter().rev() {
                    bindings.insert(name.clone(), seq[remainder % seq.len()].clone());
                    remainder /= seq.len();
                }
            }
        }

        let mut outputs = Vec::with_capacity(self.output_templates.len());
        for tpl in &self.output_templates {
            outputs.push(PathBuf::from(template::render(tpl, &bindings)?));
        }

        Ok(IterationContext {
            index,
            bindings,
            outputs,
        })
    }

    /// Iterate over all contexts in index order.
    pub fn contexts(&self) -> impl Iterator<Item = Result<IterationContext>> + '_ {
        (0..self.len).map(move |i| self.context(i))
    }

    /// Detect two iterations resolving to the same output path.
    ///
    /// Runs over the full (finite) expansion before anything executes, so a
    /// collision never reaches the executor.
    pub fn check_output_collisions(&self) -> Result<()> {
        let mut seen: HashMap<PathBuf, usize> = HashMap::new();
        for ctx in self.contexts() {
            let ctx = ctx?;
            for path in &ctx.outputs {
                if let Some(&first) = seen.get(path) {
                    return Err(SigstepError::OutputCollision {
                        first,
                        second: ctx.index,
                        path: path.clone(),
                    });
                }
                seen.insert(path.clone(), ctx.index);
            }
        }
        Ok(())
    }
}

/// Resolve each declared sequence to concrete text values, in lexicographic
/// variable order (`BTreeMap` iteration order), which fixes cross-product
/// ordering across runs.
fn resolve_sequences(
    step: &Step,
    params: &BTreeMap<String, ParamValue>,
) -> Result<Vec<(String, Vec<String>)>> {
    let mut out = Vec::with_capacity(step.for_each.len());

    for (name, spec) in &step.for_each {
        let values = match spec {
            SequenceSpec::Values { values } => {
                values.iter().map(|v| v.to_string()).collect()
            }
            SequenceSpec::Range { range } => {
                let n = resolve_range_bound(step, params, range)?;
                (0..n).map(|i| i.to_string()).collect()
            }
        };
        out.push((name.clone(), values));
    }

    Ok(out)
}

fn resolve_range_bound(
    step: &Step,
    params: &BTreeMap<String, ParamValue>,
    range: &str,
) -> Result<i64> {
    let key = range.trim();
    let n = if let Ok(n) = key.parse::<i64>() {
        n
    } else {
        params
            .get(key)
            .and_then(|v| v.as_int())
            .ok_or_else(|| {
                SigstepError::ConfigError(format!(
                    "step '{}': range refers to '{}', which is not an integer parameter",
                    step.name, key
                ))
            })?
    };

    if n < 0 {
        return Err(SigstepError::ConfigError(format!(
            "step '{}': range bound '{}' is negative ({})",
            step.name, key, n
        )));
    }
    Ok(n)
}
