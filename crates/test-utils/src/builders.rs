#![allow(dead_code)]

use std::collections::BTreeMap;

use sigstep::config::{CombineMode, ParamValue, SequenceSpec, Step};

/// Builder for `Step` to simplify test setup.
pub struct StepBuilder {
    step: Step,
}

impl StepBuilder {
    pub fn new(name: &str, action: &str) -> Self {
        Self {
            step: Step {
                name: name.to_string(),
                params: BTreeMap::new(),
                for_each: BTreeMap::new(),
                combine: CombineMode::Zip,
                outputs: vec![],
                action: action.to_string(),
                kind: "shell".to_string(),
                external: false,
                host: None,
            },
        }
    }

    pub fn param(mut self, name: &str, value: ParamValue) -> Self {
        self.step.params.insert(name.to_string(), value);
        self
    }

    pub fn param_int(self, name: &str, value: i64) -> Self {
        self.param(name, ParamValue::Int(value))
    }

    /// Bind `var` to `0..<value of param>`.
    pub fn range(mut self, var: &str, param: &str) -> Self {
        self.step.for_each.insert(
            var.to_string(),
            SequenceSpec::Range {
                range: param.to_string(),
            },
        );
        self
    }

    pub fn values(mut self, var: &str, values: Vec<ParamValue>) -> Self {
        self.step
            .for_each
            .insert(var.to_string(), SequenceSpec::Values { values });
        self
    }

    pub fn combine(mut self, mode: CombineMode) -> Self {
        self.step.combine = mode;
        self
    }

    pub fn output(mut self, template: &str) -> Self {
        self.step.outputs.push(template.to_string());
        self
    }

    pub fn kind(mut self, kind: &str) -> Self {
        self.step.kind = kind.to_string();
        self
    }

    pub fn external(mut self, host: &str) -> Self {
        self.step.external = true;
        self.step.host = Some(host.to_string());
        self
    }

    pub fn build(self) -> Step {
        self.step
    }
}
