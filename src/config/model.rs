// src/config/model.rs

//! Raw (deserialized) and validated step-definition model.

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;

/// A scalar parameter / binding value.
///
/// Kept deliberately small: iteration variables and parameters are
/// substituted into templates as text, so everything must render cleanly.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl ParamValue {
    /// Integer view, used by `range = "<param>"` sequences.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            ParamValue::Int(n) => Some(*n),
            ParamValue::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Parse a CLI override value: try int, float, bool, else keep as text.
    pub fn parse(s: &str) -> Self {
        let t = s.trim();
        if let Ok(n) = t.parse::<i64>() {
            return ParamValue::Int(n);
        }
        if let Ok(f) = t.parse::<f64>() {
            return ParamValue::Float(f);
        }
        match t {
            "true" => ParamValue::Bool(true),
            "false" => ParamValue::Bool(false),
            _ => ParamValue::Str(s.to_string()),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(b) => write!(f, "{b}"),
            ParamValue::Int(n) => write!(f, "{n}"),
            ParamValue::Float(x) => write!(f, "{x}"),
            ParamValue::Str(s) => write!(f, "{s}"),
        }
    }
}

/// How multiple `for_each` sequences are combined.
///
/// - `Zip`: paired element-wise; all sequences must have equal length.
/// - `Cross`: full cross-product, row-major over variables in
///   lexicographic name order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CombineMode {
    Zip,
    Cross,
}

impl Default for CombineMode {
    fn default() -> Self {
        CombineMode::Zip
    }
}

/// One named iteration sequence.
///
/// Either a literal list of values, or `range = "<param>"` expanding to
/// `0..n` where `n` is the (possibly overridden) integer value of the named
/// parameter. A literal integer is also accepted for `range`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum SequenceSpec {
    Values { values: Vec<ParamValue> },
    Range { range: String },
}

/// One `[step.<name>]` table, as deserialized.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawStep {
    /// Parameter defaults (name → default value), overridable per run.
    #[serde(default)]
    pub params: BTreeMap<String, ParamValue>,

    /// Iteration variables bound to sequences. Empty means "run once".
    #[serde(default)]
    pub for_each: BTreeMap<String, SequenceSpec>,

    /// How `for_each` sequences combine.
    #[serde(default)]
    pub combine: CombineMode,

    /// Output-path templates, rendered per iteration context.
    #[serde(default)]
    pub outputs: Vec<String>,

    /// Action body template (opaque to the engine; interpreted by the
    /// action executor registered for `kind`).
    pub action: String,

    /// Declared action kind; selects the action executor.
    #[serde(default = "default_kind")]
    pub kind: String,

    /// Execute through the task dispatcher instead of inline.
    #[serde(default)]
    pub external: bool,

    /// Target host for external execution.
    pub host: Option<String>,
}

fn default_kind() -> String {
    "shell".to_string()
}

/// Whole raw config file: one `[step.<name>]` table per step.
#[derive(Debug, Clone, Deserialize)]
pub struct RawStepFile {
    #[serde(default)]
    pub step: BTreeMap<String, RawStep>,
}

/// A validated step, immutable once a run starts.
#[derive(Debug, Clone)]
pub struct Step {
    pub name: String,
    pub params: BTreeMap<String, ParamValue>,
    pub for_each: BTreeMap<String, SequenceSpec>,
    pub combine: CombineMode,
    pub outputs: Vec<String>,
    pub action: String,
    pub kind: String,
    pub external: bool,
    pub host: Option<String>,
}

impl Step {
    pub(crate) fn from_raw(name: String, raw: RawStep) -> Self {
        Self {
            name,
            params: raw.params,
            for_each: raw.for_each,
            combine: raw.combine,
            outputs: raw.outputs,
            action: raw.action,
            kind: raw.kind,
            external: raw.external,
            host: raw.host,
        }
    }
}

/// Validated collection of steps.
#[derive(Debug, Clone, Default)]
pub struct StepFile {
    steps: BTreeMap<String, Step>,
}

impl StepFile {
    pub(crate) fn new_unchecked(steps: BTreeMap<String, Step>) -> Self {
        Self { steps }
    }

    pub fn get(&self, name: &str) -> Option<&Step> {
        self.steps.get(name)
    }

    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.steps.values()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
