#![allow(dead_code)]

pub use sigstep_test_utils::{init_tracing, with_timeout};

use std::collections::BTreeMap;
use std::sync::Arc;

use sigstep::config::ParamValue;
use sigstep::dispatch::Dispatcher;
use sigstep::exec::{ActionExecutor, ActionRegistry, RunOptions, StepRunner};
use sigstep::fs::FileSystem;
use sigstep::sig::SignatureStore;

pub fn no_overrides() -> BTreeMap<String, ParamValue> {
    BTreeMap::new()
}

pub fn overrides(pairs: &[(&str, i64)]) -> BTreeMap<String, ParamValue> {
    pairs
        .iter()
        .map(|(name, value)| (name.to_string(), ParamValue::Int(*value)))
        .collect()
}

/// Runner wired with a custom action executor registered as `shell`.
pub fn runner_with_action(
    store: Arc<dyn SignatureStore>,
    fs: Arc<dyn FileSystem>,
    action: Arc<dyn ActionExecutor>,
    options: RunOptions,
) -> StepRunner {
    let mut actions = ActionRegistry::new();
    actions.register("shell", action);
    StepRunner::new(store, fs, actions, None, options)
}

/// Runner for external steps, wired to the given dispatcher.
pub fn runner_with_dispatcher(
    store: Arc<dyn SignatureStore>,
    fs: Arc<dyn FileSystem>,
    dispatcher: Arc<Dispatcher>,
    options: RunOptions,
) -> StepRunner {
    StepRunner::new(
        store,
        fs,
        ActionRegistry::with_defaults(),
        Some(dispatcher),
        options,
    )
}
