// src/sig/mod.rs

//! Signature store: persistent per-iteration memoization records.
//!
//! Each record ties a (step, iteration index) key to a fingerprint of the
//! inputs that produced it plus the output paths it produced. A record is
//! valid only while the fingerprint still matches the current inputs AND
//! every recorded output path exists; anything else means the iteration
//! must execute again. Store failures are downgraded by callers to "no
//! valid record" — under-caching is safe, over-caching is a correctness
//! bug.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use anyhow::Result;
use blake3::Hasher;

use crate::fs::FileSystem;

pub mod store;

pub use store::{FileSignatureStore, MemorySignatureStore};

/// Key of one signature record: step name + 0-based iteration index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SignatureKey {
    pub step: String,
    pub index: usize,
}

impl SignatureKey {
    pub fn new(step: impl Into<String>, index: usize) -> Self {
        Self {
            step: step.into(),
            index,
        }
    }
}

impl fmt::Display for SignatureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.step, self.index)
    }
}

/// One stored record: input fingerprint + resolved output paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureRecord {
    pub fingerprint: String,
    pub outputs: Vec<PathBuf>,
}

/// Abstract storage for signature records.
///
/// Implementations must support concurrent `commit` calls under distinct
/// keys with atomic per-key replace semantics; no cross-key locking is
/// required. The store has an explicit lifecycle: opened at run start,
/// flushed at run end — never a hidden singleton, so multiple concurrent
/// runs against different stores are possible.
pub trait SignatureStore: Send + Sync {
    fn lookup(&self, key: &SignatureKey) -> Result<Option<SignatureRecord>>;
    /// Atomically replace any prior record under `key`.
    fn commit(&self, key: &SignatureKey, record: SignatureRecord) -> Result<()>;
    fn invalidate(&self, key: &SignatureKey) -> Result<()>;
    /// Persist pending state (no-op for purely in-memory stores).
    fn flush(&self) -> Result<()>;
}

/// Compute the content fingerprint of one iteration's inputs: the bound
/// variable values (parameters + iteration variables) and the rendered
/// action body.
pub fn fingerprint(bindings: &BTreeMap<String, String>, body: &str) -> String {
    let mut hasher = Hasher::new();
    for (name, value) in bindings {
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b"\n");
    }
    hasher.update(b"--\n");
    hasher.update(body.as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Full validity check: fingerprint match AND all recorded outputs exist.
pub fn record_is_valid(
    record: &SignatureRecord,
    current_fingerprint: &str,
    fs: &dyn FileSystem,
) -> bool {
    record.fingerprint == current_fingerprint
        && record.outputs.iter().all(|p| fs.exists(p))
}
