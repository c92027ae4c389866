// src/sig/store.rs

//! File-backed and in-memory signature store implementations.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::fs::FileSystem;

use super::{SignatureKey, SignatureRecord, SignatureStore};

/// Relative path (from the store root) to the signatures file.
///
/// The effective path on disk is:
///
/// `<root>/.sigstep/signatures`
///
/// where `<root>` is the directory passed to [`FileSignatureStore::open`].
pub const SIGNATURE_FILE_PATH: &str = ".sigstep/signatures";

/// Stores signature records in a file (`.sigstep/signatures`).
///
/// Records are kept in memory and written through on every commit; each
/// write replaces the file atomically (temp file + rename via
/// [`FileSystem::replace`]), so a crash mid-commit leaves the previous
/// file intact.
pub struct FileSignatureStore {
    path: PathBuf,
    fs: Arc<dyn FileSystem>,
    map: Mutex<HashMap<String, SignatureRecord>>,
}

impl FileSignatureStore {
    /// Open the store under `root`, loading any existing records.
    ///
    /// An unreadable or malformed backing file degrades to an empty store
    /// with a warning: prior signatures are lost, affected iterations
    /// simply re-execute.
    pub fn open(root: impl AsRef<Path>, fs: Arc<dyn FileSystem>) -> Self {
        let path = root.as_ref().join(SIGNATURE_FILE_PATH);
        let map = match load_all_records(fs.as_ref(), &path) {
            Ok(map) => map,
            Err(err) => {
                warn!(path = ?path, error = %err, "failed to load signature file; starting empty");
                HashMap::new()
            }
        };
        debug!(path = ?path, records = map.len(), "opened signature store");
        Self {
            path,
            fs,
            map: Mutex::new(map),
        }
    }

    fn persist(&self, map: &HashMap<String, SignatureRecord>) -> Result<()> {
        save_all_records(self.fs.as_ref(), &self.path, map)
    }
}

impl SignatureStore for FileSignatureStore {
    fn lookup(&self, key: &SignatureKey) -> Result<Option<SignatureRecord>> {
        let map = self.map.lock().unwrap();
        Ok(map.get(&key.to_string()).cloned())
    }

    fn commit(&self, key: &SignatureKey, record: SignatureRecord) -> Result<()> {
        let mut map = self.map.lock().unwrap();
        map.insert(key.to_string(), record);
        self.persist(&map)?;
        info!(key = %key, "committed signature (file)");
        Ok(())
    }

    fn invalidate(&self, key: &SignatureKey) -> Result<()> {
        let mut map = self.map.lock().unwrap();
        if map.remove(&key.to_string()).is_some() {
            self.persist(&map)?;
            info!(key = %key, "invalidated signature (file)");
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let map = self.map.lock().unwrap();
        self.persist(&map)
    }
}

/// Stores signature records in memory only.
#[derive(Default)]
pub struct MemorySignatureStore {
    map: Mutex<HashMap<String, SignatureRecord>>,
}

impl MemorySignatureStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SignatureStore for MemorySignatureStore {
    fn lookup(&self, key: &SignatureKey) -> Result<Option<SignatureRecord>> {
        let map = self.map.lock().unwrap();
        Ok(map.get(&key.to_string()).cloned())
    }

    fn commit(&self, key: &SignatureKey, record: SignatureRecord) -> Result<()> {
        let mut map = self.map.lock().unwrap();
        map.insert(key.to_string(), record);
        debug!(key = %key, "committed signature (memory)");
        Ok(())
    }

    fn invalidate(&self, key: &SignatureKey) -> Result<()> {
        let mut map = self.map.lock().unwrap();
        map.remove(&key.to_string());
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Load all stored records from the signatures file.
///
/// Line format, tab-separated: `key<TAB>fingerprint[<TAB>output]...`
/// Malformed lines are skipped rather than failing the load.
fn load_all_records(
    fs: &dyn FileSystem,
    path: &Path,
) -> Result<HashMap<String, SignatureRecord>> {
    if !fs.exists(path) {
        return Ok(HashMap::new());
    }

    let contents = fs.read_to_string(path)?;

    let mut map = HashMap::new();

    for line in contents.lines() {
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            continue;
        }
        let mut fields = trimmed.split('\t');
        let (Some(key), Some(fingerprint)) = (fields.next(), fields.next()) else {
            warn!(line = %trimmed, "skipping malformed signature line");
            continue;
        };
        let outputs = fields.map(PathBuf::from).collect();
        map.insert(
            key.to_string(),
            SignatureRecord {
                fingerprint: fingerprint.to_string(),
                outputs,
            },
        );
    }

    Ok(map)
}

/// Persist all records, replacing the file atomically.
fn save_all_records(
    fs: &dyn FileSystem,
    path: &Path,
    map: &HashMap<String, SignatureRecord>,
) -> Result<()> {
    let mut contents = String::new();
    for (key, record) in map.iter() {
        contents.push_str(key);
        contents.push('\t');
        contents.push_str(&record.fingerprint);
        for output in &record.outputs {
            contents.push('\t');
            contents.push_str(&output.to_string_lossy());
        }
        contents.push('\n');
    }

    fs.replace(path, contents.as_bytes())
}
