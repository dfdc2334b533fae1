//! Tuning table: tuning key -> local work size.
//!
//! The table is process-wide and read-mostly. Entries are loaded from a JSON
//! file of `[key, local work size]` pairs and the file is rewritten whenever a
//! tuning pass stores a new best for a key.

mod tuner;

pub use tuner::{
    candidates_2d, candidates_3d, default_lws_2d, default_lws_3d, select_best, TuneRequest, TunerOptions,
    WorkGroupTuner,
};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use kestrel_accelerate_api::LocalWorkSize;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};

static GLOBAL_STORE: Lazy<Arc<TuningStore>> = Lazy::new(|| Arc::new(TuningStore::new()));

pub fn global_store() -> Arc<TuningStore> {
    GLOBAL_STORE.clone()
}

#[derive(Default)]
pub struct TuningStore {
    entries: RwLock<HashMap<String, LocalWorkSize>>,
    key_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    json_path: RwLock<Option<PathBuf>>,
}

impl TuningStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store backed by `path`; existing entries in the file are loaded.
    pub fn with_path(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let store = Self::new();
        store.attach(path)?;
        Ok(store)
    }

    /// Point the store at `path` and merge the file's entries into memory.
    pub fn attach(&self, path: impl Into<PathBuf>) -> std::io::Result<usize> {
        let path = path.into();
        let loaded = self.load_from(&path)?;
        *self.json_path.write() = Some(path);
        Ok(loaded)
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.json_path.read().clone()
    }

    pub fn get(&self, key: &str) -> Option<LocalWorkSize> {
        self.entries.read().get(key).copied()
    }

    /// Record `value` for `key`; the backing file is rewritten only when the entry changed.
    pub fn insert(&self, key: &str, value: LocalWorkSize) {
        let changed = {
            let mut guard = self.entries.write();
            let needs_flush = !matches!(guard.get(key), Some(existing) if *existing == value);
            if needs_flush {
                guard.insert(key.to_string(), value);
            }
            needs_flush
        };
        if changed {
            if let Err(err) = self.save() {
                log::warn!("tuning table: failed to persist '{key}': {err}");
            }
        }
    }

    /// Lock serializing the tuning search for one key.
    pub fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.key_locks
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    fn load_from(&self, path: &Path) -> std::io::Result<usize> {
        if !path.exists() {
            return Ok(0);
        }
        let data = std::fs::read_to_string(path)?;
        let entries: Vec<(String, LocalWorkSize)> = serde_json::from_str(&data)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
        let count = entries.len();
        let mut guard = self.entries.write();
        for (key, value) in entries {
            guard.insert(key, value);
        }
        log::info!("tuning table: loaded {count} entries from {:?}", path);
        Ok(count)
    }

    pub fn save(&self) -> std::io::Result<()> {
        let Some(path) = self.path() else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut entries: Vec<(String, LocalWorkSize)> = self
            .entries
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        let payload = serde_json::to_string_pretty(&entries)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
        std::fs::write(&path, payload)?;
        log::info!("tuning table saved to {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_persists_and_reloads() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("autotune").join("host.json");
        let store = TuningStore::with_path(&path).expect("store");
        store.insert("matmul_kernel_16_4_9", LocalWorkSize::new_2d(4, 64));
        assert!(path.exists());

        let reloaded = TuningStore::with_path(&path).expect("reload");
        assert_eq!(
            reloaded.get("matmul_kernel_16_4_9"),
            Some(LocalWorkSize::new_2d(4, 64))
        );
    }

    #[test]
    fn unchanged_entry_does_not_rewrite_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("t.json");
        let store = TuningStore::with_path(&path).expect("store");
        store.insert("k", LocalWorkSize::new_2d(8, 8));
        std::fs::remove_file(&path).expect("remove");
        store.insert("k", LocalWorkSize::new_2d(8, 8));
        assert!(!path.exists());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{not json").expect("write");
        assert!(TuningStore::with_path(&path).is_err());
    }

    #[test]
    fn key_lock_is_shared_per_key() {
        let store = TuningStore::new();
        let a = store.key_lock("a");
        let b = store.key_lock("a");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &store.key_lock("b")));
    }
}
