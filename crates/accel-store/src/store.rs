//! Scope-partitioned key/value store with CAS generations

use crate::{Result, StoreError};
use accel_core::SlotScope;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

const ROOT_CHAIN: &[&str] = &["accel", "v1"];
const SLOT_KEY_PREFIX: &str = "slot";
const STORE_DIR: &str = "accelerator";

/// Build the store key for a slot record
pub fn slot_key(scope: SlotScope, id: &str) -> String {
    format!("{}/{}/", slot_prefix(scope), id)
}

/// Build the store key prefix under which all of a scope's slots live
pub fn slot_prefix(scope: SlotScope) -> String {
    format!(
        "{}/{}/{}",
        ROOT_CHAIN.join("/"),
        scope.as_str(),
        SLOT_KEY_PREFIX
    )
}

/// One stored record: opaque bytes plus the generation of its last write
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvEntry {
    pub value: Vec<u8>,
    pub generation: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Inner {
    generation: u64,
    entries: HashMap<String, KvEntry>,
}

/// Durable KV store for one scope.
///
/// The in-memory map is the cache; every mutation rewrites the backing file
/// atomically (write-to-temp then rename) before the lock is dropped, so a
/// reader can never observe a generation that later disappears.
#[derive(Debug)]
pub struct DataStore {
    scope: SlotScope,
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl DataStore {
    /// Open (or create) the store for one scope under the daemon data root
    pub fn open(data_root: &Path, scope: SlotScope) -> Result<Self> {
        let dir = data_root.join(STORE_DIR);
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}.json", scope.as_str()));

        let inner = if path.exists() {
            let bytes = fs::read(&path)?;
            serde_json::from_slice(&bytes)?
        } else {
            Inner::default()
        };
        debug!(
            scope = scope.as_str(),
            entries = inner.entries.len(),
            "opened slot store"
        );

        Ok(Self {
            scope,
            path,
            inner: Mutex::new(inner),
        })
    }

    /// Scope this store persists
    pub fn scope(&self) -> SlotScope {
        self.scope
    }

    /// Fetch a record and the generation of its last write
    pub fn get(&self, key: &str) -> Result<(Vec<u8>, u64)> {
        let inner = self.inner.lock().unwrap();
        let entry = inner.entries.get(key).ok_or(StoreError::NotFound)?;
        Ok((entry.value.clone(), entry.generation))
    }

    /// Unconditional write; returns the new generation
    pub fn put(&self, key: &str, value: Vec<u8>) -> Result<u64> {
        if value.is_empty() {
            return Err(StoreError::BadRequest(format!(
                "invalid KV record with an empty value for key {}",
                key
            )));
        }
        let mut inner = self.inner.lock().unwrap();
        inner.generation += 1;
        let generation = inner.generation;
        inner.entries.insert(key.to_string(), KvEntry { value, generation });
        self.flush_locked(&inner)?;
        Ok(generation)
    }

    /// Compare-and-swap write.
    ///
    /// `prev = None` asserts the key does not exist yet; `prev = Some(g)`
    /// asserts the stored generation is still `g`. Either assertion failing
    /// returns `KeyModified`.
    pub fn put_atomic(&self, key: &str, value: Vec<u8>, prev: Option<u64>) -> Result<u64> {
        if value.is_empty() {
            return Err(StoreError::BadRequest(format!(
                "invalid KV record with an empty value for key {}",
                key
            )));
        }
        let mut inner = self.inner.lock().unwrap();
        match (prev, inner.entries.get(key)) {
            (None, None) => {}
            (Some(g), Some(entry)) if entry.generation == g => {}
            _ => return Err(StoreError::KeyModified),
        }
        inner.generation += 1;
        let generation = inner.generation;
        inner.entries.insert(key.to_string(), KvEntry { value, generation });
        self.flush_locked(&inner)?;
        Ok(generation)
    }

    /// Compare-and-swap delete
    pub fn delete_atomic(&self, key: &str, prev: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.entries.get(key) {
            None => return Err(StoreError::NotFound),
            Some(entry) if entry.generation != prev => return Err(StoreError::KeyModified),
            Some(_) => {}
        }
        inner.entries.remove(key);
        inner.generation += 1;
        self.flush_locked(&inner)?;
        Ok(())
    }

    /// List all records under a key prefix, sorted by key
    pub fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>, u64)>> {
        let inner = self.inner.lock().unwrap();
        let mut records: Vec<_> = inner
            .entries
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && !entry.value.is_empty())
            .map(|(key, entry)| (key.clone(), entry.value.clone(), entry.generation))
            .collect();
        records.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(records)
    }

    fn flush_locked(&self, inner: &Inner) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(inner)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
