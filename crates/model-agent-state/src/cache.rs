//! In-memory mirror of the entries this agent has written
//!
//! The cache is what the reconciliation loop rebuilds the ConfigMap from. It
//! holds status and metadata but never download progress.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;

use crate::entry::{ModelEntry, ModelStatus};
use crate::metadata::{convert_metadata_to_config, ModelMetadata};

/// Last known state of one model
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    /// Display name of the model
    pub name: String,
    /// Last status written
    pub status: ModelStatus,
    /// Last metadata written, if any
    pub metadata: Option<ModelMetadata>,
}

impl CacheEntry {
    /// The entry as it should appear in the ConfigMap
    pub fn to_model_entry(&self) -> ModelEntry {
        let mut entry = ModelEntry::new(self.name.clone(), self.status);
        entry.config = self.metadata.as_ref().map(convert_metadata_to_config);
        entry
    }
}

/// Thread-safe map from model key to [`CacheEntry`]
#[derive(Debug, Default)]
pub struct ModelCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl ModelCache {
    /// Empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a status, keeping any cached metadata
    pub fn record_status(&self, key: &str, name: &str, status: ModelStatus) {
        let mut entries = self.entries.write();
        entries
            .entry(key.to_string())
            .and_modify(|entry| entry.status = status)
            .or_insert_with(|| CacheEntry {
                name: name.to_string(),
                status,
                metadata: None,
            });
    }

    /// Record metadata together with the status it was persisted with
    pub fn record_metadata(
        &self,
        key: &str,
        name: &str,
        status: ModelStatus,
        metadata: ModelMetadata,
    ) {
        let mut entries = self.entries.write();
        match entries.get_mut(key) {
            Some(entry) => {
                entry.status = status;
                entry.metadata = Some(metadata);
            }
            None => {
                entries.insert(
                    key.to_string(),
                    CacheEntry {
                        name: name.to_string(),
                        status,
                        metadata: Some(metadata),
                    },
                );
            }
        }
    }

    /// Forget a model
    pub fn remove(&self, key: &str) -> Option<CacheEntry> {
        self.entries.write().remove(key)
    }

    /// Copy of one entry
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        self.entries.read().get(key).cloned()
    }

    /// Copy of every entry, ordered by key.
    ///
    /// The read lock is released before this returns, so callers can do I/O
    /// with the result.
    pub fn snapshot(&self) -> BTreeMap<String, CacheEntry> {
        self.entries
            .read()
            .iter()
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect()
    }

    /// Number of cached models
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True if no model is cached
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
