//! In-memory ConfigMap store for tests
//!
//! Behaves like the API server for a single object: `resourceVersion` starts at
//! 1 on create and increases on every write, and an update carrying a stale
//! version is rejected with a conflict. Faults can be injected per call.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use model_agent_common::StoreError;
use parking_lot::Mutex;

use crate::store::ConfigMapStore;

#[derive(Default)]
struct State {
    record: Option<ConfigMap>,
    version: u64,
    conflicts_to_inject: u32,
    transport_failures_to_inject: u32,
}

/// Shared fake of the API server holding at most one ConfigMap
#[derive(Default)]
pub(crate) struct InMemoryStore {
    state: Mutex<State>,
    writes: AtomicU64,
    yield_after_read: AtomicBool,
    hang_reads: AtomicBool,
}

impl InMemoryStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Yield to the scheduler between reading and returning a record, so
    /// concurrent read-modify-write cycles interleave
    pub(crate) fn interleave_reads(self) -> Self {
        self.yield_after_read.store(true, Ordering::SeqCst);
        self
    }

    /// Make every `get` wait forever
    pub(crate) fn hang_reads(&self) {
        self.hang_reads.store(true, Ordering::SeqCst);
    }

    /// Reject the next `n` updates with a version conflict
    pub(crate) fn inject_conflicts(&self, n: u32) {
        self.state.lock().conflicts_to_inject = n;
    }

    /// Fail the next `n` calls of any kind with a transport error
    pub(crate) fn inject_transport_failures(&self, n: u32) {
        self.state.lock().transport_failures_to_inject = n;
    }

    /// Current stored record
    pub(crate) fn record(&self) -> Option<ConfigMap> {
        self.state.lock().record.clone()
    }

    /// Current payload, empty if there is no record
    pub(crate) fn data(&self) -> BTreeMap<String, String> {
        self.record()
            .and_then(|record| record.data)
            .unwrap_or_default()
    }

    /// Current resourceVersion counter
    pub(crate) fn version(&self) -> u64 {
        self.state.lock().version
    }

    /// Number of successful creates and updates
    pub(crate) fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Delete the record behind the agent's back
    pub(crate) fn remove_record(&self) {
        self.state.lock().record = None;
    }

    /// Remove one key from the payload behind the agent's back
    pub(crate) fn remove_key(&self, key: &str) {
        let mut state = self.state.lock();
        state.version += 1;
        let version = state.version;
        if let Some(record) = state.record.as_mut() {
            if let Some(data) = record.data.as_mut() {
                data.remove(key);
            }
            record.metadata.resource_version = Some(version.to_string());
        }
    }

    /// Write a raw payload value behind the agent's back
    pub(crate) fn put_raw(&self, key: &str, raw: &str) {
        let mut state = self.state.lock();
        state.version += 1;
        let version = state.version;
        if let Some(record) = state.record.as_mut() {
            record
                .data
                .get_or_insert_with(BTreeMap::new)
                .insert(key.to_string(), raw.to_string());
            record.metadata.resource_version = Some(version.to_string());
        }
    }

    fn take_transport_failure(state: &mut State, name: &str) -> Result<(), StoreError> {
        if state.transport_failures_to_inject > 0 {
            state.transport_failures_to_inject -= 1;
            return Err(StoreError::transport(name, "injected transport failure"));
        }
        Ok(())
    }

    fn name_of(record: &ConfigMap) -> String {
        record.metadata.name.clone().unwrap_or_default()
    }
}

#[async_trait]
impl ConfigMapStore for InMemoryStore {
    async fn get(&self, name: &str) -> Result<ConfigMap, StoreError> {
        if self.hang_reads.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        let result = {
            let mut state = self.state.lock();
            Self::take_transport_failure(&mut state, name).and_then(|_| {
                state.record.clone().ok_or_else(|| StoreError::NotFound {
                    name: name.to_string(),
                })
            })
        };

        if self.yield_after_read.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }
        result
    }

    async fn create(&self, record: &ConfigMap) -> Result<ConfigMap, StoreError> {
        let name = Self::name_of(record);
        let mut state = self.state.lock();
        Self::take_transport_failure(&mut state, &name)?;
        if state.record.is_some() {
            return Err(StoreError::AlreadyExists { name });
        }

        state.version += 1;
        let mut stored = record.clone();
        stored.metadata.resource_version = Some(state.version.to_string());
        state.record = Some(stored.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(stored)
    }

    async fn update(&self, record: &ConfigMap) -> Result<ConfigMap, StoreError> {
        let name = Self::name_of(record);
        let mut state = self.state.lock();
        Self::take_transport_failure(&mut state, &name)?;
        if state.conflicts_to_inject > 0 {
            state.conflicts_to_inject -= 1;
            return Err(StoreError::conflict(name, "injected conflict"));
        }

        let current = state
            .record
            .as_ref()
            .ok_or_else(|| StoreError::NotFound { name: name.clone() })?;
        if current.metadata.resource_version != record.metadata.resource_version {
            return Err(StoreError::conflict(
                name,
                "the object has been modified; please apply your changes to the latest version",
            ));
        }

        state.version += 1;
        let mut stored = record.clone();
        stored.metadata.resource_version = Some(state.version.to_string());
        state.record = Some(stored.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(stored)
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        Self::take_transport_failure(&mut state, name)?;
        state
            .record
            .take()
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound {
                name: name.to_string(),
            })
    }
}
