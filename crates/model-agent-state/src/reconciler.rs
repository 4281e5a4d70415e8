//! The per-node model state reconciler
//!
//! One [`ModelStateReconciler`] owns the node's ConfigMap. Entry updates live
//! in [`crate::updater`], the self-healing loop in [`crate::reconcile`] and
//! artifact bookkeeping in [`crate::artifact`].

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use kube::Client;
use tokio_util::sync::CancellationToken;

use crate::cache::{CacheEntry, ModelCache};
use crate::config::ReconcilerConfig;
use crate::key::ModelRef;
use crate::store::{ConfigMapStore, KubeConfigMapStore, RecordIdentity};

/// Keeps the node's model ConfigMap in line with what the agent knows
pub struct ModelStateReconciler {
    pub(crate) store: Arc<dyn ConfigMapStore>,
    pub(crate) identity: RecordIdentity,
    pub(crate) cache: ModelCache,
    pub(crate) config: ReconcilerConfig,
    /// Set while a reconciliation pass runs
    pub(crate) reconciling: AtomicBool,
    pub(crate) shutdown: CancellationToken,
}

impl ModelStateReconciler {
    /// Reconciler writing through `store`
    pub fn new(config: ReconcilerConfig, store: Arc<dyn ConfigMapStore>) -> Self {
        let identity = RecordIdentity::new(config.node_name.clone(), config.namespace.clone());
        Self {
            store,
            identity,
            cache: ModelCache::new(),
            config,
            reconciling: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    /// Reconciler writing to the cluster `client` points at
    pub fn for_cluster(config: ReconcilerConfig, client: Client) -> Self {
        let store = Arc::new(KubeConfigMapStore::new(client, &config.namespace));
        Self::new(config, store)
    }

    /// Node whose record this reconciler owns
    pub fn node_name(&self) -> &str {
        self.identity.name()
    }

    /// Configuration in use
    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Snapshot of every cached model, ordered by key
    pub fn cached_models(&self) -> BTreeMap<String, CacheEntry> {
        self.cache.snapshot()
    }

    /// Cached state of one model
    pub fn cached_entry(&self, model: &ModelRef) -> Option<CacheEntry> {
        self.cache.get(&model.key())
    }
}
