//! Per-node model state for the model agent
//!
//! Each node publishes one ConfigMap, named after the node, with an entry per
//! model on that node: its status, extracted metadata and, while a download
//! runs, a progress snapshot. [`ModelStateReconciler`] owns that ConfigMap:
//!
//! - entry updates (`set_status`, `set_metadata`, `set_progress`, `delete`)
//!   are optimistic read-modify-writes retried on version conflicts
//! - an in-memory cache mirrors status and metadata of every model written
//! - a background loop rebuilds the ConfigMap, or single entries, from the
//!   cache when they disappear

#![deny(missing_docs)]

pub mod artifact;
pub mod cache;
pub mod config;
pub mod entry;
pub mod key;
pub mod metadata;
pub mod reconcile;
pub mod reconciler;
pub mod store;
pub mod updater;

#[cfg(test)]
pub(crate) mod testing;

pub use artifact::{find_matched_model, ArtifactMatch};
pub use cache::{CacheEntry, ModelCache};
pub use config::ReconcilerConfig;
pub use entry::{Artifact, DownloadProgress, ModelConfig, ModelEntry, ModelStatus, ProgressPhase};
pub use key::{parse_model_key, ModelRef, ModelScope};
pub use metadata::{
    convert_metadata_to_config, ModelApiCapability, ModelMetadata, ModelQuantization, NamedVersion,
};
pub use reconcile::ReconcileOutcome;
pub use reconciler::ModelStateReconciler;
pub use store::{ConfigMapStore, KubeConfigMapStore, RecordIdentity};
