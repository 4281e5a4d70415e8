//! Common types for the model agent: errors, retry and telemetry

#![deny(missing_docs)]

pub mod error;
pub mod retry;
pub mod telemetry;

pub use error::{Error, StoreError};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace the model agent stores per-node ConfigMaps in by default
pub const DEFAULT_AGENT_NAMESPACE: &str = "ome";

/// Label marking a ConfigMap as a per-node model status record
pub const MODEL_STATUS_CONFIGMAP_LABEL: &str = "models.ome/basemodel-status";

/// Label carrying the node name on the per-node record
pub const NODE_LABEL: &str = "node";

/// Annotation carrying the node name on the per-node record
pub const NODE_NAME_ANNOTATION: &str = "models.ome.io/node-name";

/// Annotation naming the component that owns the per-node record
pub const MANAGED_BY_ANNOTATION: &str = "models.ome.io/managed-by";

/// Value of [`MANAGED_BY_ANNOTATION`] for records written by this agent
pub const MANAGED_BY_MODEL_AGENT: &str = "model-agent";
