//! Model references and the keys they map to in the per-node record
//!
//! Namespaced models live under `{namespace}.basemodel.{name}`, cluster-scoped
//! ones under `clusterbasemodel.{name}`. Segments that would push a key past
//! the ConfigMap key limit are shortened to `{sha256[..8]}-{tail}`, so the same
//! model always yields the same key and distinct long names stay apart.

use std::fmt;

use model_agent_common::{Error, Result};
use sha2::{Digest, Sha256};

/// Longest key a ConfigMap data map accepts
pub const MAX_CONFIGMAP_KEY_LENGTH: usize = 253;

/// Number of hex characters of the SHA-256 digest kept when truncating
pub const HASH_PREFIX_LENGTH: usize = 8;

/// Key segment for namespaced models
pub const BASE_MODEL_KEY_TYPE: &str = "basemodel";

/// Key prefix for cluster-scoped models
pub const CLUSTER_BASE_MODEL_KEY_TYPE: &str = "clusterbasemodel";

/// Shortest share of the key budget a truncated namespace or name keeps
const MIN_SEGMENT_LENGTH: usize = 8;

/// Which kind of model resource a reference points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelScope {
    /// A `BaseModel` living in a namespace
    Namespaced,
    /// A `ClusterBaseModel`
    Cluster,
}

/// Reference to one model known to this node
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ModelRef {
    /// A namespaced `BaseModel`
    Namespaced {
        /// Namespace of the model resource
        namespace: String,
        /// Name of the model resource
        name: String,
    },
    /// A cluster-scoped `ClusterBaseModel`
    Cluster {
        /// Name of the model resource
        name: String,
    },
}

impl ModelRef {
    /// Reference a namespaced model
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Namespaced {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Reference a cluster-scoped model
    pub fn cluster(name: impl Into<String>) -> Self {
        Self::Cluster { name: name.into() }
    }

    /// Name of the model resource
    pub fn name(&self) -> &str {
        match self {
            Self::Namespaced { name, .. } | Self::Cluster { name } => name,
        }
    }

    /// Namespace of the model resource, if namespaced
    pub fn namespace(&self) -> Option<&str> {
        match self {
            Self::Namespaced { namespace, .. } => Some(namespace),
            Self::Cluster { .. } => None,
        }
    }

    /// Scope of the referenced resource
    pub fn scope(&self) -> ModelScope {
        match self {
            Self::Namespaced { .. } => ModelScope::Namespaced,
            Self::Cluster { .. } => ModelScope::Cluster,
        }
    }

    /// Reject references that do not identify a model
    pub fn validate(&self) -> Result<()> {
        if self.name().is_empty() {
            return Err(Error::invalid_ref("model name is empty"));
        }
        if let Self::Namespaced { namespace, .. } = self {
            if namespace.is_empty() {
                return Err(Error::invalid_ref(format!(
                    "namespaced model {} has an empty namespace",
                    self.name()
                )));
            }
        }
        Ok(())
    }

    /// Key of this model in the per-node record
    pub fn key(&self) -> String {
        match self {
            Self::Namespaced { namespace, name } => namespaced_key(namespace, name),
            Self::Cluster { name } => cluster_key(name),
        }
    }
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Namespaced { namespace, name } => write!(f, "BaseModel {namespace}/{name}"),
            Self::Cluster { name } => write!(f, "ClusterBaseModel {name}"),
        }
    }
}

fn namespaced_key(namespace: &str, name: &str) -> String {
    // two dots around the type segment
    let available = MAX_CONFIGMAP_KEY_LENGTH - BASE_MODEL_KEY_TYPE.len() - 2;
    if namespace.len() + name.len() <= available {
        return format!("{namespace}.{BASE_MODEL_KEY_TYPE}.{name}");
    }

    let (namespace_len, name_len) = if available < 2 * MIN_SEGMENT_LENGTH {
        (available / 2, available - available / 2)
    } else if namespace.len() <= MIN_SEGMENT_LENGTH {
        (namespace.len(), available - namespace.len())
    } else {
        (MIN_SEGMENT_LENGTH, available - MIN_SEGMENT_LENGTH)
    };

    format!(
        "{}.{BASE_MODEL_KEY_TYPE}.{}",
        truncate_with_hash(namespace, namespace_len),
        truncate_with_hash(name, name_len)
    )
}

fn cluster_key(name: &str) -> String {
    let available = MAX_CONFIGMAP_KEY_LENGTH - CLUSTER_BASE_MODEL_KEY_TYPE.len() - 1;
    format!(
        "{CLUSTER_BASE_MODEL_KEY_TYPE}.{}",
        truncate_with_hash(name, available)
    )
}

/// Shorten `original` to at most `max_length` bytes.
///
/// Values that already fit are returned unchanged. Longer ones become the
/// first eight hex characters of their SHA-256 digest, a dash, and as much of
/// the tail of the original as still fits.
pub fn truncate_with_hash(original: &str, max_length: usize) -> String {
    if original.len() <= max_length {
        return original.to_string();
    }

    let digest = hex::encode(Sha256::digest(original.as_bytes()));
    let prefix = &digest[..HASH_PREFIX_LENGTH];

    let suffix_length = max_length.saturating_sub(HASH_PREFIX_LENGTH + 1);
    if suffix_length == 0 {
        return prefix[..max_length.min(HASH_PREFIX_LENGTH)].to_string();
    }

    let mut start = original.len() - suffix_length;
    while !original.is_char_boundary(start) {
        start += 1;
    }
    format!("{prefix}-{}", &original[start..])
}

/// Recover the model reference from a key.
///
/// Only keys that were not truncated parse back to the original reference.
/// Returns `None` for keys this agent does not write.
pub fn parse_model_key(key: &str) -> Option<ModelRef> {
    if let Some(name) = key
        .strip_prefix(CLUSTER_BASE_MODEL_KEY_TYPE)
        .and_then(|rest| rest.strip_prefix('.'))
    {
        return (!name.is_empty()).then(|| ModelRef::cluster(name));
    }

    let (namespace, rest) = key.split_once('.')?;
    let name = rest
        .strip_prefix(BASE_MODEL_KEY_TYPE)
        .and_then(|rest| rest.strip_prefix('.'))?;
    if namespace.is_empty() || name.is_empty() {
        return None;
    }
    Some(ModelRef::namespaced(namespace, name))
}
