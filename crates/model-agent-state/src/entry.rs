//! Model entries as stored in the per-node record
//!
//! Each data key of the ConfigMap holds one [`ModelEntry`] encoded as JSON.
//! Fields this agent does not know about are kept in `extra` maps so that a
//! read-modify-write never drops what another writer added.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{SecondsFormat, Utc};
use model_agent_common::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Status of a model on this node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelStatus {
    /// Model files are present and usable
    Ready,
    /// Model is being downloaded or verified
    Updating,
    /// Download or verification failed
    Failed,
    /// Directive to remove the model; never persisted
    Deleted,
}

impl ModelStatus {
    /// Wire name of the status
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "Ready",
            Self::Updating => "Updating",
            Self::Failed => "Failed",
            Self::Deleted => "Deleted",
        }
    }

    /// Terminal statuses drop any download progress along with the write
    pub fn clears_progress(&self) -> bool {
        matches!(self, Self::Ready | Self::Failed)
    }
}

impl fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage of an in-flight download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgressPhase {
    /// Listing remote files and sizes
    Scanning,
    /// Transferring bytes
    Downloading,
    /// Verifying and moving files into place
    Finalizing,
}

/// Snapshot of a download, written by the downloader while it runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgress {
    /// Current stage
    pub phase: ProgressPhase,
    /// Bytes to download in total
    pub total_bytes: u64,
    /// Bytes downloaded so far
    pub completed_bytes: u64,
    /// Files to download in total
    pub total_files: u32,
    /// Files downloaded so far
    pub completed_files: u32,
    /// Current transfer rate
    pub speed_bytes_per_sec: f64,
    /// RFC 3339 UTC time the snapshot was taken
    pub last_updated: String,
}

impl DownloadProgress {
    /// Build a snapshot stamped with the current time
    pub fn new(
        phase: ProgressPhase,
        total_bytes: u64,
        completed_bytes: u64,
        total_files: u32,
        completed_files: u32,
        speed_bytes_per_sec: f64,
    ) -> Self {
        Self {
            phase,
            total_bytes,
            completed_bytes,
            total_files,
            completed_files,
            speed_bytes_per_sec,
            last_updated: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }

    /// Completed share of the bytes, 0 to 100
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.completed_bytes as f64 / self.total_bytes as f64 * 100.0
    }
}

/// Where a model's files live and which other models share them
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    /// Content hash of the downloaded artifact
    #[serde(default)]
    pub sha: String,
    /// Model owning the files this model reuses, mapped to their path
    #[serde(default)]
    pub parent_path: Option<BTreeMap<String, String>>,
    /// Paths of models that reuse this model's files
    #[serde(default)]
    pub children_paths: Option<Vec<String>>,
}

impl Artifact {
    /// True when the descriptor carries nothing worth persisting
    pub fn is_empty(&self) -> bool {
        self.sha.is_empty() && self.parent_path.is_none() && self.children_paths.is_none()
    }
}

fn is_zero(value: &i32) -> bool {
    *value == 0
}

/// Model metadata as persisted in an entry's `config`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    /// Model family, e.g. "llama"
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model_type: String,
    /// Architecture class name, e.g. "LlamaForCausalLM"
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model_architecture: String,
    /// `{name, version?}` of the framework the model was built with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_framework: Option<BTreeMap<String, String>>,
    /// `{name, version?}` of the weight format
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_format: Option<BTreeMap<String, String>>,
    /// Human-readable parameter count, e.g. "7B"
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model_parameter_size: String,
    /// Context length
    #[serde(default, skip_serializing_if = "is_zero")]
    pub max_tokens: i32,
    /// Task capabilities, e.g. "TEXT_GENERATION"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_capabilities: Option<Vec<String>>,
    /// Wire names of the inference APIs the model serves
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_capabilities: Option<Vec<String>>,
    /// Parsed model configuration file (e.g. `config.json`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decoded_model_configuration: Option<serde_json::Map<String, Value>>,
    /// Quantization wire name, empty when unquantized
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub quantization: String,
    /// Where the weights live on this node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Artifact>,
    /// Fields written by newer agents or other tools
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// One model's record in the per-node ConfigMap
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    /// Display name of the model
    pub name: String,
    /// Current status
    pub status: ModelStatus,
    /// Metadata, once it has been extracted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ModelConfig>,
    /// Live download progress, cleared when the model settles
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<DownloadProgress>,
    /// Fields written by newer agents or other tools
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ModelEntry {
    /// An entry with only name and status
    pub fn new(name: impl Into<String>, status: ModelStatus) -> Self {
        Self {
            name: name.into(),
            status,
            config: None,
            progress: None,
            extra: BTreeMap::new(),
        }
    }

    /// Serialize for storage at `key`.
    ///
    /// JSON has no representation for NaN or infinite numbers, so a progress
    /// snapshot carrying one is rejected instead of being written as `null`.
    pub fn encode(&self, key: &str) -> Result<String> {
        if let Some(progress) = &self.progress {
            if !progress.speed_bytes_per_sec.is_finite() {
                return Err(Error::encoding(
                    key,
                    format!(
                        "progress speed {} is not a finite number",
                        progress.speed_bytes_per_sec
                    ),
                ));
            }
        }
        serde_json::to_string(self).map_err(|e| Error::encoding(key, e.to_string()))
    }

    /// Parse a stored entry
    pub fn decode(raw: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
