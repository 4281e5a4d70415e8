//! Artifact sharing between models on the same node
//!
//! When a new model has the same artifact SHA as one already on disk, the
//! downloader links to the existing files instead of fetching them again. The
//! owning entry then lists the new path in `config.artifact.childrenPaths`.
//!
//! These helpers work on the raw JSON of each entry so that fields this agent
//! does not model survive the rewrite.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use model_agent_common::retry::{cancellable, retry_on_conflict, DEFAULT_RETRY};
use model_agent_common::{Error, Result};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::reconciler::ModelStateReconciler;
use crate::store::{record_data_mut, record_entry};

const CONFIG_FIELD: &str = "config";
const ARTIFACT_FIELD: &str = "artifact";
const SHA_FIELD: &str = "sha";
const PARENT_PATH_FIELD: &str = "parentPath";
const CHILDREN_PATHS_FIELD: &str = "childrenPaths";

/// An entry whose artifact has the SHA that was looked up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactMatch {
    /// Key of the matching entry
    pub key: String,
    /// The entry's `config.artifact.parentPath`
    pub parent_path: BTreeMap<String, String>,
}

/// Find the first entry (in key order) under `key_prefix` whose artifact SHA
/// is `target_sha`.
///
/// The prefix is compared case-insensitively. Entries that are not valid JSON
/// or have no parent path are skipped; if nothing matches and some entry could
/// not be parsed, the last parse error is returned.
pub fn find_matched_model(
    record: &ConfigMap,
    target_sha: &str,
    key_prefix: &str,
) -> Result<Option<ArtifactMatch>> {
    let Some(data) = record.data.as_ref() else {
        return Ok(None);
    };
    let prefix = key_prefix.to_lowercase();
    let mut last_error = None;

    for (key, raw) in data {
        if !key.to_lowercase().starts_with(&prefix) {
            continue;
        }

        let value: Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(e) => {
                error!(model = %key, error = %e, "Skipping unreadable entry during artifact lookup");
                last_error = Some(Error::encoding(key.as_str(), e.to_string()));
                continue;
            }
        };

        let artifact = &value[CONFIG_FIELD][ARTIFACT_FIELD];
        if artifact[SHA_FIELD].as_str() != Some(target_sha) {
            continue;
        }
        let Ok(parent_path) =
            serde_json::from_value::<BTreeMap<String, String>>(artifact[PARENT_PATH_FIELD].clone())
        else {
            continue;
        };

        return Ok(Some(ArtifactMatch {
            key: key.clone(),
            parent_path,
        }));
    }

    match last_error {
        Some(e) => Err(e),
        None => Ok(None),
    }
}

/// Add `new_path` to `config.artifact.childrenPaths` of the raw entry.
///
/// Missing `config`, `artifact` or `childrenPaths` are created. A path already
/// listed (ignoring case) is not added twice.
pub fn add_path_to_children_paths(key: &str, new_path: &str, raw: &str) -> Result<String> {
    let mut value: Value = serde_json::from_str(raw)
        .map_err(|e| Error::encoding(key, format!("invalid JSON: {e}")))?;
    let entry = value
        .as_object_mut()
        .ok_or_else(|| Error::encoding(key, "entry is not a JSON object"))?;

    let mut config = take_object(entry, CONFIG_FIELD);
    let mut artifact = take_object(&mut config, ARTIFACT_FIELD);
    let mut children = match artifact.remove(CHILDREN_PATHS_FIELD) {
        Some(Value::Array(children)) => children,
        _ => Vec::new(),
    };

    let listed = children
        .iter()
        .filter_map(Value::as_str)
        .any(|path| path.eq_ignore_ascii_case(new_path));
    if !listed {
        children.push(Value::String(new_path.to_string()));
    }

    artifact.insert(CHILDREN_PATHS_FIELD.to_string(), Value::Array(children));
    config.insert(ARTIFACT_FIELD.to_string(), Value::Object(artifact));
    entry.insert(CONFIG_FIELD.to_string(), Value::Object(config));

    serde_json::to_string(&value).map_err(|e| Error::encoding(key, e.to_string()))
}

/// Remove `field` from `parent`, returning it if it was an object
fn take_object(parent: &mut Map<String, Value>, field: &str) -> Map<String, Value> {
    match parent.remove(field) {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

impl ModelStateReconciler {
    /// Read the ConfigMap, apply `mutate` and write it back, retrying on
    /// conflicts with a fresh read each time.
    ///
    /// Unlike entry updates, this never creates the ConfigMap.
    pub async fn update_record_with_retry<F>(
        &self,
        operation: &str,
        token: &CancellationToken,
        mutate: F,
    ) -> Result<()>
    where
        F: Fn(&mut ConfigMap) -> Result<()> + Sync,
    {
        let mutate = &mutate;
        retry_on_conflict(&DEFAULT_RETRY, token, operation, move || async move {
            let mut record = self
                .store
                .get(self.identity.name())
                .await
                .map_err(|e| Error::store(operation, e))?;
            mutate(&mut record)?;
            self.store
                .update(&record)
                .await
                .map_err(|e| Error::store(operation, e))?;
            Ok(())
        })
        .await
    }

    /// Record that `path` reuses the files of the model stored at `key`
    pub async fn add_children_path(
        &self,
        key: &str,
        path: &str,
        token: &CancellationToken,
    ) -> Result<()> {
        let result = self
            .update_record_with_retry("add_children_path", token, |record| {
                let existing = record_entry(record, key).ok_or_else(|| {
                    Error::missing("add_children_path", format!("key {key} not found in ConfigMap"))
                })?;
                let merged = add_path_to_children_paths(key, path, existing)?;
                record_data_mut(record).insert(key.to_string(), merged);
                Ok(())
            })
            .await;

        match &result {
            Ok(()) => info!(model = %key, path = %path, "Added children path"),
            Err(e) => error!(model = %key, path = %path, error = %e, "Failed to add children path"),
        }
        result
    }

    /// Look up a model on this node by artifact SHA, see [`find_matched_model`]
    pub async fn model_data_by_artifact_sha(
        &self,
        target_sha: &str,
        key_prefix: &str,
        token: &CancellationToken,
    ) -> Result<Option<ArtifactMatch>> {
        let record = cancellable(token, "artifact_lookup", async {
            self.store
                .get(self.identity.name())
                .await
                .map_err(|e| {
                    if e.is_not_found() {
                        Error::missing(
                            "artifact_lookup",
                            format!("cannot find configmap {}", self.node_name()),
                        )
                    } else {
                        Error::store("artifact_lookup", e)
                    }
                })
        })
        .await?;

        find_matched_model(&record, target_sha, key_prefix)
    }
}
