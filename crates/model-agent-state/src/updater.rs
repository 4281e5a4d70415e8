//! Entry updates: status, metadata, progress and delete
//!
//! Every update is a read-modify-write of the whole ConfigMap. The closure run
//! under [`retry_on_conflict`] re-reads the record on each attempt, merges the
//! change into whatever entry is stored at the key and writes the record back
//! with the `resourceVersion` it read. Transport failures are retried around
//! that with [`retry_transient`]. The cache is only touched after the write
//! succeeded.

use model_agent_common::retry::{retry_on_conflict, retry_transient, DEFAULT_BACKOFF};
use model_agent_common::{Error, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::entry::{DownloadProgress, ModelEntry, ModelStatus};
use crate::key::ModelRef;
use crate::metadata::{convert_metadata_to_config, ModelMetadata};
use crate::reconciler::ModelStateReconciler;
use crate::store::{get_or_init, record_data_mut, record_entry};

/// Decode the entry stored at `key`, treating unreadable data as absent
fn decode_existing(key: &str, raw: &str) -> Option<ModelEntry> {
    match ModelEntry::decode(raw) {
        Ok(entry) => Some(entry),
        Err(e) => {
            warn!(model = %key, error = %e, "Stored model entry is unreadable, rebuilding it");
            None
        }
    }
}

impl ModelStateReconciler {
    /// Record the status of a model.
    ///
    /// Existing metadata is kept. `Ready` and `Failed` drop download progress
    /// in the same write. `Deleted` removes the model, see [`Self::delete`].
    #[instrument(skip(self, model, status, token), fields(model = %model, status = %status))]
    pub async fn set_status(
        &self,
        model: &ModelRef,
        status: ModelStatus,
        token: &CancellationToken,
    ) -> Result<()> {
        if status == ModelStatus::Deleted {
            return self.delete(model, token).await;
        }
        model.validate()?;
        let key = model.key();

        let entry = self
            .write_entry("set_status", &key, token, |current| match current {
                Some(mut entry) => {
                    entry.status = status;
                    if status.clears_progress() {
                        entry.progress = None;
                    }
                    entry
                }
                None => ModelEntry::new(model.name(), status),
            })
            .await?;

        self.cache.record_status(&key, model.name(), entry.status);
        info!(
            model = %key,
            status = %status,
            configmap = %self.node_name(),
            "Updated model status"
        );
        Ok(())
    }

    /// Record the metadata of a model.
    ///
    /// The stored status is kept; a model seen for the first time is `Ready`.
    #[instrument(skip(self, model, metadata, token), fields(model = %model))]
    pub async fn set_metadata(
        &self,
        model: &ModelRef,
        metadata: &ModelMetadata,
        token: &CancellationToken,
    ) -> Result<()> {
        model.validate()?;
        let key = model.key();
        let config = convert_metadata_to_config(metadata);

        let entry = self
            .write_entry("set_metadata", &key, token, |current| {
                let mut entry =
                    current.unwrap_or_else(|| ModelEntry::new(model.name(), ModelStatus::Ready));
                entry.config = Some(config.clone());
                entry
            })
            .await?;

        self.cache
            .record_metadata(&key, model.name(), entry.status, metadata.clone());
        info!(
            model = %key,
            status = %entry.status,
            configmap = %self.node_name(),
            "Updated model metadata"
        );
        Ok(())
    }

    /// Record or clear (`None`) the download progress of a model.
    ///
    /// Progress is not cached. A model seen for the first time is created as
    /// `Updating`.
    #[instrument(skip(self, model, progress, token), fields(model = %model))]
    pub async fn set_progress(
        &self,
        model: &ModelRef,
        progress: Option<DownloadProgress>,
        token: &CancellationToken,
    ) -> Result<()> {
        model.validate()?;
        let key = model.key();

        self.write_entry("set_progress", &key, token, |current| {
            let mut entry =
                current.unwrap_or_else(|| ModelEntry::new(model.name(), ModelStatus::Updating));
            entry.progress = progress.clone();
            entry
        })
        .await?;

        match &progress {
            Some(p) => debug!(
                model = %key,
                completed_bytes = p.completed_bytes,
                total_bytes = p.total_bytes,
                "Updated download progress"
            ),
            None => debug!(model = %key, "Cleared download progress"),
        }
        Ok(())
    }

    /// Remove a model from the ConfigMap and the cache.
    ///
    /// Succeeds when the key or the whole ConfigMap is already gone.
    #[instrument(skip(self, model, token), fields(model = %model))]
    pub async fn delete(&self, model: &ModelRef, token: &CancellationToken) -> Result<()> {
        model.validate()?;
        let key = model.key();
        let key_ref = key.as_str();

        let removed = retry_transient(&self.config.transient_retry, token, "delete", move || {
            retry_on_conflict(&DEFAULT_BACKOFF, token, "delete", move || async move {
                let mut record = match self.store.get(self.identity.name()).await {
                    Ok(record) => record,
                    Err(e) if e.is_not_found() => return Ok(false),
                    Err(e) => return Err(Error::store("delete", e)),
                };

                let removed = record
                    .data
                    .as_mut()
                    .is_some_and(|data| data.remove(key_ref).is_some());
                if !removed {
                    return Ok(false);
                }

                self.store
                    .update(&record)
                    .await
                    .map_err(|e| Error::store("delete", e))?;
                Ok(true)
            })
        })
        .await?;

        self.cache.remove(&key);
        if removed {
            info!(model = %key, configmap = %self.node_name(), "Deleted model from ConfigMap");
        } else {
            debug!(model = %key, "Model not present in ConfigMap, nothing to delete");
        }
        Ok(())
    }

    /// Read-modify-write of the entry at `key`, returning what was written
    async fn write_entry<F>(
        &self,
        operation: &str,
        key: &str,
        token: &CancellationToken,
        merge: F,
    ) -> Result<ModelEntry>
    where
        F: Fn(Option<ModelEntry>) -> ModelEntry + Sync,
    {
        let merge = &merge;
        retry_transient(&self.config.transient_retry, token, operation, move || {
            retry_on_conflict(&DEFAULT_BACKOFF, token, operation, move || async move {
                let (mut record, created) = get_or_init(self.store.as_ref(), &self.identity)
                    .await
                    .map_err(|e| Error::store(operation, e))?;

                let current = record_entry(&record, key).and_then(|raw| decode_existing(key, raw));
                let entry = merge(current);
                let raw = entry.encode(key)?;
                record_data_mut(&mut record).insert(key.to_string(), raw);

                let written = if created {
                    self.store.create(&record).await
                } else {
                    self.store.update(&record).await
                };
                written.map_err(|e| Error::store(operation, e))?;
                Ok(entry)
            })
        })
        .await
    }
}
