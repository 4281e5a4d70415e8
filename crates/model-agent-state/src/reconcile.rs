//! Self-healing of the node's ConfigMap
//!
//! A background task compares the ConfigMap against the cache on a fixed
//! period. A missing ConfigMap is recreated from the whole cache; cached models
//! missing from an existing ConfigMap are restored one by one.
//!
//! Only one pass runs at a time. Stopping the reconciler ends the loop at the
//! next wait; a pass already running finishes first.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use model_agent_common::{Error, Result};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::cache::CacheEntry;
use crate::reconciler::ModelStateReconciler;
use crate::store::{record_data_mut, record_entry};

/// Attempts a single-entry restore makes before giving up on conflicts
pub const RESTORE_ATTEMPTS: u32 = 3;

/// Shortest period the loop accepts
pub const MIN_RECONCILE_INTERVAL: Duration = Duration::from_secs(1);

/// What one reconciliation pass did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Another pass was already running
    Skipped,
    /// The ConfigMap and the cache agree
    InSync,
    /// The ConfigMap was missing and the cache was empty
    NothingToRecreate,
    /// The ConfigMap was missing and has been rebuilt with this many entries
    Recreated {
        /// Entries written
        entries: usize,
    },
    /// Entries missing from the ConfigMap were written back
    Restored {
        /// Entries restored
        restored: usize,
        /// Entries that could not be restored
        failed: usize,
    },
    /// The pass could not complete; the next one will try again
    Failed,
}

/// Clears the in-flight flag when a pass ends, however it ends
struct PassGuard<'a>(&'a AtomicBool);

impl<'a> PassGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ModelStateReconciler {
    /// Start the reconciliation loop in the background.
    ///
    /// The first pass runs immediately, then one per `reconcile_interval`.
    /// The task ends after [`Self::stop_reconciliation`].
    pub fn start_reconciliation(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        let period = self.config.reconcile_interval.max(MIN_RECONCILE_INTERVAL);

        info!(
            configmap = %self.node_name(),
            interval_secs = period.as_secs(),
            "Starting ConfigMap reconciliation"
        );

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => {
                        info!(configmap = %this.node_name(), "ConfigMap reconciliation stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let outcome = this.reconcile_once().await;
                        debug!(configmap = %this.node_name(), ?outcome, "Reconciliation pass finished");
                    }
                }
            }
        })
    }

    /// Ask the loop to stop. Safe to call more than once.
    pub fn stop_reconciliation(&self) {
        if !self.shutdown.is_cancelled() {
            info!(configmap = %self.node_name(), "Stopping ConfigMap reconciliation");
            self.shutdown.cancel();
        }
    }

    /// Run one reconciliation pass now.
    ///
    /// Never fails: problems are logged and reported in the outcome.
    #[instrument(skip(self), fields(configmap = %self.node_name()))]
    pub async fn reconcile_once(&self) -> ReconcileOutcome {
        let Some(_guard) = PassGuard::acquire(&self.reconciling) else {
            debug!(configmap = %self.node_name(), "Reconciliation already running, skipping");
            return ReconcileOutcome::Skipped;
        };

        let record = match self.store.get(self.identity.name()).await {
            Ok(record) => record,
            Err(e) if e.is_not_found() => {
                warn!(configmap = %self.node_name(), "ConfigMap is missing, recreating it from cache");
                return match self.recreate_record().await {
                    Ok(0) => ReconcileOutcome::NothingToRecreate,
                    Ok(entries) => ReconcileOutcome::Recreated { entries },
                    Err(e) => {
                        error!(configmap = %self.node_name(), error = %e, "Failed to recreate ConfigMap");
                        ReconcileOutcome::Failed
                    }
                };
            }
            Err(e) => {
                error!(configmap = %self.node_name(), error = %e, "Failed to read ConfigMap");
                return ReconcileOutcome::Failed;
            }
        };

        let missing: Vec<(String, CacheEntry)> = self
            .cache
            .snapshot()
            .into_iter()
            .filter(|(key, _)| record_entry(&record, key).is_none())
            .collect();

        if missing.is_empty() {
            debug!(configmap = %self.node_name(), "ConfigMap in sync with cache");
            return ReconcileOutcome::InSync;
        }

        let mut restored = 0;
        let mut failed = 0;
        for (key, entry) in &missing {
            warn!(model = %key, "Model missing from ConfigMap, restoring from cache");
            let result = tokio::time::timeout(
                self.config.restore_timeout,
                self.restore_entry(key, entry),
            )
            .await
            .unwrap_or_else(|_| Err(Error::cancelled("restore")));

            match result {
                Ok(()) => restored += 1,
                Err(e) => {
                    error!(model = %key, error = %e, "Failed to restore model in ConfigMap");
                    failed += 1;
                }
            }
        }

        ReconcileOutcome::Restored { restored, failed }
    }

    /// Create the ConfigMap holding every cached model, returning the count
    async fn recreate_record(&self) -> Result<usize> {
        let snapshot = self.cache.snapshot();
        if snapshot.is_empty() {
            info!(configmap = %self.node_name(), "Cache is empty, nothing to recreate");
            return Ok(0);
        }

        let mut data = BTreeMap::new();
        for (key, entry) in &snapshot {
            match entry.to_model_entry().encode(key) {
                Ok(raw) => {
                    data.insert(key.clone(), raw);
                }
                Err(e) => error!(model = %key, error = %e, "Skipping model that cannot be encoded"),
            }
        }

        let entries = data.len();
        self.store
            .create(&self.identity.new_record(data))
            .await
            .map_err(|e| Error::store("recreate", e))?;

        info!(configmap = %self.node_name(), entries, "Recreated ConfigMap from cache");
        Ok(entries)
    }

    /// Write one cached model back into the ConfigMap.
    ///
    /// Only fills a missing key: an entry found on any fresh read wins over
    /// the cached copy, since it may carry progress or a newer status.
    async fn restore_entry(&self, key: &str, cached: &CacheEntry) -> Result<()> {
        let raw = cached.to_model_entry().encode(key)?;

        let mut record = match self.store.get(self.identity.name()).await {
            Ok(record) => record,
            Err(e) if e.is_not_found() => {
                warn!(model = %key, "ConfigMap disappeared during restore, recreating it");
                return self.recreate_record().await.map(|_| ());
            }
            Err(e) => return Err(Error::store("restore", e)),
        };

        for attempt in 1..=RESTORE_ATTEMPTS {
            // a writer put the key back since the pass read; its entry is newer
            if record_entry(&record, key).is_some() {
                debug!(model = %key, "Model reappeared in ConfigMap, skipping restore");
                return Ok(());
            }
            record_data_mut(&mut record).insert(key.to_string(), raw.clone());

            match self.store.update(&record).await {
                Ok(_) => {
                    info!(model = %key, status = %cached.status, "Restored model in ConfigMap");
                    return Ok(());
                }
                Err(e) if e.is_conflict() && attempt < RESTORE_ATTEMPTS => {
                    debug!(model = %key, attempt, "Conflict restoring model, re-reading ConfigMap");
                    record = self
                        .store
                        .get(self.identity.name())
                        .await
                        .map_err(|e| Error::store("restore", e))?;
                }
                Err(e) if e.is_conflict() => break,
                Err(e) => return Err(Error::store("restore", e)),
            }
        }

        Err(Error::VersionExhausted {
            context: "restore".to_string(),
            attempts: RESTORE_ATTEMPTS,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use k8s_openapi::api::core::v1::ConfigMap;
    use model_agent_common::StoreError;
    use tokio_util::sync::CancellationToken;

    use crate::config::ReconcilerConfig;
    use crate::entry::{DownloadProgress, ModelEntry, ModelStatus, ProgressPhase};
    use crate::key::ModelRef;
    use crate::metadata::{convert_metadata_to_config, ModelMetadata};
    use crate::store::{ConfigMapStore, MockConfigMapStore, RecordIdentity};
    use mockall::Sequence;
    use crate::testing::InMemoryStore;

    fn reconciler(store: Arc<dyn ConfigMapStore>) -> Arc<ModelStateReconciler> {
        let config =
            ReconcilerConfig::new("node-a").with_reconcile_interval(Duration::from_secs(60));
        Arc::new(ModelStateReconciler::new(config, store))
    }

    fn bert() -> ModelMetadata {
        ModelMetadata {
            model_type: "bert".to_string(),
            model_architecture: "BertModel".to_string(),
            ..Default::default()
        }
    }

    fn record_with(data: &[(&str, &str)]) -> ConfigMap {
        let data = data
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RecordIdentity::new("node-a", "ome").new_record(data)
    }

    /// An entry a downloader wrote while the pass was running
    fn live_entry() -> String {
        let mut entry = ModelEntry::new("m", ModelStatus::Updating);
        entry.progress = Some(DownloadProgress::new(
            ProgressPhase::Downloading,
            1000,
            400,
            2,
            1,
            50.0,
        ));
        entry.encode("default.basemodel.m").unwrap()
    }

    /// Two models: one with metadata, one status-only
    async fn populate(reconciler: &ModelStateReconciler) -> (ModelRef, ModelRef) {
        let token = CancellationToken::new();
        let with_metadata = ModelRef::namespaced("default", "bert");
        let status_only = ModelRef::cluster("llama");

        reconciler
            .set_metadata(&with_metadata, &bert(), &token)
            .await
            .unwrap();
        reconciler
            .set_status(&status_only, ModelStatus::Updating, &token)
            .await
            .unwrap();
        (with_metadata, status_only)
    }

    #[tokio::test]
    async fn in_sync_record_is_left_alone() {
        let store = Arc::new(InMemoryStore::new());
        let reconciler = reconciler(store.clone());
        populate(&reconciler).await;
        let writes = store.writes();

        assert_eq!(reconciler.reconcile_once().await, ReconcileOutcome::InSync);
        assert_eq!(store.writes(), writes);
    }

    /// Story: an operator deletes the ConfigMap and the agent rebuilds it
    #[tokio::test]
    async fn story_missing_record_is_recreated_from_cache() {
        let store = Arc::new(InMemoryStore::new());
        let reconciler = reconciler(store.clone());
        let (with_metadata, status_only) = populate(&reconciler).await;
        let token = CancellationToken::new();
        let progress = DownloadProgress::new(ProgressPhase::Downloading, 10, 5, 1, 0, 1.0);
        reconciler
            .set_progress(&status_only, Some(progress), &token)
            .await
            .unwrap();

        store.remove_record();
        assert_eq!(
            reconciler.reconcile_once().await,
            ReconcileOutcome::Recreated { entries: 2 }
        );

        let record = store.record().unwrap();
        assert_eq!(
            record.metadata.labels.as_ref().unwrap()["models.ome/basemodel-status"],
            "true"
        );

        let data = record.data.unwrap();
        assert_eq!(data.len(), 2);

        let restored = ModelEntry::decode(&data[&with_metadata.key()]).unwrap();
        assert_eq!(restored.status, ModelStatus::Ready);
        assert_eq!(restored.config, Some(convert_metadata_to_config(&bert())));

        // progress is never cached, so it does not come back
        let restored = ModelEntry::decode(&data[&status_only.key()]).unwrap();
        assert_eq!(restored, ModelEntry::new("llama", ModelStatus::Updating));
    }

    #[tokio::test]
    async fn missing_record_with_empty_cache_is_not_recreated() {
        let store = Arc::new(InMemoryStore::new());
        let reconciler = reconciler(store.clone());

        assert_eq!(
            reconciler.reconcile_once().await,
            ReconcileOutcome::NothingToRecreate
        );
        assert!(store.record().is_none());
    }

    /// Story: an entry removed by hand comes back, its neighbour is untouched
    #[tokio::test]
    async fn story_missing_key_is_restored() {
        let store = Arc::new(InMemoryStore::new());
        let reconciler = reconciler(store.clone());
        let (with_metadata, status_only) = populate(&reconciler).await;

        let untouched = store.data()[&status_only.key()].clone();
        store.remove_key(&with_metadata.key());

        assert_eq!(
            reconciler.reconcile_once().await,
            ReconcileOutcome::Restored {
                restored: 1,
                failed: 0
            }
        );

        let data = store.data();
        let restored = ModelEntry::decode(&data[&with_metadata.key()]).unwrap();
        assert_eq!(restored.status, ModelStatus::Ready);
        assert_eq!(restored.config, Some(convert_metadata_to_config(&bert())));
        assert_eq!(data[&status_only.key()], untouched);
    }

    #[tokio::test]
    async fn restore_retries_conflicts_up_to_its_budget() {
        let store = Arc::new(InMemoryStore::new());
        let reconciler = reconciler(store.clone());
        let (with_metadata, _) = populate(&reconciler).await;
        store.remove_key(&with_metadata.key());

        store.inject_conflicts(2);
        assert_eq!(
            reconciler.reconcile_once().await,
            ReconcileOutcome::Restored {
                restored: 1,
                failed: 0
            }
        );

        store.remove_key(&with_metadata.key());
        store.inject_conflicts(RESTORE_ATTEMPTS);
        assert_eq!(
            reconciler.reconcile_once().await,
            ReconcileOutcome::Restored {
                restored: 0,
                failed: 1
            }
        );
        assert!(!store.data().contains_key(&with_metadata.key()));
    }

    #[tokio::test]
    async fn read_failure_fails_the_pass_without_writing() {
        let mut store = MockConfigMapStore::new();
        store
            .expect_get()
            .times(1)
            .returning(|name| Err(StoreError::transport(name, "connection refused")));
        store.expect_create().never();
        store.expect_update().never();

        let reconciler = reconciler(Arc::new(store));
        assert_eq!(reconciler.reconcile_once().await, ReconcileOutcome::Failed);
    }

    #[tokio::test]
    async fn recreate_race_fails_the_pass() {
        // someone else recreates the ConfigMap between our read and our create
        let mut store = MockConfigMapStore::new();
        store.expect_get().times(1).returning(|name| {
            Err(StoreError::NotFound {
                name: name.to_string(),
            })
        });
        store.expect_create().times(1).returning(|record| {
            Err(StoreError::AlreadyExists {
                name: record.metadata.name.clone().unwrap_or_default(),
            })
        });

        let reconciler = reconciler(Arc::new(store));
        reconciler
            .cache
            .record_status("clusterbasemodel.llama", "llama", ModelStatus::Ready);
        assert_eq!(reconciler.reconcile_once().await, ReconcileOutcome::Failed);
    }

    /// Story: a download reports progress between the pass read and the
    /// restore, and the restore leaves the live entry alone
    #[tokio::test]
    async fn story_restore_yields_to_an_entry_written_meanwhile() {
        let key = ModelRef::namespaced("default", "m").key();
        let live = live_entry();

        let mut store = MockConfigMapStore::new();
        let mut seq = Sequence::new();
        store
            .expect_get()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(record_with(&[])));
        let reread = record_with(&[(key.as_str(), live.as_str())]);
        store
            .expect_get()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |_| Ok(reread.clone()));
        store.expect_update().never();
        store.expect_create().never();

        let reconciler = reconciler(Arc::new(store));
        reconciler.cache.record_status(&key, "m", ModelStatus::Ready);

        assert_eq!(
            reconciler.reconcile_once().await,
            ReconcileOutcome::Restored {
                restored: 1,
                failed: 0
            }
        );
    }

    #[tokio::test]
    async fn restore_rereads_after_conflict_and_keeps_the_winner() {
        let key = ModelRef::namespaced("default", "m").key();
        let live = live_entry();

        let mut store = MockConfigMapStore::new();
        let mut seq = Sequence::new();
        store
            .expect_get()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Ok(record_with(&[])));
        store
            .expect_update()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|record| {
                Err(StoreError::conflict(
                    record.metadata.name.clone().unwrap_or_default(),
                    "the object has been modified",
                ))
            });
        let reread = record_with(&[(key.as_str(), live.as_str())]);
        store
            .expect_get()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |_| Ok(reread.clone()));

        let reconciler = reconciler(Arc::new(store));
        reconciler.cache.record_status(&key, "m", ModelStatus::Ready);

        assert_eq!(
            reconciler.reconcile_once().await,
            ReconcileOutcome::Restored {
                restored: 1,
                failed: 0
            }
        );
    }

    /// Story: the ConfigMap vanishes while a single entry is being restored,
    /// so the whole record is rebuilt from cache
    #[tokio::test]
    async fn story_record_gone_mid_restore_is_recreated() {
        let key = ModelRef::namespaced("default", "m").key();

        let mut store = MockConfigMapStore::new();
        let mut seq = Sequence::new();
        store
            .expect_get()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(record_with(&[])));
        store
            .expect_get()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|name| {
                Err(StoreError::NotFound {
                    name: name.to_string(),
                })
            });
        let expected = key.clone();
        store
            .expect_create()
            .times(1)
            .in_sequence(&mut seq)
            .withf(move |record| {
                record
                    .data
                    .as_ref()
                    .is_some_and(|data| data.len() == 1 && data.contains_key(&expected))
            })
            .returning(|record| Ok(record.clone()));
        store.expect_update().never();

        let reconciler = reconciler(Arc::new(store));
        reconciler.cache.record_status(&key, "m", ModelStatus::Ready);

        assert_eq!(
            reconciler.reconcile_once().await,
            ReconcileOutcome::Restored {
                restored: 1,
                failed: 0
            }
        );
    }

    #[tokio::test]
    async fn overlapping_pass_is_skipped() {
        let store = Arc::new(InMemoryStore::new());
        let reconciler = reconciler(store.clone());

        let guard = PassGuard::acquire(&reconciler.reconciling).unwrap();
        assert_eq!(reconciler.reconcile_once().await, ReconcileOutcome::Skipped);
        drop(guard);

        assert_eq!(
            reconciler.reconcile_once().await,
            ReconcileOutcome::NothingToRecreate
        );
        assert!(!reconciler.reconciling.load(Ordering::Acquire));
    }

    #[tokio::test(start_paused = true)]
    async fn loop_runs_immediately_then_on_every_tick() {
        let store = Arc::new(InMemoryStore::new());
        let reconciler = reconciler(store.clone());
        populate(&reconciler).await;

        let handle = reconciler.start_reconciliation();

        // initial pass heals well before the first interval elapses
        store.remove_record();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(store.data().len(), 2);

        // nothing runs again until the next tick
        store.remove_record();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(store.record().is_none());

        // which heals again
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(store.data().len(), 2);

        reconciler.stop_reconciliation();
        reconciler.stop_reconciliation();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_ends_the_loop_before_the_next_pass() {
        let store = Arc::new(InMemoryStore::new());
        let reconciler = reconciler(store.clone());
        populate(&reconciler).await;

        let handle = reconciler.start_reconciliation();
        tokio::time::sleep(Duration::from_secs(1)).await;

        reconciler.stop_reconciliation();
        handle.await.unwrap();

        store.remove_record();
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(store.record().is_none());
    }
}
