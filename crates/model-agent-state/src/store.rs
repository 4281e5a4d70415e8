//! Access to the per-node ConfigMap
//!
//! [`ConfigMapStore`] is the seam between reconciler logic and the API
//! server. The production implementation talks to Kubernetes through kube-rs;
//! tests use the mock generated by mockall or the in-memory store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{DeleteParams, PostParams};
use kube::{Api, Client};
#[cfg(test)]
use mockall::automock;
use model_agent_common::{
    StoreError, MANAGED_BY_ANNOTATION, MANAGED_BY_MODEL_AGENT, MODEL_STATUS_CONFIGMAP_LABEL,
    NODE_LABEL, NODE_NAME_ANNOTATION,
};
use tracing::debug;

/// Read and write access to ConfigMaps in one namespace
///
/// `update` is optimistic: the record's `resourceVersion` must match the
/// stored one or [`StoreError::Conflict`] is returned.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConfigMapStore: Send + Sync {
    /// Fetch a record by name
    async fn get(&self, name: &str) -> Result<ConfigMap, StoreError>;

    /// Create a record, failing with `AlreadyExists` if the name is taken
    async fn create(&self, record: &ConfigMap) -> Result<ConfigMap, StoreError>;

    /// Replace a record, failing with `Conflict` if it changed since it was read
    async fn update(&self, record: &ConfigMap) -> Result<ConfigMap, StoreError>;

    /// Delete a record by name
    async fn delete(&self, name: &str) -> Result<(), StoreError>;
}

/// Which write a kube error came from, for mapping 409 responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Write {
    Create,
    Update,
    Other,
}

/// Map a kube error onto the store taxonomy
fn classify(name: &str, write: Write, err: kube::Error) -> StoreError {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound {
            name: name.to_string(),
        },
        kube::Error::Api(ae) if ae.code == 409 && write == Write::Create => {
            StoreError::AlreadyExists {
                name: name.to_string(),
            }
        }
        kube::Error::Api(ae) if ae.code == 409 => StoreError::conflict(name, ae.message),
        other => StoreError::transport(name, other.to_string()),
    }
}

fn record_name(record: &ConfigMap) -> Result<&str, StoreError> {
    record
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| StoreError::transport("<unnamed>", "record has no metadata.name"))
}

/// [`ConfigMapStore`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeConfigMapStore {
    api: Api<ConfigMap>,
}

impl KubeConfigMapStore {
    /// Store for ConfigMaps in `namespace`
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl ConfigMapStore for KubeConfigMapStore {
    async fn get(&self, name: &str) -> Result<ConfigMap, StoreError> {
        self.api
            .get(name)
            .await
            .map_err(|e| classify(name, Write::Other, e))
    }

    async fn create(&self, record: &ConfigMap) -> Result<ConfigMap, StoreError> {
        let name = record_name(record)?;
        let created = self
            .api
            .create(&PostParams::default(), record)
            .await
            .map_err(|e| classify(name, Write::Create, e))?;
        debug!(configmap = %name, "Created ConfigMap");
        Ok(created)
    }

    async fn update(&self, record: &ConfigMap) -> Result<ConfigMap, StoreError> {
        let name = record_name(record)?;
        self.api
            .replace(name, &PostParams::default(), record)
            .await
            .map_err(|e| classify(name, Write::Update, e))
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.api
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| classify(name, Write::Other, e))
    }
}

/// Name, labels and annotations of one node's record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordIdentity {
    /// Node the record describes; also the record's name
    pub node_name: String,
    /// Namespace the record lives in
    pub namespace: String,
}

impl RecordIdentity {
    /// Identity of the record for `node_name` in `namespace`
    pub fn new(node_name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            namespace: namespace.into(),
        }
    }

    /// Name of the record
    pub fn name(&self) -> &str {
        &self.node_name
    }

    /// An unsaved record with the given payload
    pub fn new_record(&self, data: BTreeMap<String, String>) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(self.node_name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(BTreeMap::from([
                    (MODEL_STATUS_CONFIGMAP_LABEL.to_string(), "true".to_string()),
                    (NODE_LABEL.to_string(), self.node_name.clone()),
                ])),
                annotations: Some(BTreeMap::from([
                    (NODE_NAME_ANNOTATION.to_string(), self.node_name.clone()),
                    (
                        MANAGED_BY_ANNOTATION.to_string(),
                        MANAGED_BY_MODEL_AGENT.to_string(),
                    ),
                ])),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        }
    }
}

/// Fetch the node's record, or build an unsaved empty one if it is absent.
///
/// Returns `(record, true)` when the record still has to be created.
pub async fn get_or_init(
    store: &dyn ConfigMapStore,
    identity: &RecordIdentity,
) -> Result<(ConfigMap, bool), StoreError> {
    match store.get(identity.name()).await {
        Ok(record) => Ok((record, false)),
        Err(e) if e.is_not_found() => {
            debug!(configmap = %identity.name(), "ConfigMap not found, will create it");
            Ok((identity.new_record(BTreeMap::new()), true))
        }
        Err(e) => Err(e),
    }
}

/// Payload of a record, created empty if missing
pub fn record_data_mut(record: &mut ConfigMap) -> &mut BTreeMap<String, String> {
    record.data.get_or_insert_with(BTreeMap::new)
}

/// Raw entry stored at `key`, if any
pub fn record_entry<'a>(record: &'a ConfigMap, key: &str) -> Option<&'a str> {
    record.data.as_ref()?.get(key).map(String::as_str)
}
