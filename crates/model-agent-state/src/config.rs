//! Reconciler configuration

use std::time::Duration;

use model_agent_common::retry::RetryConfig;
use model_agent_common::DEFAULT_AGENT_NAMESPACE;

/// Default period between reconciliation passes
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Default time allowed for restoring one entry
pub const DEFAULT_RESTORE_TIMEOUT: Duration = Duration::from_secs(10);

/// Settings for a [`crate::ModelStateReconciler`]
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Node this agent runs on; names the ConfigMap
    pub node_name: String,
    /// Namespace the ConfigMap lives in
    pub namespace: String,
    /// Period between reconciliation passes
    pub reconcile_interval: Duration,
    /// Deadline for restoring a single missing entry
    pub restore_timeout: Duration,
    /// Retry budget for transport failures in write paths
    pub transient_retry: RetryConfig,
}

impl ReconcilerConfig {
    /// Defaults for `node_name`
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            namespace: DEFAULT_AGENT_NAMESPACE.to_string(),
            reconcile_interval: DEFAULT_RECONCILE_INTERVAL,
            restore_timeout: DEFAULT_RESTORE_TIMEOUT,
            transient_retry: RetryConfig {
                max_attempts: 3,
                initial_delay: Duration::from_millis(200),
                max_delay: Duration::from_secs(2),
                backoff_multiplier: 2.0,
            },
        }
    }

    /// Use a different namespace
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Use a different reconciliation period
    pub fn with_reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = interval;
        self
    }

    /// Use a different transport retry budget
    pub fn with_transient_retry(mut self, retry: RetryConfig) -> Self {
        self.transient_retry = retry;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ReconcilerConfig::new("node-a");
        assert_eq!(config.node_name, "node-a");
        assert_eq!(config.namespace, "ome");
        assert_eq!(config.reconcile_interval, Duration::from_secs(300));
        assert_eq!(config.restore_timeout, Duration::from_secs(10));
        assert_eq!(config.transient_retry.max_attempts, 3);
    }

    #[test]
    fn builders_override_defaults() {
        let config = ReconcilerConfig::new("node-a")
            .with_namespace("models")
            .with_reconcile_interval(Duration::from_secs(30))
            .with_transient_retry(RetryConfig::with_max_attempts(1));
        assert_eq!(config.namespace, "models");
        assert_eq!(config.reconcile_interval, Duration::from_secs(30));
        assert_eq!(config.transient_retry.max_attempts, 1);
    }
}
