//! Status write path: CRD status subresource plus the in-memory view cache.

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use redis_operator::provider::StatusSink;
use redis_operator::status::{ClusterView, StatusReport};
use redis_operator::{LifecycleState, OperatorError, Result};

use crate::crd::{RedisCluster, RedisClusterStatus};
use crate::error::Error;
use crate::metrics;

/// Latest diagnostic view per cluster, keyed by `namespace/name`.
#[derive(Default)]
pub struct ViewCache {
    views: RwLock<HashMap<String, ClusterView>>,
}

impl ViewCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<ClusterView> {
        self.views.read().get(key).cloned()
    }

    pub fn insert(&self, key: impl Into<String>, view: ClusterView) {
        self.views.write().insert(key.into(), view);
    }

    pub fn remove(&self, key: &str) {
        self.views.write().remove(key);
    }
}

pub fn instance_key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

/// `StatusSink` for one RedisCluster.
pub struct CrdStatusSink {
    api: Api<RedisCluster>,
    namespace: String,
    name: String,
    /// Status as last read or written, for carrying the transition time.
    last: Mutex<Option<RedisClusterStatus>>,
    views: Arc<ViewCache>,
}

impl CrdStatusSink {
    pub fn new(
        api: Api<RedisCluster>,
        namespace: impl Into<String>,
        name: impl Into<String>,
        current: Option<RedisClusterStatus>,
        views: Arc<ViewCache>,
    ) -> Self {
        Self {
            api,
            namespace: namespace.into(),
            name: name.into(),
            last: Mutex::new(current),
            views,
        }
    }
}

#[async_trait]
impl StatusSink for CrdStatusSink {
    async fn persist_state(&self, state: LifecycleState, report: &StatusReport) -> Result<()> {
        let status = {
            let last = self.last.lock();
            RedisClusterStatus::from_report(state, report, last.as_ref())
        };
        let patch = serde_json::json!({ "status": status });

        let pp = PatchParams::apply("redis-operator");
        self.api
            .patch_status(&self.name, &pp, &Patch::Merge(&patch))
            .await
            .map_err(|e| OperatorError::from(Error::Kube(e)))?;

        metrics::set_cluster_state(&self.namespace, &self.name, state);
        metrics::set_node_counts(&self.name, report);
        *self.last.lock() = Some(status);
        debug!(name = %self.name, state = %state, "Status updated");
        Ok(())
    }

    async fn publish_view(&self, view: &ClusterView) -> Result<()> {
        self.views.insert(instance_key(&self.namespace, &self.name), view.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis_operator::{Blueprint, TopologySnapshot};

    #[test]
    fn test_view_cache_round_trip() {
        let cache = ViewCache::new();
        let key = instance_key("payments", "orders-cache");
        assert_eq!(key, "payments/orders-cache");
        assert!(cache.get(&key).is_none());

        let view = ClusterView::new(
            "orders-cache",
            LifecycleState::Ready,
            Blueprint::generate(2, 1),
            TopologySnapshot::new(),
        );
        cache.insert(key.clone(), view);
        assert_eq!(cache.get(&key).map(|v| v.blueprint.len()), Some(4));

        cache.remove(&key);
        assert!(cache.get(&key).is_none());
    }
}
