//! Kubernetes controller for RedisCluster resources

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kube::api::{Api, ListParams};
use kube::runtime::controller::{Action, Controller as KubeController};
use kube::runtime::watcher::Config;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, warn};

use redis_operator::{BlueprintStore, ClusterContext, LifecycleState, OperatorConfig, Reconciler, TickResult};

use crate::blueprint_cm::ConfigMapKv;
use crate::crd::RedisCluster;
use crate::error::Error;
use crate::metrics;
use crate::pods::{common_labels, PodProvider, PodTemplate};
use crate::redis_cli::RedisCli;
use crate::status::{instance_key, CrdStatusSink, ViewCache};

/// State shared by the controller loop and the admin surface
pub struct ControllerState {
    pub client: Client,
    pub config: OperatorConfig,
    pub admin: Arc<RedisCli>,
    pub views: Arc<ViewCache>,
    /// One admission lock per instance; ticks and manual operations queue on it.
    locks: parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// Everything needed to run the core against one RedisCluster
pub struct Binding {
    pub ctx: ClusterContext,
    pub sink: Arc<CrdStatusSink>,
    pub state: LifecycleState,
}

impl ControllerState {
    pub fn new(client: Client, config: OperatorConfig, admin: RedisCli) -> Self {
        Self {
            client,
            config,
            admin: Arc::new(admin),
            views: Arc::new(ViewCache::new()),
            locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub fn instance_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    pub fn clusters(&self, namespace: &str) -> Api<RedisCluster> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Latest version of a RedisCluster, `None` once it is gone.
    pub async fn fetch(&self, namespace: &str, name: &str) -> Result<Option<RedisCluster>, Error> {
        Ok(self.clusters(namespace).get_opt(name).await?)
    }

    /// Wire the core to Pods, the blueprint ConfigMap and the status subresource.
    pub fn bind(&self, cluster: &RedisCluster) -> Result<Binding, Error> {
        let name = cluster.name_any();
        let namespace = cluster
            .namespace()
            .ok_or_else(|| Error::Internal(format!("{} is not namespaced", name)))?;
        let owner = cluster.controller_owner_ref(&());

        let template = PodTemplate {
            labels: cluster.spec.pod_labels.clone(),
            annotations: cluster.spec.pod_annotations.clone(),
            owner: owner.clone(),
        };
        let provider = PodProvider::new(
            Api::<Pod>::namespaced(self.client.clone(), &namespace),
            name.clone(),
            template,
            self.config.member_timeout,
        );
        let kv = ConfigMapKv::new(
            Api::<ConfigMap>::namespaced(self.client.clone(), &namespace),
            &name,
            common_labels(&name),
            owner,
        );
        let store = BlueprintStore::new(Arc::new(kv), self.config.conflict_retry());

        let status = cluster.status.clone();
        let state = status.as_ref().map_or(LifecycleState::NotExists, |s| s.lifecycle());
        let sink = CrdStatusSink::new(
            self.clusters(&namespace),
            namespace.clone(),
            name.clone(),
            status,
            Arc::clone(&self.views),
        );

        let ctx = ClusterContext::new(
            cluster.spec.declaration(&name),
            self.config.clone(),
            Arc::new(provider),
            self.admin.clone(),
            Arc::new(store),
        );
        Ok(Binding {
            ctx,
            sink: Arc::new(sink),
            state,
        })
    }

    /// Run one tick for `namespace/name` under its admission lock.
    ///
    /// Returns `None` when the RedisCluster no longer exists.
    pub async fn tick(&self, namespace: &str, name: &str) -> Result<Option<TickResult>, Error> {
        let key = instance_key(namespace, name);
        let lock = self.instance_lock(&key);
        let _admitted = lock.lock().await;

        // Re-read under the lock: a manual reset may have landed while waiting.
        let Some(cluster) = self.fetch(namespace, name).await? else {
            debug!(name = %name, namespace = %namespace, "RedisCluster gone, nothing to reconcile");
            self.views.remove(&key);
            return Ok(None);
        };

        let binding = self.bind(&cluster)?;
        let reconciler = Reconciler::new(binding.ctx, binding.sink);
        let result = reconciler.tick(binding.state).await;
        metrics::record_tick(name, &result);
        Ok(Some(result))
    }
}

/// Main controller for RedisCluster resources
pub struct Controller {
    client: Client,
    namespace: String,
    state: Arc<ControllerState>,
}

impl Controller {
    pub fn new(client: Client, namespace: String, state: Arc<ControllerState>) -> Self {
        Self {
            client,
            namespace,
            state,
        }
    }

    /// Run the controller
    pub async fn run(&self) -> Result<(), Error> {
        info!("Starting RedisCluster controller");

        let clusters: Api<RedisCluster> = if self.namespace.is_empty() {
            Api::all(self.client.clone())
        } else {
            Api::namespaced(self.client.clone(), &self.namespace)
        };

        // Verify CRD is installed
        let lp = ListParams::default().limit(1);
        if let Err(e) = clusters.list(&lp).await {
            error!("Failed to list RedisClusters. Is the CRD installed? Error: {}", e);
            return Err(Error::CrdNotInstalled);
        }

        info!("CRD verification successful");

        KubeController::new(clusters, Config::default())
            .shutdown_on_signal()
            .run(reconcile, error_policy, Arc::clone(&self.state))
            .for_each(|result| async move {
                match result {
                    Ok((obj, action)) => {
                        debug!(name = %obj.name, ?action, "Reconciliation successful");
                    }
                    Err(e) => {
                        warn!(error = %e, "Reconciliation error");
                    }
                }
            })
            .await;

        info!("Controller stopped");
        Ok(())
    }
}

/// Reconcile a RedisCluster resource
async fn reconcile(cluster: Arc<RedisCluster>, state: Arc<ControllerState>) -> Result<Action, Error> {
    let name = cluster.name_any();
    let namespace = cluster.namespace().unwrap_or_default();

    info!(name = %name, namespace = %namespace, "Reconciling RedisCluster");

    match state.tick(&namespace, &name).await? {
        Some(result) => {
            info!(
                name = %name,
                from = %result.previous,
                to = %result.next,
                elapsed_ms = result.elapsed.as_millis() as u64,
                message = %result.report.message,
                "Tick finished"
            );
            Ok(Action::requeue(result.requeue_after))
        }
        None => Ok(Action::await_change()),
    }
}

/// Error policy for reconciliation failures
fn error_policy(cluster: Arc<RedisCluster>, error: &Error, state: Arc<ControllerState>) -> Action {
    warn!(name = %cluster.name_any(), error = %error, "Reconciliation error, will retry");
    metrics::record_error(match error {
        Error::Kube(_) => "kube",
        Error::Core(e) => e.kind(),
        _ => "other",
    });
    Action::requeue(state.config.requeue_interval)
}
