//! Member processes as Pods.
//!
//! One bare Pod per logical node, named `<cluster>-<node>`, labelled with the
//! node name and the role it was created for, and owned by the RedisCluster
//! so that deleting the resource garbage-collects every member.
//!
//! The API server rewrites container resources on admission (requests default
//! to limits, quantities are canonicalized), so the declared requests and
//! limits are also recorded in an annotation and read back from there.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, ExecAction, Pod, PodSpec, Probe, ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::runtime::wait::{await_condition, conditions};
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

use redis_operator::provider::{MemberHandle, MemberProvider, MemberSelector};
use redis_operator::resilience::with_timeout;
use redis_operator::{MemberConfig, NodeHealth, OperatorError, Result, Role};

use crate::error::{is_not_found, Error};

pub const REDIS_PORT: i32 = 6379;
const NODE_LABEL: &str = "redis-operator.io/node";
const ROLE_LABEL: &str = "redis-operator.io/role";
const RESOURCES_ANNOTATION: &str = "redis-operator.io/resources";
const CONTAINER_NAME: &str = "redis";

/// Requests and limits as declared when the Pod was created.
#[derive(Debug, Default, Serialize, Deserialize)]
struct DeclaredResources {
    #[serde(default)]
    requests: BTreeMap<String, String>,
    #[serde(default)]
    limits: BTreeMap<String, String>,
}

/// Labels shared by every object the operator creates for `cluster`.
pub fn common_labels(cluster: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert("app.kubernetes.io/name".to_string(), "redis".to_string());
    labels.insert("app.kubernetes.io/instance".to_string(), cluster.to_string());
    labels.insert("app.kubernetes.io/managed-by".to_string(), "redis-operator".to_string());
    labels
}

fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Pod metadata that does not come from the member configuration.
#[derive(Debug, Clone, Default)]
pub struct PodTemplate {
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub owner: Option<OwnerReference>,
}

/// `MemberProvider` over `Api<Pod>`.
pub struct PodProvider {
    api: Api<Pod>,
    cluster: String,
    template: PodTemplate,
    /// Bound on waiting for a Pod IP or for a deleted Pod to go away.
    wait_timeout: Duration,
}

impl PodProvider {
    pub fn new(api: Api<Pod>, cluster: impl Into<String>, template: PodTemplate, wait_timeout: Duration) -> Self {
        Self {
            api,
            cluster: cluster.into(),
            template,
            wait_timeout,
        }
    }

    fn pod_name(&self, node: &str) -> String {
        pod_name(&self.cluster, node)
    }

    /// Wait until the Pod with `uid` no longer exists.
    async fn wait_deleted(&self, name: &str, uid: &str) -> Result<()> {
        with_timeout("pod deletion", self.wait_timeout, async {
            await_condition(self.api.clone(), name, conditions::is_deleted(uid))
                .await
                .map(|_| ())
                .map_err(|e| OperatorError::Member(format!("waiting for {} deletion: {}", name, e)))
        })
        .await
    }

    /// Wait until the Pod has an IP and return it.
    async fn wait_for_ip(&self, name: &str) -> Result<Pod> {
        let has_ip = |pod: Option<&Pod>| {
            pod.and_then(|p| p.status.as_ref())
                .and_then(|s| s.pod_ip.as_ref())
                .is_some()
        };
        let pod = with_timeout("pod address", self.wait_timeout, async {
            await_condition(self.api.clone(), name, has_ip)
                .await
                .map_err(|e| OperatorError::Member(format!("waiting for {} address: {}", name, e)))
        })
        .await?;
        pod.ok_or_else(|| OperatorError::Member(format!("{} disappeared before getting an address", name)))
    }
}

pub fn pod_name(cluster: &str, node: &str) -> String {
    format!("{}-{}", cluster, node)
}

/// The Pod backing `node`, before it is created.
pub fn member_pod(cluster: &str, template: &PodTemplate, node: &str, role: Role, spec: &MemberConfig) -> Pod {
    let mut labels = template.labels.clone();
    labels.extend(common_labels(cluster));
    labels.insert(NODE_LABEL.to_string(), node.to_string());
    labels.insert(ROLE_LABEL.to_string(), role.to_string());

    let mut annotations = template.annotations.clone();
    let declared = DeclaredResources {
        requests: spec.requests.clone(),
        limits: spec.limits.clone(),
    };
    if let Ok(value) = serde_json::to_string(&declared) {
        annotations.insert(RESOURCES_ANNOTATION.to_string(), value);
    }

    let quantities = |map: &BTreeMap<String, String>| {
        map.iter()
            .map(|(k, v)| (k.clone(), Quantity(v.clone())))
            .collect::<BTreeMap<_, _>>()
    };

    Pod {
        metadata: ObjectMeta {
            name: Some(pod_name(cluster, node)),
            labels: Some(labels),
            annotations: Some(annotations),
            owner_references: template.owner.clone().map(|o| vec![o]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            restart_policy: Some("Never".to_string()),
            containers: vec![Container {
                name: CONTAINER_NAME.to_string(),
                image: Some(spec.image.clone()),
                command: Some(vec!["redis-server".to_string()]),
                args: Some(vec![
                    "--port".to_string(),
                    REDIS_PORT.to_string(),
                    "--cluster-enabled".to_string(),
                    "yes".to_string(),
                    "--cluster-config-file".to_string(),
                    "nodes.conf".to_string(),
                    "--cluster-node-timeout".to_string(),
                    "5000".to_string(),
                    "--protected-mode".to_string(),
                    "no".to_string(),
                ]),
                ports: Some(vec![
                    ContainerPort {
                        container_port: REDIS_PORT,
                        name: Some("redis".to_string()),
                        ..Default::default()
                    },
                    ContainerPort {
                        container_port: REDIS_PORT + 10000,
                        name: Some("cluster-bus".to_string()),
                        ..Default::default()
                    },
                ]),
                resources: Some(ResourceRequirements {
                    requests: Some(quantities(&spec.requests)),
                    limits: Some(quantities(&spec.limits)),
                    ..Default::default()
                }),
                env: Some(
                    spec.env
                        .iter()
                        .map(|(name, value)| EnvVar {
                            name: name.clone(),
                            value: Some(value.clone()),
                            ..Default::default()
                        })
                        .collect(),
                ),
                readiness_probe: Some(Probe {
                    exec: Some(ExecAction {
                        command: Some(vec!["redis-cli".to_string(), "ping".to_string()]),
                    }),
                    period_seconds: Some(5),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Member handle described by a Pod, if the Pod carries the operator's labels.
pub fn handle_from_pod(pod: &Pod) -> Option<MemberHandle> {
    let labels = pod.labels();
    let name = labels.get(NODE_LABEL)?.clone();
    let role = labels.get(ROLE_LABEL)?.parse().ok()?;
    let address = pod
        .status
        .as_ref()
        .and_then(|s| s.pod_ip.as_ref())
        .map(|ip| format!("{}:{}", ip, REDIS_PORT));

    let container = pod
        .spec
        .as_ref()?
        .containers
        .iter()
        .find(|c| c.name == CONTAINER_NAME)?;
    let resources = container.resources.clone().unwrap_or_default();
    let strings = |map: Option<BTreeMap<String, Quantity>>| {
        map.unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, v.0))
            .collect::<BTreeMap<_, _>>()
    };
    let declared = pod
        .annotations()
        .get(RESOURCES_ANNOTATION)
        .and_then(|v| serde_json::from_str::<DeclaredResources>(v).ok())
        .unwrap_or_else(|| DeclaredResources {
            requests: strings(resources.requests),
            limits: strings(resources.limits),
        });
    let config = MemberConfig {
        image: container.image.clone().unwrap_or_default(),
        requests: declared.requests,
        limits: declared.limits,
        env: container
            .env
            .iter()
            .flatten()
            .filter_map(|e| e.value.clone().map(|v| (e.name.clone(), v)))
            .collect(),
    };

    Some(MemberHandle {
        name,
        role,
        address,
        config,
    })
}

/// Running, and every container is up.
fn pod_running(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    if status.phase.as_deref() != Some("Running") {
        return false;
    }
    status
        .container_statuses
        .iter()
        .flatten()
        .all(|c| c.state.as_ref().and_then(|s| s.running.as_ref()).is_some())
}

#[async_trait]
impl MemberProvider for PodProvider {
    async fn create_member(&self, name: &str, role: Role, spec: &MemberConfig) -> Result<MemberHandle> {
        let pod = member_pod(&self.cluster, &self.template, name, role, spec);
        let pod_name = self.pod_name(name);
        self.api
            .create(&PostParams::default(), &pod)
            .await
            .map_err(|e| OperatorError::from(Error::Kube(e)))?;
        info!(pod = %pod_name, node = %name, role = %role, "Pod created");

        let pod = self.wait_for_ip(&pod_name).await?;
        handle_from_pod(&pod)
            .ok_or_else(|| OperatorError::Member(format!("{} lost its labels", pod_name)))
    }

    async fn delete_member(&self, name: &str) -> Result<()> {
        let pod_name = self.pod_name(name);
        let existing = self
            .api
            .get_opt(&pod_name)
            .await
            .map_err(|e| OperatorError::from(Error::Kube(e)))?;
        let Some(existing) = existing else {
            return Ok(());
        };

        match self.api.delete(&pod_name, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(e) if is_not_found(&e) => return Ok(()),
            Err(e) => return Err(Error::Kube(e).into()),
        }
        if let Some(uid) = existing.uid() {
            self.wait_deleted(&pod_name, &uid).await?;
        }
        debug!(pod = %pod_name, "Pod deleted");
        Ok(())
    }

    async fn list_members(&self, selector: MemberSelector) -> Result<Vec<MemberHandle>> {
        let mut labels = common_labels(&self.cluster);
        if let MemberSelector::Name(name) = &selector {
            labels.insert(NODE_LABEL.to_string(), name.clone());
        }
        let lp = ListParams::default().labels(&label_selector(&labels));
        let pods = self
            .api
            .list(&lp)
            .await
            .map_err(|e| OperatorError::from(Error::Kube(e)))?;

        Ok(pods
            .items
            .iter()
            .filter(|p| p.metadata.deletion_timestamp.is_none())
            .filter_map(handle_from_pod)
            .filter(|h| selector.matches(h))
            .collect())
    }

    async fn probe_health(&self, handle: &MemberHandle) -> NodeHealth {
        match self.api.get_opt(&self.pod_name(&handle.name)).await {
            Ok(Some(pod)) if pod_running(&pod) => NodeHealth::Ok,
            Ok(_) => NodeHealth::Unreachable,
            Err(e) => {
                debug!(node = %handle.name, error = %e, "Pod lookup failed");
                NodeHealth::Unknown
            }
        }
    }
}
