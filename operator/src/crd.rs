//! Custom Resource Definition for Redis clusters

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

use redis_operator::status::StatusReport;
use redis_operator::{ClusterDeclaration, LifecycleState, MemberConfig};

/// RedisCluster declares one sharded, replicated Redis cluster
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "db.redis-operator.io",
    version = "v1",
    kind = "RedisCluster",
    plural = "redisclusters",
    shortname = "rdc",
    status = "RedisClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"Leaders","type":"integer","jsonPath":".spec.leaderCount"}"#,
    printcolumn = r#"{"name":"Followers","type":"integer","jsonPath":".spec.leaderFollowersCount"}"#,
    printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.readyNodes"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.clusterState"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RedisClusterSpec {
    /// Number of leader groups; each leader owns a share of the slot space
    pub leader_count: u32,

    /// Replicas attached to every leader
    #[serde(default)]
    pub leader_followers_count: u32,

    /// Redis image every member runs
    #[serde(default = "default_image")]
    pub image: String,

    /// Container resources
    #[serde(default)]
    pub resources: ResourceConfig,

    /// Extra container environment
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Additional pod annotations
    #[serde(default)]
    pub pod_annotations: BTreeMap<String, String>,

    /// Additional pod labels
    #[serde(default)]
    pub pod_labels: BTreeMap<String, String>,
}

fn default_image() -> String {
    "redis:7.0.12".to_string()
}

/// Requests and limits, by resource name
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceConfig {
    #[serde(default)]
    pub requests: BTreeMap<String, String>,

    #[serde(default)]
    pub limits: BTreeMap<String, String>,
}

impl RedisClusterSpec {
    /// Running configuration every member must match.
    pub fn member_config(&self) -> MemberConfig {
        MemberConfig {
            image: self.image.clone(),
            requests: self.resources.requests.clone(),
            limits: self.resources.limits.clone(),
            env: self.env.clone(),
        }
    }

    pub fn declaration(&self, name: &str) -> ClusterDeclaration {
        ClusterDeclaration::new(name, self.leader_count, self.leader_followers_count)
            .with_member(self.member_config())
    }
}

/// Observed status of a RedisCluster
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct RedisClusterStatus {
    /// Lifecycle state; empty until the first reconciliation
    #[serde(default)]
    pub cluster_state: String,

    /// Outcome of the last reconciliation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default)]
    pub ready_nodes: u32,

    #[serde(default)]
    pub total_nodes: u32,

    /// Leaders currently serving slots
    #[serde(default)]
    pub leaders: u32,

    #[serde(default)]
    pub nodes: Vec<NodeStatus>,

    #[serde(default)]
    pub conditions: Vec<ClusterCondition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl RedisClusterStatus {
    /// Lifecycle state recorded in the status.
    ///
    /// A value this operator does not know resumes in Recovering, which
    /// repairs against the blueprint without tearing the cluster down.
    pub fn lifecycle(&self) -> LifecycleState {
        LifecycleState::from_status(Some(&self.cluster_state)).unwrap_or_else(|e| {
            warn!(state = %self.cluster_state, error = %e, "Unrecognized cluster state, resuming in Recovering");
            LifecycleState::Recovering
        })
    }

    /// Status for `state`, carrying forward the transition time unless the state changed.
    pub fn from_report(state: LifecycleState, report: &StatusReport, previous: Option<&RedisClusterStatus>) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        let changed = previous.map_or(true, |p| p.cluster_state != state.as_str());
        let last_transition_time = if changed {
            Some(now.clone())
        } else {
            previous.and_then(|p| p.last_transition_time.clone())
        };

        let ready = state == LifecycleState::Ready;
        let condition = ClusterCondition {
            condition_type: "Ready".to_string(),
            status: if ready { "True" } else { "False" }.to_string(),
            last_transition_time: last_transition_time.clone(),
            reason: Some(state.as_str().to_string()),
            message: Some(report.message.clone()),
        };

        Self {
            cluster_state: state.as_str().to_string(),
            message: Some(report.message.clone()),
            ready_nodes: report.ready_nodes,
            total_nodes: report.total_nodes,
            leaders: report.healthy_leaders,
            nodes: report
                .nodes
                .iter()
                .map(|n| NodeStatus {
                    name: n.name.clone(),
                    role: n.role.to_string(),
                    ready: n.health.is_ok(),
                    address: n.address.clone(),
                    leader: n.parent.clone(),
                    slots: n.owned_slots,
                })
                .collect(),
            conditions: vec![condition],
            last_transition_time,
        }
    }
}

/// Status of one logical node
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub name: String,

    /// Intended role: leader or replica
    pub role: String,

    pub ready: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    /// Intended leader, for replicas
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader: Option<String>,

    /// Slots owned at the last observation
    #[serde(default)]
    pub slots: u32,
}

/// Cluster condition
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCondition {
    /// Type of condition
    #[serde(rename = "type")]
    pub condition_type: String,

    /// Status: True, False, Unknown
    pub status: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,

    /// Machine-readable reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    fn spec() -> RedisClusterSpec {
        serde_json::from_value(serde_json::json!({
            "leaderCount": 3,
            "leaderFollowersCount": 1,
            "resources": { "requests": { "memory": "256Mi" } }
        }))
        .unwrap()
    }

    #[test]
    fn test_crd_metadata() {
        let crd = RedisCluster::crd();
        assert_eq!(crd.spec.group, "db.redis-operator.io");
        assert_eq!(crd.spec.names.kind, "RedisCluster");
        assert_eq!(crd.spec.names.short_names, Some(vec!["rdc".to_string()]));
    }

    #[test]
    fn test_spec_defaults_and_declaration() {
        let spec = spec();
        assert_eq!(spec.image, "redis:7.0.12");

        let declaration = spec.declaration("orders-cache");
        assert_eq!(declaration.leader_count, 3);
        assert_eq!(declaration.replicas_per_leader, 1);
        assert_eq!(declaration.member.requests.get("memory").map(String::as_str), Some("256Mi"));
    }

    #[test]
    fn test_empty_status_means_not_exists() {
        let status = RedisClusterStatus::default();
        assert_eq!(status.lifecycle(), LifecycleState::NotExists);
    }

    #[test]
    fn test_unknown_state_resumes_recovering() {
        let status = RedisClusterStatus {
            cluster_state: "Rebalancing".to_string(),
            ..Default::default()
        };
        assert_eq!(status.lifecycle(), LifecycleState::Recovering);

        let known = RedisClusterStatus {
            cluster_state: "Updating".to_string(),
            ..Default::default()
        };
        assert_eq!(known.lifecycle(), LifecycleState::Updating);
    }

    #[test]
    fn test_transition_time_kept_while_state_holds() {
        let report = StatusReport {
            message: "cluster is healthy".to_string(),
            ..Default::default()
        };
        let first = RedisClusterStatus::from_report(LifecycleState::Ready, &report, None);
        assert!(first.last_transition_time.is_some());

        let mut previous = first.clone();
        previous.last_transition_time = Some("2026-01-01T00:00:00+00:00".to_string());
        let second = RedisClusterStatus::from_report(LifecycleState::Ready, &report, Some(&previous));
        assert_eq!(second.last_transition_time, previous.last_transition_time);
        assert_eq!(second.conditions[0].status, "True");

        let third = RedisClusterStatus::from_report(LifecycleState::Recovering, &report, Some(&previous));
        assert_ne!(third.last_transition_time, previous.last_transition_time);
        assert_eq!(third.conditions[0].status, "False");
    }
}
