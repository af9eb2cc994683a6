// Fixtures for declarations and configuration used across integration tests

use std::collections::BTreeMap;

use redis_operator::{ClusterDeclaration, MemberConfig, OperatorConfig};

pub const CLUSTER_NAME: &str = "orders-cache";

/// Member configuration every fixture cluster starts with.
pub fn member_config(image: &str) -> MemberConfig {
    let mut requests = BTreeMap::new();
    requests.insert("cpu".to_string(), "100m".to_string());
    requests.insert("memory".to_string(), "256Mi".to_string());

    let mut limits = BTreeMap::new();
    limits.insert("memory".to_string(), "512Mi".to_string());

    MemberConfig {
        image: image.to_string(),
        requests,
        limits,
        env: BTreeMap::new(),
    }
}

pub fn declaration(leaders: u32, replicas: u32) -> ClusterDeclaration {
    ClusterDeclaration::new(CLUSTER_NAME, leaders, replicas).with_member(member_config("redis:7.0.12"))
}

/// Fast timeouts, two-miss loss threshold.
pub fn test_config() -> OperatorConfig {
    OperatorConfig::simulation()
}
