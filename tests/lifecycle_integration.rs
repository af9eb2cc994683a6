//! Lifecycle tests: initialization, reset, blueprint adoption and status reporting.

#[allow(dead_code)]
mod common;

use std::collections::BTreeMap;

use common::*;
use redis_operator::{manual, KvBackend, LifecycleState};

#[tokio::test]
async fn test_fresh_cluster_initializes_to_ready() {
    let harness = Harness::new(3, 1);
    assert_eq!(harness.sim.lifecycle(), LifecycleState::NotExists);

    let result = harness.tick().await;
    assert_eq!(result.previous, LifecycleState::NotExists);
    assert_eq!(result.next, LifecycleState::Ready);

    let blueprint = harness.blueprint();
    assert_blueprint_shape(&blueprint, 3, 1).assert();
    assert_eq!(harness.sim.created().len(), 6);
    assert_cluster_matches(&harness.sim, &blueprint).assert();

    // The next tick verifies the cluster and stays put.
    let verified = harness.tick().await;
    assert_eq!(verified.next, LifecycleState::Ready);
    assert_eq!(verified.report.message, "cluster is healthy");

    let report = harness.sim.last_report().unwrap();
    assert_eq!(report.total_nodes, 6);
    assert_eq!(report.ready_nodes, 6);
    assert_eq!(report.healthy_leaders, 3);
}

#[tokio::test]
async fn test_blueprint_records_node_ids_after_init() {
    let harness = Harness::ready(2, 2).await;
    for (name, entry) in harness.blueprint().iter() {
        let node = harness.sim.node(name).unwrap();
        assert_eq!(entry.node_id.as_deref(), Some(node.id.as_str()), "{}", name);
        assert_eq!(entry.misses, 0);
    }
}

#[tokio::test]
async fn test_failed_initialization_retries_from_reset() {
    let harness = Harness::new(2, 1);
    harness.sim.fail_create("leader-1");

    let failed = harness.tick().await;
    assert_eq!(failed.next, LifecycleState::Reset);
    assert!(failed.report.message.contains("leader-1"), "{}", failed.report.message);

    harness.sim.clear_failures();
    let retried = harness.tick().await;
    assert_eq!(retried.previous, LifecycleState::Reset);
    assert_eq!(retried.next, LifecycleState::Ready);

    assert_eq!(harness.sim.names().len(), 4);
    assert_cluster_matches(&harness.sim, &harness.blueprint()).assert();
}

#[tokio::test]
async fn test_invalid_declaration_stays_in_reset() {
    let harness = Harness::new(0, 1);
    let result = harness.tick().await;
    assert_eq!(result.next, LifecycleState::Reset);
    assert!(result.report.message.contains("leaderCount"));
    assert!(harness.sim.created().is_empty());
}

#[tokio::test]
async fn test_forced_reset_rebuilds_everything() {
    let harness = Harness::ready(2, 1).await;
    let ctx = harness.context();

    manual::force_reset(&ctx, harness.sim.as_ref()).await.unwrap();
    assert_eq!(harness.sim.lifecycle(), LifecycleState::Reset);

    let result = harness.tick().await;
    assert_eq!(result.next, LifecycleState::Ready);
    assert_eq!(harness.sim.created().len(), 8);
    assert_eq!(harness.sim.deleted().len(), 4);
    assert_cluster_matches(&harness.sim, &harness.blueprint()).assert();
}

#[tokio::test]
async fn test_empty_blueprint_adopts_live_members() {
    let harness = Harness::ready(2, 1).await;
    harness.kv.replace_all(BTreeMap::new()).await.unwrap();

    let result = harness.tick().await;
    assert_eq!(result.next, LifecycleState::Ready, "{}", result.report.message);

    let blueprint = harness.blueprint();
    assert_blueprint_shape(&blueprint, 2, 1).assert();
    assert!(blueprint.iter().all(|(_, e)| e.node_id.is_some()));
    // Adoption never touches processes.
    assert_eq!(harness.sim.created().len(), 4);
}

#[tokio::test]
async fn test_nothing_to_adopt_reinitializes() {
    let harness = Harness::new(2, 1);
    harness.sim.set_lifecycle(LifecycleState::Ready);

    let result = harness.tick().await;
    assert_eq!(result.previous, LifecycleState::Ready);
    assert_eq!(result.next, LifecycleState::Ready);
    assert_blueprint_shape(&harness.blueprint(), 2, 1).assert();
}

#[tokio::test]
async fn test_view_published_every_tick() {
    let harness = Harness::ready(2, 1).await;
    let view = harness.sim.last_view().unwrap();
    assert_eq!(view.cluster, CLUSTER_NAME);
    assert_eq!(view.state, LifecycleState::Ready);
    assert_eq!(view.blueprint.len(), 4);
    assert_eq!(view.snapshot.len(), 4);
}

#[tokio::test]
async fn test_conflicting_writes_retried_within_tick() {
    let harness = Harness::ready(2, 1).await;
    harness.sim.kill("leader-0-replica-0");
    harness.kv.inject_conflicts(2);

    let result = harness.tick().await;
    assert_eq!(result.next, LifecycleState::Recovering);
    assert_eq!(harness.blueprint().get("leader-0-replica-0").unwrap().misses, 1);
}
