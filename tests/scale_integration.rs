//! Scale tests: adding and removing whole leader groups.

#[allow(dead_code)]
mod common;

use common::*;
use redis_operator::LifecycleState;

#[tokio::test]
async fn test_scale_up_adds_group_and_rebalances() {
    let mut harness = Harness::ready(3, 1).await;
    let created_before = harness.sim.created().len();

    harness.declare(4, 1);
    let first = harness.tick().await;
    assert_eq!(first.next, LifecycleState::Scale, "{}", first.report.message);

    let second = harness.tick().await;
    assert_eq!(second.previous, LifecycleState::Scale);
    assert_eq!(second.next, LifecycleState::Ready, "{}", second.report.message);

    let created = harness.sim.created();
    assert_eq!(
        created[created_before..].to_vec(),
        vec!["leader-3".to_string(), "leader-3-replica-0".to_string()]
    );

    let blueprint = harness.blueprint();
    assert_blueprint_shape(&blueprint, 4, 1).assert();
    assert_cluster_matches(&harness.sim, &blueprint).assert();
    assert_slots_balanced(&harness.sim, 4096, 4096).assert();

    let verified = harness.tick().await;
    assert_eq!(verified.next, LifecycleState::Ready, "{}", verified.report.message);
}

#[tokio::test]
async fn test_scale_down_drains_before_delete() {
    let mut harness = Harness::ready(4, 1).await;

    harness.declare(3, 1);
    let visited = harness.run_until(LifecycleState::Ready, 3).await;
    assert_eq!(visited, vec![LifecycleState::Scale, LifecycleState::Ready]);

    // Replica first, then the leader, and the leader owned nothing when it went.
    assert_eq!(
        harness.sim.deleted(),
        vec![
            Deletion {
                name: "leader-3-replica-0".to_string(),
                owned_slots: 0,
            },
            Deletion {
                name: "leader-3".to_string(),
                owned_slots: 0,
            },
        ]
    );

    let blueprint = harness.blueprint();
    assert_blueprint_shape(&blueprint, 3, 1).assert();
    assert_cluster_matches(&harness.sim, &blueprint).assert();

    let retired = [harness.sim.node("leader-3"), harness.sim.node("leader-3-replica-0")];
    assert!(retired.iter().all(Option::is_none));

    let verified = harness.tick().await;
    assert_eq!(verified.next, LifecycleState::Ready, "{}", verified.report.message);
}

#[tokio::test]
async fn test_scale_down_removes_newest_groups_first() {
    let mut harness = Harness::ready(5, 0).await;

    harness.declare(3, 0);
    harness.run_until(LifecycleState::Ready, 3).await;

    let deleted: Vec<String> = harness.sim.deleted().into_iter().map(|d| d.name).collect();
    assert_eq!(deleted, vec!["leader-4".to_string(), "leader-3".to_string()]);
    assert_eq!(
        harness.blueprint().leaders(),
        vec!["leader-0".to_string(), "leader-1".to_string(), "leader-2".to_string()]
    );
    assert_slots_balanced(&harness.sim, 5461, 5462).assert();
    assert!(harness.sim.slots_fully_covered());
}

#[tokio::test]
async fn test_scale_down_refuses_leader_still_owning_slots() {
    let mut harness = Harness::ready(4, 1).await;
    harness.sim.refuse_drain(true);

    harness.declare(3, 1);
    let first = harness.tick().await;
    assert_eq!(first.next, LifecycleState::Scale);

    let second = harness.tick().await;
    assert_eq!(second.next, LifecycleState::Ready);
    assert!(second.report.message.contains("leader-3"), "{}", second.report.message);
    assert!(harness.sim.deleted().is_empty());
    assert_blueprint_shape(&harness.blueprint(), 4, 1).assert();
    assert!(harness.sim.slots_fully_covered());
}

#[tokio::test]
async fn test_scale_down_completes_once_drain_succeeds() {
    let mut harness = Harness::ready(3, 0).await;
    harness.sim.refuse_drain(true);
    harness.declare(2, 0);
    harness.run_until(LifecycleState::Ready, 3).await;
    assert_eq!(harness.blueprint().leaders().len(), 3);

    harness.sim.refuse_drain(false);
    let visited = harness.run_until(LifecycleState::Ready, 3).await;
    assert_eq!(visited, vec![LifecycleState::Scale, LifecycleState::Ready]);
    assert_blueprint_shape(&harness.blueprint(), 2, 0).assert();
    assert_slots_balanced(&harness.sim, 8192, 8192).assert();
}

#[tokio::test]
async fn test_scale_up_counts_unreachable_leader_as_intended() {
    let mut harness = Harness::ready(3, 0).await;
    let created_before = harness.sim.created().len();

    harness.declare(4, 0);
    let first = harness.tick().await;
    assert_eq!(first.next, LifecycleState::Scale, "{}", first.report.message);

    // Dies between the deciding tick and the scaling tick.
    harness.sim.kill("leader-0");
    let second = harness.tick().await;
    assert_eq!(second.previous, LifecycleState::Scale);
    assert_eq!(
        harness.blueprint().leaders(),
        vec![
            "leader-0".to_string(),
            "leader-1".to_string(),
            "leader-2".to_string(),
            "leader-3".to_string(),
        ]
    );
    assert_eq!(
        harness.sim.created()[created_before..].to_vec(),
        vec!["leader-3".to_string()]
    );
    assert!(harness.sim.node("leader-4").is_none());

    harness.run_until(LifecycleState::Recovering, 2).await;
    harness.run_until(LifecycleState::Ready, 3).await;
    assert_blueprint_shape(&harness.blueprint(), 4, 0).assert();
    assert_cluster_matches(&harness.sim, &harness.blueprint()).assert();
    assert_slots_balanced(&harness.sim, 4096, 4096).assert();
}
