//! Common test utilities for integration tests.

pub mod assertions;
pub mod cluster_sim;
pub mod fixtures;

use std::sync::Arc;

use redis_operator::{
    Blueprint, BlueprintStore, ClusterContext, ClusterDeclaration, LifecycleState, MemberConfig,
    MemoryKv, OperatorConfig, Reconciler, TickResult,
};

// Re-export common types
pub use assertions::*;
pub use cluster_sim::*;
pub use fixtures::*;

/// One cluster instance wired to a simulated cluster and an in-memory blueprint backend.
pub struct Harness {
    pub sim: Arc<ClusterSim>,
    pub kv: Arc<MemoryKv>,
    pub store: Arc<BlueprintStore>,
    pub config: OperatorConfig,
    pub declaration: ClusterDeclaration,
}

impl Harness {
    pub fn new(leaders: u32, replicas: u32) -> Self {
        let config = test_config();
        let kv = Arc::new(MemoryKv::new());
        let store = Arc::new(BlueprintStore::new(kv.clone(), config.conflict_retry()));
        Self {
            sim: Arc::new(ClusterSim::new()),
            kv,
            store,
            config,
            declaration: declaration(leaders, replicas),
        }
    }

    /// Harness whose cluster has already been initialized and verified `Ready`.
    pub async fn ready(leaders: u32, replicas: u32) -> Self {
        let harness = Self::new(leaders, replicas);
        harness.run_until(LifecycleState::Ready, 3).await;
        let verified = harness.tick().await;
        assert_eq!(verified.next, LifecycleState::Ready, "{}", verified.report.message);
        harness
    }

    pub fn context(&self) -> ClusterContext {
        ClusterContext::new(
            self.declaration.clone(),
            self.config.clone(),
            self.sim.clone(),
            self.sim.clone(),
            self.store.clone(),
        )
    }

    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(self.context(), self.sim.clone())
    }

    /// One tick from the persisted lifecycle state.
    pub async fn tick(&self) -> TickResult {
        self.reconciler().tick(self.sim.lifecycle()).await
    }

    /// Tick until `state` is reached; returns every state visited.
    pub async fn run_until(&self, state: LifecycleState, max_ticks: usize) -> Vec<LifecycleState> {
        let mut visited = Vec::new();
        for _ in 0..max_ticks {
            let result = self.tick().await;
            visited.push(result.next);
            if result.next == state {
                return visited;
            }
        }
        panic!(
            "did not reach {} within {} ticks, visited {:?}, last report: {:?}",
            state,
            max_ticks,
            visited,
            self.sim.last_report().map(|r| r.message)
        );
    }

    pub fn declare(&mut self, leaders: u32, replicas: u32) {
        self.declaration.leader_count = leaders;
        self.declaration.replicas_per_leader = replicas;
    }

    pub fn declare_member(&mut self, member: MemberConfig) {
        self.declaration.member = member;
    }

    pub fn blueprint(&self) -> Blueprint {
        self.store.all()
    }
}
