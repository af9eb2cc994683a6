//! Reconciliation core for a sharded, replicated Redis cluster.
//!
//! The core drives a cluster of leader groups (one leader owning a share of the
//! 16384 hash slots, plus a fixed number of replicas) towards a declared
//! topology. It is platform-independent: member processes, cluster
//! administration, blueprint persistence and status reporting are all reached
//! through traits in [`provider`] and [`blueprint`].
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Reconciler::tick (one per instance, serialized)            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Blueprint load → Snapshot → Evaluator → Engine             │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Engines: Initialize | Recovery | Scale | Rolling Update    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Persist state → Publish status and diagnostic view         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Lifecycle
//!
//! | Current | On success | On failure |
//! |---|---|---|
//! | NotExists / Reset | Ready | Reset |
//! | Ready | Recovering / Updating / Scale / Ready | Recovering |
//! | Recovering | Ready | Recovering |
//! | Updating | Recovering | Recovering |
//! | Scale | Ready | Ready |

pub mod blueprint;
pub mod config;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod machine;
pub mod manual;
pub mod provider;
pub mod resilience;
pub mod snapshot;
pub mod status;
pub mod types;

// Re-exports
pub use blueprint::{Blueprint, BlueprintEntry, BlueprintStore, KvBackend, MemoryKv};
pub use config::OperatorConfig;
pub use engine::{ClusterContext, EngineReport};
pub use error::{OperatorError, Result};
pub use machine::{transition, HandlerOutcome, ReadyVerdict, Reconciler, TickResult};
pub use provider::{ClusterAdmin, MemberProvider, StatusSink};
pub use snapshot::{NodeFacts, TopologySnapshot};
pub use status::{ClusterView, StatusReport};
pub use types::*;
