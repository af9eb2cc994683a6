//! Reconciliation state machine.
//!
//! One [`Reconciler::tick`] runs the handler of the persisted lifecycle state
//! exactly once, then persists the next state and publishes the status. The
//! transition itself is the pure function [`transition`], total over every
//! `(state, outcome)` pair.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::blueprint::Blueprint;
use crate::engine::{init, recovery, scale, update, ClusterContext, EngineReport};
use crate::error::{OperatorError, Result};
use crate::evaluator;
use crate::provider::{MemberSelector, StatusSink};
use crate::resilience::with_timeout;
use crate::snapshot::TopologySnapshot;
use crate::status::{ClusterView, StatusReport};
use crate::types::{LifecycleState, ScaleDecision};

/// What the `Ready` evaluation found, in dispatch priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyVerdict {
    Incomplete,
    Stale,
    ScaleRequired(ScaleDecision),
    Healthy,
}

/// Result of running a state's handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Everything the handler attempted succeeded.
    Succeeded,
    /// Some members were handled, others remain for a later tick.
    Partial,
    /// The handler failed as a whole.
    Failed,
    /// The `Ready` evaluation completed with a verdict.
    Evaluated(ReadyVerdict),
}

impl HandlerOutcome {
    /// Fixed label, independent of any scale delta.
    pub fn as_str(&self) -> &'static str {
        match self {
            HandlerOutcome::Succeeded => "succeeded",
            HandlerOutcome::Partial => "partial",
            HandlerOutcome::Failed => "failed",
            HandlerOutcome::Evaluated(ReadyVerdict::Incomplete) => "incomplete",
            HandlerOutcome::Evaluated(ReadyVerdict::Stale) => "stale",
            HandlerOutcome::Evaluated(ReadyVerdict::ScaleRequired(_)) => "scale_required",
            HandlerOutcome::Evaluated(ReadyVerdict::Healthy) => "healthy",
        }
    }

    fn from_report(report: &EngineReport) -> Self {
        if report.is_clean() {
            HandlerOutcome::Succeeded
        } else {
            HandlerOutcome::Partial
        }
    }
}

/// Next lifecycle state.
pub fn transition(current: LifecycleState, outcome: HandlerOutcome) -> LifecycleState {
    use HandlerOutcome as O;
    use LifecycleState as S;

    match current {
        S::NotExists | S::Reset => match outcome {
            O::Succeeded | O::Evaluated(ReadyVerdict::Healthy) => S::Ready,
            O::Partial | O::Failed | O::Evaluated(_) => S::Reset,
        },
        S::Ready => match outcome {
            O::Evaluated(ReadyVerdict::Incomplete) => S::Recovering,
            O::Evaluated(ReadyVerdict::Stale) => S::Updating,
            O::Evaluated(ReadyVerdict::ScaleRequired(_)) => S::Scale,
            O::Evaluated(ReadyVerdict::Healthy) | O::Succeeded => S::Ready,
            O::Partial | O::Failed => S::Recovering,
        },
        S::Recovering => match outcome {
            O::Succeeded | O::Evaluated(ReadyVerdict::Healthy) => S::Ready,
            O::Partial | O::Failed | O::Evaluated(_) => S::Recovering,
        },
        S::Updating => S::Recovering,
        S::Scale => S::Ready,
    }
}

/// Result of one tick.
#[derive(Debug, Clone)]
pub struct TickResult {
    pub previous: LifecycleState,
    pub next: LifecycleState,
    pub outcome: HandlerOutcome,
    pub report: StatusReport,
    /// Nodes past the loss threshold at the start of the tick.
    pub lost_nodes: usize,
    pub requeue_after: Duration,
    pub elapsed: Duration,
}

struct HandlerResult {
    outcome: HandlerOutcome,
    message: String,
    snapshot: TopologySnapshot,
    lost_nodes: usize,
}

impl HandlerResult {
    fn new(outcome: HandlerOutcome, message: impl Into<String>, snapshot: TopologySnapshot) -> Self {
        Self {
            outcome,
            message: message.into(),
            snapshot,
            lost_nodes: 0,
        }
    }
}

/// Drives one cluster instance through its lifecycle.
pub struct Reconciler {
    ctx: ClusterContext,
    sink: Arc<dyn StatusSink>,
}

impl Reconciler {
    pub fn new(ctx: ClusterContext, sink: Arc<dyn StatusSink>) -> Self {
        Self { ctx, sink }
    }

    pub fn context(&self) -> &ClusterContext {
        &self.ctx
    }

    /// Run one tick starting from the persisted `current` state.
    ///
    /// Never fails: handler errors become a next state, and errors while
    /// persisting are logged and retried on the next tick.
    pub async fn tick(&self, current: LifecycleState) -> TickResult {
        let started = Instant::now();
        let cluster = self.ctx.name().to_string();
        debug!(cluster = %cluster, state = %current, "Tick started");

        let (effective, result) = match self.run_handler(current).await {
            Ok(result) => result,
            Err(e) => {
                warn!(cluster = %cluster, state = %current, error = %e, "Handler failed");
                (
                    current,
                    HandlerResult::new(HandlerOutcome::Failed, e.to_string(), TopologySnapshot::new()),
                )
            }
        };
        let next = transition(effective, result.outcome);

        let blueprint = self.ctx.store.all();
        let report = StatusReport::build(result.message, &blueprint, &result.snapshot);

        if let Err(e) = self.sink.persist_state(next, &report).await {
            error!(cluster = %cluster, state = %next, error = %e, "Failed to persist lifecycle state");
        }
        let view = ClusterView::new(cluster.clone(), next, blueprint, result.snapshot);
        if let Err(e) = self.sink.publish_view(&view).await {
            warn!(cluster = %cluster, error = %e, "Failed to publish cluster view");
        }

        if next != current {
            info!(cluster = %cluster, from = %current, to = %next, "Lifecycle transition");
        }

        TickResult {
            previous: current,
            next,
            outcome: result.outcome,
            report,
            lost_nodes: result.lost_nodes,
            requeue_after: self.ctx.config.requeue_interval,
            elapsed: started.elapsed(),
        }
    }

    /// Run the handler for `current`; returns the state it effectively ran for.
    async fn run_handler(&self, current: LifecycleState) -> Result<(LifecycleState, HandlerResult)> {
        self.ctx.declaration.validate()?;

        if current.is_initializing() {
            return Ok((current, self.handle_initialize().await?));
        }

        let Some(blueprint) = self.load_blueprint().await? else {
            warn!(cluster = %self.ctx.name(), state = %current, "No blueprint and no members, reinitializing");
            return Ok((LifecycleState::Reset, self.handle_initialize().await?));
        };

        let snapshot = self.ctx.snapshot_builder().build(&blueprint.names()).await?;
        self.ctx
            .store
            .set_many(evaluator::observe(&blueprint, &snapshot))
            .await?;
        let blueprint = self.ctx.store.all();
        let lost_nodes = evaluator::lost_nodes(&blueprint, &snapshot, self.ctx.config.lost_node_threshold).len();

        let mut result = match current {
            LifecycleState::Ready => self.handle_ready(&blueprint, snapshot).await,
            LifecycleState::Recovering => {
                let report = recovery::recover(&self.ctx, &snapshot).await?;
                HandlerResult::new(HandlerOutcome::from_report(&report), report.summary(), snapshot)
            }
            LifecycleState::Updating => {
                let report = update::rolling_update(&self.ctx, &snapshot).await?;
                HandlerResult::new(HandlerOutcome::from_report(&report), report.summary(), snapshot)
            }
            LifecycleState::Scale => {
                let decision = evaluator::blueprint_scale(&self.ctx.declaration, &blueprint);
                let report = scale::scale(&self.ctx, &snapshot, decision).await?;
                HandlerResult::new(
                    HandlerOutcome::from_report(&report),
                    format!("{} ({})", report.summary(), decision),
                    snapshot,
                )
            }
            LifecycleState::NotExists | LifecycleState::Reset => {
                return Err(OperatorError::Internal(format!("{} is handled by initialization", current)))
            }
        };
        result.lost_nodes = lost_nodes;
        Ok((current, result))
    }

    async fn handle_initialize(&self) -> Result<HandlerResult> {
        let report = init::initialize(&self.ctx).await?;
        let names = self.ctx.store.all().names();
        let snapshot = self.ctx.snapshot_builder().build(&names).await?;
        Ok(HandlerResult::new(HandlerOutcome::Succeeded, report.summary(), snapshot))
    }

    /// Completeness before freshness before capacity.
    async fn handle_ready(&self, blueprint: &Blueprint, snapshot: TopologySnapshot) -> HandlerResult {
        let declaration = &self.ctx.declaration;

        let gaps = evaluator::completeness_gaps(declaration, &snapshot, blueprint);
        if !gaps.is_empty() {
            return HandlerResult::new(
                HandlerOutcome::Evaluated(ReadyVerdict::Incomplete),
                format!("incomplete: {}", gaps.join("; ")),
                snapshot,
            );
        }

        let stale = evaluator::stale_nodes(declaration, &snapshot);
        if !stale.is_empty() {
            return HandlerResult::new(
                HandlerOutcome::Evaluated(ReadyVerdict::Stale),
                format!("stale: {}", stale.join(", ")),
                snapshot,
            );
        }

        let members: Vec<(String, String)> = snapshot
            .healthy()
            .filter_map(|n| n.address.clone().map(|a| (n.name.clone(), a)))
            .collect();
        let mut housekeeping = EngineReport::new("forget");
        recovery::forget_stale(&self.ctx, &members, &mut housekeeping).await;

        let decision = evaluator::scale_required(declaration, &snapshot);
        if decision.is_required() {
            return HandlerResult::new(
                HandlerOutcome::Evaluated(ReadyVerdict::ScaleRequired(decision)),
                format!("scale required: {}", decision),
                snapshot,
            );
        }

        HandlerResult::new(HandlerOutcome::Evaluated(ReadyVerdict::Healthy), "cluster is healthy", snapshot)
    }

    /// Load the blueprint, adopting live members when the store is empty.
    ///
    /// `None` means there is nothing to reconcile against at all.
    async fn load_blueprint(&self) -> Result<Option<Blueprint>> {
        let blueprint = self.ctx.store.load().await?;
        if !blueprint.is_empty() {
            return Ok(Some(blueprint));
        }

        let members = with_timeout(
            "list members",
            self.ctx.config.member_timeout,
            self.ctx.provider.list_members(MemberSelector::All),
        )
        .await?;
        if members.is_empty() {
            return Ok(None);
        }

        let adopted = Blueprint::adopt(&members);
        warn!(
            cluster = %self.ctx.name(),
            entries = adopted.len(),
            "Blueprint empty, adopted live members"
        );
        Ok(Some(self.ctx.store.replace(adopted).await?))
    }
}
