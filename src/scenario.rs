//! Per-iteration scenario state and the results a run reports.

use serde::Serialize;
use std::fmt;
use std::time::Duration;

use crate::cluster::{
    ClusterNode, ClusterOperation, FaultToleranceLevel, KillMode, NodeAction, NodeRef,
};
use crate::error::ScenarioError;
use crate::expected::{self, ExpectedState};
use crate::verifier::DomainCounts;
use crate::wipe::WipeBaseline;

/// Steps of one iteration, in execution order. `Setup` runs once per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Setup,
    PreScripts,
    SelectNodes,
    InjectFaults,
    ApplyClusterOp,
    Settle,
    AwaitConvergence,
    CheckWipe,
    VerifyNodes,
    DomainSanityWait,
    VerifyMembership,
    RecoverNodes,
    SyncState,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Setup => "setup",
            Stage::PreScripts => "pre-scripts",
            Stage::SelectNodes => "select-nodes",
            Stage::InjectFaults => "inject-faults",
            Stage::ApplyClusterOp => "apply-cluster-op",
            Stage::Settle => "settle",
            Stage::AwaitConvergence => "await-convergence",
            Stage::CheckWipe => "check-wipe",
            Stage::VerifyNodes => "verify-nodes",
            Stage::DomainSanityWait => "domain-sanity-wait",
            Stage::VerifyMembership => "verify-membership",
            Stage::RecoverNodes => "recover-nodes",
            Stage::SyncState => "sync-state",
        };
        f.write_str(name)
    }
}

/// Everything one iteration knows about itself.
///
/// A fresh context is built for every iteration, so recovery only ever acts
/// on what this iteration did.
#[derive(Debug, Clone)]
pub struct ScenarioContext {
    pub iteration: u32,
    pub stage: Stage,
    pub action: NodeAction,
    pub op: ClusterOperation,
    pub kill_mode: KillMode,
    pub allow_mirrors: bool,
    /// Configured nodes in the cluster when the selection was made
    pub total_nodes: usize,
    pub selected: Vec<ClusterNode>,
    /// Nodes that could not be reached during injection
    pub assumed_down: Vec<NodeRef>,
    /// Master or vice was among the nodes taken down
    pub failover_triggered: bool,
    pub baseline: Option<WipeBaseline>,
    pub target_level: Option<FaultToleranceLevel>,
    pub wiped: Option<bool>,
    pub counts: Option<DomainCounts>,
}

impl ScenarioContext {
    pub fn new(
        iteration: u32,
        action: NodeAction,
        op: ClusterOperation,
        kill_mode: KillMode,
        allow_mirrors: bool,
    ) -> Self {
        Self {
            iteration,
            stage: Stage::PreScripts,
            action,
            op,
            kill_mode,
            allow_mirrors,
            total_nodes: 0,
            selected: Vec::new(),
            assumed_down: Vec::new(),
            failover_triggered: false,
            baseline: None,
            target_level: None,
            wiped: None,
            counts: None,
        }
    }

    pub fn enter(&mut self, stage: Stage) {
        self.stage = stage;
    }

    pub fn selected_refs(&self) -> Vec<NodeRef> {
        self.selected.iter().map(ClusterNode::node_ref).collect()
    }

    pub fn wipe_expected(&self) -> bool {
        expected::wipe_expected(self.action, self.op, self.allow_mirrors, self.selected.len())
    }

    /// Nodes the action took out of service.
    pub fn down_count(&self) -> usize {
        if self.action.takes_node_down() {
            self.selected.len()
        } else {
            0
        }
    }

    /// The prediction for every selected node, given the observed wipe.
    pub fn expected_state(&self) -> ExpectedState {
        expected::expect(self.action, self.op, self.wiped.unwrap_or(false))
    }

    pub fn expected_counts(&self) -> DomainCounts {
        let wiped = self.wiped.unwrap_or(false);
        let selected = self.selected.len();
        DomainCounts {
            disabled: expected::expected_disabled_count(self.action, self.op, wiped, selected),
            missing: expected::expected_missing_count(self.action, self.op, wiped, selected),
        }
    }

    /// Nodes left disabled or killed that need an explicit restart.
    pub fn nodes_to_recover(&self) -> Vec<NodeRef> {
        if self.action.takes_node_down() && self.op != ClusterOperation::Extend {
            self.selected_refs()
        } else {
            Vec::new()
        }
    }

    pub fn into_result(self, elapsed: Duration) -> ScenarioResult {
        let wipe_expected = self.wipe_expected();
        ScenarioResult {
            iteration: self.iteration,
            action: self.action,
            cluster_operation: self.op,
            kill_mode: self.kill_mode,
            nodes: self.selected.iter().map(|n| n.hostname.clone()).collect(),
            assumed_down: self.assumed_down.into_iter().map(|n| n.hostname).collect(),
            failover_triggered: self.failover_triggered,
            wipe_expected,
            wiped: self.wiped.unwrap_or(false),
            target_level: self.target_level,
            counts: self.counts.unwrap_or_default(),
            elapsed_ms: elapsed.as_millis() as u64,
            finished_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Outcome of one completed iteration, one line of `summary.jsonl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScenarioResult {
    pub iteration: u32,
    pub action: NodeAction,
    pub cluster_operation: ClusterOperation,
    pub kill_mode: KillMode,
    pub nodes: Vec<String>,
    pub assumed_down: Vec<String>,
    pub failover_triggered: bool,
    pub wipe_expected: bool,
    pub wiped: bool,
    pub target_level: Option<FaultToleranceLevel>,
    /// Disabled and missing counts observed after the operation
    pub counts: DomainCounts,
    pub elapsed_ms: u64,
    pub finished_at: String,
}

/// Why a run stopped early.
#[derive(Debug, Serialize)]
pub struct RunFailure {
    /// 0 when setup failed
    pub iteration: u32,
    pub stage: Stage,
    pub reason: String,
    pub exit_code: u8,
    #[serde(skip)]
    pub error: ScenarioError,
}

impl RunFailure {
    pub fn new(iteration: u32, stage: Stage, error: ScenarioError) -> Self {
        Self {
            iteration,
            stage,
            reason: error.to_string(),
            exit_code: error.exit_code(),
            error,
        }
    }
}

/// The whole run: every completed iteration and the terminal failure, if any.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub runner: String,
    pub seed: u64,
    pub iterations_requested: u32,
    pub completed: Vec<ScenarioResult>,
    pub failure: Option<RunFailure>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }

    pub fn error(&self) -> Option<&ScenarioError> {
        self.failure.as_ref().map(|f| &f.error)
    }
}
