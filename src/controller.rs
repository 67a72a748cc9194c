//! Drives a fault-injection run: setup, then one pass of the iteration state
//! machine per configured iteration, stopping at the first failure.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::backend::ClusterBackends;
use crate::cluster::{ClusterOperation, NodeAction};
use crate::convergence::{ConvergencePoller, Diagnostics, LevelStrings, target_level};
use crate::error::{ConfigError, ScenarioError};
use crate::hooks;
use crate::injector::{ActionOutcome, FaultInjector};
use crate::scenario::{RunFailure, RunReport, ScenarioContext, ScenarioResult, Stage};
use crate::selector::{NodeSelector, SelectionOptions};
use crate::settings::AppConfig;
use crate::verifier::{DomainCounts, NodeStateVerifier};
use crate::wipe::WipeDetector;

/// File in the log directory that receives one JSON line per iteration.
pub const SUMMARY_FILE: &str = "summary.jsonl";

const ROLL_ACTIONS: [NodeAction; 3] = [NodeAction::Disable, NodeAction::Kill, NodeAction::Reboot];
const ROLL_OPERATIONS: [ClusterOperation; 3] = [
    ClusterOperation::Nothing,
    ClusterOperation::Reboot,
    ClusterOperation::HardReboot,
];

pub struct IterationController {
    cfg: AppConfig,
    backends: ClusterBackends,
    seed: u64,
    selector: NodeSelector,
    roll_rng: StdRng,
    injector: FaultInjector,
    poller: ConvergencePoller,
    wipe: WipeDetector,
    verifier: NodeStateVerifier,
}

impl IterationController {
    /// Validate `cfg` and wire the components to `backends`. Nothing touches
    /// the cluster until [`run`](Self::run).
    pub fn new(cfg: AppConfig, backends: ClusterBackends) -> Result<Self, ConfigError> {
        cfg.validate()?;
        let seed = cfg.run.seed.unwrap_or_else(rand::random);
        let remote_timeout = cfg.timing.remote_timeout();
        Ok(Self {
            seed,
            selector: NodeSelector::new(seed),
            roll_rng: StdRng::seed_from_u64(seed.rotate_left(32)),
            injector: FaultInjector::new(&backends, cfg.commands.clone(), remote_timeout),
            poller: ConvergencePoller::new(
                &backends,
                LevelStrings::new(
                    cfg.cluster.weaker_level.clone(),
                    cfg.cluster.stronger_level.clone(),
                ),
                None,
            ),
            wipe: WipeDetector::new(backends.artifact.clone(), cfg.timing.wipe_interval()),
            verifier: NodeStateVerifier::new(backends.membership.clone()),
            backends,
            cfg,
        })
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Run setup and every iteration. Never panics on cluster misbehaviour;
    /// the first failure is recorded in the report and ends the run.
    pub async fn run(&mut self) -> RunReport {
        let iterations = self.cfg.run.iterations;
        let mut report = RunReport {
            runner: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown".to_string()),
            seed: self.seed,
            iterations_requested: iterations,
            completed: Vec::new(),
            failure: None,
        };
        info!(seed = self.seed, iterations, "starting fault-injection run");

        if let Err(e) = self.setup().await {
            error!(error = %e, "setup failed");
            report.failure = Some(RunFailure::new(0, Stage::Setup, e));
            return report;
        }

        for iteration in 1..=iterations {
            let (action, op) = self.scenario_for(iteration);
            let mut ctx = ScenarioContext::new(
                iteration,
                action,
                op,
                self.cfg.scenario.kill_mode,
                self.cfg.scenario.allow_mirrors,
            );
            let span = info_span!("iteration", iteration, %action, %op);
            let res = self.run_iteration(&mut ctx).instrument(span).await;
            match res {
                Ok(result) => {
                    info!(iteration, elapsed_ms = result.elapsed_ms, "iteration passed");
                    report.completed.push(result);
                }
                Err(e) => {
                    error!(iteration, stage = %ctx.stage, error = %e, "iteration failed; stopping run");
                    report.failure = Some(RunFailure::new(iteration, ctx.stage, e));
                    break;
                }
            }
        }

        info!(
            completed = report.completed.len(),
            requested = iterations,
            success = report.succeeded(),
            "run finished"
        );
        report
    }

    /// Fatal checks made before anything is done to the cluster.
    async fn setup(&mut self) -> Result<(), ScenarioError> {
        ensure_log_dir(&self.cfg.run.log_dir).await?;

        let status = self.poller.current_status().await.unwrap_or_default();
        if self.poller.levels().observed(&status).is_none() {
            return Err(ConfigError::NotQuorate(status.trim().to_string()).into());
        }
        let snapshot = self.backends.membership.snapshot().await?;
        if !snapshot.has_master() {
            return Err(ConfigError::NotQuorate("domain has no master".to_string()).into());
        }

        if self.cfg.cluster.diagnostics {
            self.poller.set_diagnostics(Some(Diagnostics {
                hosts: snapshot.nodes.iter().map(|n| n.hostname.clone()).collect(),
                device_size_command: self.cfg.commands.device_size.clone(),
                remote_timeout: self.cfg.timing.remote_timeout(),
            }));
        }
        info!(
            nodes = snapshot.total_nodes(),
            master = snapshot.master().map(|n| n.hostname.as_str()).unwrap_or("-"),
            status = status.trim(),
            "cluster is quorate"
        );
        Ok(())
    }

    /// The action and operation for one iteration: drawn afresh in roll mode,
    /// otherwise the configured pair.
    fn scenario_for(&mut self, iteration: u32) -> (NodeAction, ClusterOperation) {
        if !self.cfg.scenario.roll_nodes {
            return (
                self.cfg.scenario.node_action,
                self.cfg.scenario.cluster_operation,
            );
        }
        let action = ROLL_ACTIONS[self.roll_rng.random_range(0..ROLL_ACTIONS.len())];
        let op = ROLL_OPERATIONS[self.roll_rng.random_range(0..ROLL_OPERATIONS.len())];
        info!(iteration, %action, %op, "rolled scenario");
        (action, op)
    }

    fn selection_options(&self) -> SelectionOptions {
        let s = &self.cfg.scenario;
        SelectionOptions {
            count: s.node_count,
            allow_spares: s.allow_spares,
            allow_mirrors: s.allow_mirrors,
            reuse: s.reuse_nodes,
            always_include_master: s.follow_master,
        }
    }

    async fn run_iteration(
        &mut self,
        ctx: &mut ScenarioContext,
    ) -> Result<ScenarioResult, ScenarioError> {
        let started = Instant::now();
        let timing = self.cfg.timing.clone();

        ctx.enter(Stage::PreScripts);
        hooks::run_pre_iteration(
            &self.cfg.hooks.pre_iteration,
            ctx.iteration,
            self.cfg.hooks.timeout(),
        )
        .await?;

        ctx.enter(Stage::SelectNodes);
        let snapshot = self.backends.membership.snapshot().await?;
        ctx.total_nodes = snapshot.total_nodes();
        let opts = self.selection_options();
        ctx.selected = self.selector.select(&snapshot, &opts)?;
        let baseline = self.wipe.baseline().await?;
        ctx.baseline = Some(baseline.clone());
        info!(
            nodes = ?ctx.selected.iter().map(|n| n.hostname.as_str()).collect::<Vec<_>>(),
            wipe_expected = ctx.wipe_expected(),
            "selected nodes"
        );

        ctx.enter(Stage::InjectFaults);
        let outcomes = self
            .injector
            .apply_node_actions(&ctx.selected, ctx.action, ctx.kill_mode)
            .await?;
        ctx.assumed_down = outcomes
            .into_iter()
            .filter(|(_, outcome)| matches!(outcome, ActionOutcome::AssumedDown(_)))
            .map(|(node, _)| node)
            .collect();
        ctx.failover_triggered =
            ctx.action.takes_node_down() && ctx.selected.iter().any(|n| n.role().is_some());
        if ctx.failover_triggered {
            info!(settle = ?timing.failover_settle(), "master or vice taken down; letting failover complete");
            tokio::time::sleep(timing.failover_settle()).await;
        }

        ctx.enter(Stage::ApplyClusterOp);
        self.injector.apply_cluster_operation(ctx.op).await?;

        ctx.enter(Stage::Settle);
        debug!(settle = ?timing.settle(), "settling");
        tokio::time::sleep(timing.settle()).await;

        ctx.enter(Stage::AwaitConvergence);
        let target = target_level(ctx.down_count(), ctx.total_nodes);
        ctx.target_level = Some(target);
        let converged = self
            .poller
            .await_state(
                target,
                timing.convergence_timeout(),
                timing.convergence_interval(),
            )
            .await;
        if !converged {
            return Err(ScenarioError::ConvergenceTimeout {
                what: format!("database quorum ({})", self.poller.levels().for_level(target)),
                after: timing.convergence_timeout(),
            });
        }

        ctx.enter(Stage::CheckWipe);
        let wiped = self
            .wipe
            .check(&baseline, ctx.wipe_expected(), timing.wipe_timeout())
            .await?;
        ctx.wiped = Some(wiped);

        ctx.enter(Stage::VerifyNodes);
        let expected = ctx.expected_state();
        let acting = ctx.selected_refs();
        self.verifier.verify_all(&acting, &expected).await?;

        ctx.enter(Stage::DomainSanityWait);
        let snapshot = self
            .verifier
            .await_domain_counts(
                ctx.expected_counts(),
                timing.sanity_timeout(),
                timing.sanity_interval(),
            )
            .await?;
        ctx.counts = Some(DomainCounts::of(&snapshot));

        ctx.enter(Stage::VerifyMembership);
        self.verifier.verify_all(&acting, &expected).await?;
        self.verifier.verify_bystanders(&acting).await?;

        ctx.enter(Stage::RecoverNodes);
        self.recover(ctx).await?;

        ctx.enter(Stage::SyncState);
        let result = ctx.clone().into_result(started.elapsed());
        append_summary(&self.cfg.run.log_dir, &result).await?;
        if self.cfg.scenario.follow_master {
            // the master moves every time it is taken down
            self.selector.reset();
        }
        Ok(result)
    }

    /// Restore every node this iteration took down and wait for the domain to
    /// report no disabled or missing members.
    async fn recover(&self, ctx: &ScenarioContext) -> Result<(), ScenarioError> {
        if ctx.op == ClusterOperation::Extend {
            self.injector
                .integrate_extend()
                .await
                .map_err(|e| ScenarioError::RecoveryFailure(format!("extend integration: {e}")))?;
        } else {
            let nodes = ctx.nodes_to_recover();
            if nodes.is_empty() {
                debug!("no nodes to recover");
            }
            let failed = self.injector.recover_nodes(&nodes).await;
            if !failed.is_empty() {
                for (node, e) in &failed {
                    warn!(node = %node.hostname, error = %e, "recovery command failed");
                }
                let hosts: Vec<&str> = failed.iter().map(|(n, _)| n.hostname.as_str()).collect();
                return Err(ScenarioError::RecoveryFailure(format!(
                    "could not recover {}",
                    hosts.join(", ")
                )));
            }
        }

        let timing = &self.cfg.timing;
        self.verifier
            .await_domain_counts(
                DomainCounts::default(),
                timing.recovery_timeout(),
                timing.sanity_interval(),
            )
            .await
            .map_err(|e| ScenarioError::RecoveryFailure(e.to_string()))?;
        info!("cluster recovered");
        Ok(())
    }
}

/// Create `dir` if needed and make sure files can be written into it.
async fn ensure_log_dir(dir: &Path) -> Result<(), ConfigError> {
    let err = |source| ConfigError::LogDir {
        path: dir.to_path_buf(),
        source,
    };
    tokio::fs::create_dir_all(dir).await.map_err(err)?;
    let probe = dir.join(".faultline-write-probe");
    tokio::fs::write(&probe, b"").await.map_err(err)?;
    tokio::fs::remove_file(&probe).await.map_err(err)?;
    Ok(())
}

async fn append_summary(log_dir: &Path, result: &ScenarioResult) -> Result<(), ScenarioError> {
    let mut line = serde_json::to_string(result).map_err(std::io::Error::from)?;
    line.push('\n');
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join(SUMMARY_FILE))
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}
