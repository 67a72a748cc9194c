//! End-to-end runs of the iteration state machine against the simulated
//! cluster. Time is paused, so every settle and poll completes instantly.

use test_helpers::{run_backends, run_sim, sim_cluster, sim_config, summary_lines};

use async_trait::async_trait;
use faultline::backend::{ClusterBackends, DomainMembership, SimCluster, StorageArtifact};
use faultline::cluster::{ClusterNode, ClusterOperation, KillMode, NodeAction};
use faultline::controller::IterationController;
use faultline::error::{BackendError, ConfigError, EXIT_ERROR, EXIT_FAILURE, ScenarioError};
use faultline::scenario::Stage;
use faultline::selector::{NodeSelector, SelectionOptions};
use faultline::settings::CommandSet;
use faultline::verifier::DomainCounts;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[faultline::test(start_paused = true)]
async fn kill_then_reboot_leaves_nodes_disabled_until_recovered() {
    let dir = tempfile::tempdir().unwrap();
    let sim = sim_cluster();
    let mut cfg = sim_config(dir.path(), NodeAction::Kill, ClusterOperation::Reboot);
    cfg.scenario.node_count = 2;
    cfg.scenario.kill_mode = KillMode::Soft;

    let report = run_sim(&sim, cfg).await;
    assert!(report.succeeded(), "{:?}", report.failure);
    assert_eq!(report.completed.len(), 1);

    let result = &report.completed[0];
    assert!(!result.wipe_expected);
    assert!(!result.wiped);
    assert_eq!(result.nodes.len(), 2);
    assert_eq!(
        result.counts,
        DomainCounts {
            disabled: 2,
            missing: 0
        }
    );

    // recovered
    let snap = sim.snapshot().await.unwrap();
    assert_eq!(snap.disabled_count(), 0);
    assert_eq!(snap.missing_count(), 0);
    assert_eq!(sim.generation().await, 1);
    assert!(sim.anomalies().await.is_empty());

    let lines = summary_lines(dir.path());
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["action"], "kill");
    assert_eq!(lines[0]["counts"]["disabled"], 2);
}

#[faultline::test(start_paused = true)]
async fn hard_reboot_drops_killed_nodes_from_the_domain() {
    let dir = tempfile::tempdir().unwrap();
    let sim = sim_cluster();
    let mut cfg = sim_config(dir.path(), NodeAction::Kill, ClusterOperation::HardReboot);
    cfg.scenario.node_count = 2;
    cfg.scenario.kill_mode = KillMode::Hard;

    let report = run_sim(&sim, cfg).await;
    assert!(report.succeeded(), "{:?}", report.failure);

    let result = &report.completed[0];
    assert!(result.wipe_expected);
    assert!(result.wiped);
    assert_eq!(
        result.counts,
        DomainCounts {
            disabled: 0,
            missing: 2
        }
    );
    assert_eq!(sim.generation().await, 2);
    assert_eq!(sim.snapshot().await.unwrap().missing_count(), 0);
}

#[faultline::test(start_paused = true)]
async fn every_action_and_operation_verifies() {
    let shapes = [(1, false), (2, false), (2, true)];
    for action in NodeAction::ALL {
        for op in ClusterOperation::ALL {
            for (count, mirrors) in shapes {
                let dir = tempfile::tempdir().unwrap();
                let sim = sim_cluster();
                let mut cfg = sim_config(dir.path(), action, op);
                cfg.scenario.node_count = count;
                cfg.scenario.allow_mirrors = mirrors;

                let report = run_sim(&sim, cfg).await;
                assert!(
                    report.succeeded(),
                    "{action}/{op} count={count} mirrors={mirrors}: {:?}",
                    report.failure
                );
                let snap = sim.snapshot().await.unwrap();
                assert_eq!(snap.disabled_count(), 0, "{action}/{op} left nodes disabled");
                assert_eq!(snap.missing_count(), 0, "{action}/{op} left nodes missing");
            }
        }
    }
}

#[faultline::test(start_paused = true)]
async fn convergence_timeout_ends_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let sim = sim_cluster();
    sim.set_boot_polls(u32::MAX).await;
    let mut cfg = sim_config(dir.path(), NodeAction::Reboot, ClusterOperation::Reboot);
    cfg.run.iterations = 3;

    let report = run_sim(&sim, cfg).await;
    let failure = report.failure.as_ref().expect("run should fail");
    assert_eq!(failure.iteration, 1);
    assert_eq!(failure.stage, Stage::AwaitConvergence);
    assert_eq!(failure.exit_code, EXIT_FAILURE);
    assert!(matches!(
        failure.error,
        ScenarioError::ConvergenceTimeout { .. }
    ));
    assert!(report.completed.is_empty());
    assert!(summary_lines(dir.path()).is_empty());
}

#[faultline::test(start_paused = true)]
async fn cluster_without_quorum_fails_setup() {
    let dir = tempfile::tempdir().unwrap();
    let sim = sim_cluster();
    sim.set_status_override(Some("Database status: NonOperational".to_string()))
        .await;
    let cfg = sim_config(dir.path(), NodeAction::Kill, ClusterOperation::Nothing);

    let report = run_sim(&sim, cfg).await;
    let failure = report.failure.as_ref().expect("setup should fail");
    assert_eq!(failure.iteration, 0);
    assert_eq!(failure.stage, Stage::Setup);
    assert_eq!(failure.exit_code, EXIT_ERROR);
    assert!(matches!(
        failure.error,
        ScenarioError::Configuration(ConfigError::NotQuorate(_))
    ));
    // nothing was done to the cluster
    assert!(sim.executed().await.is_empty());
}

#[faultline::test(start_paused = true)]
async fn unusable_log_dir_fails_setup() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("not-a-dir");
    std::fs::write(&file, b"").unwrap();
    let sim = sim_cluster();
    let cfg = sim_config(&file.join("logs"), NodeAction::Kill, ClusterOperation::Nothing);

    let report = run_sim(&sim, cfg).await;
    let failure = report.failure.as_ref().expect("setup should fail");
    assert_eq!(failure.stage, Stage::Setup);
    assert!(matches!(
        failure.error,
        ScenarioError::Configuration(ConfigError::LogDir { .. })
    ));
    assert_eq!(failure.exit_code, EXIT_ERROR);
}

#[faultline::test]
fn invalid_config_is_rejected_before_running() {
    let dir = tempfile::tempdir().unwrap();
    let sim = sim_cluster();
    let mut cfg = sim_config(dir.path(), NodeAction::Kill, ClusterOperation::Nothing);
    cfg.run.iterations = 0;
    let err = IterationController::new(cfg, ClusterBackends::from_sim(sim)).err();
    let err = ScenarioError::from(err.expect("zero iterations rejected"));
    assert_eq!(err.exit_code(), EXIT_ERROR);
}

#[faultline::test(start_paused = true)]
async fn too_many_nodes_fails_selection() {
    let dir = tempfile::tempdir().unwrap();
    let sim = sim_cluster();
    let mut cfg = sim_config(dir.path(), NodeAction::Kill, ClusterOperation::Nothing);
    // 7 mirror pairs among the active nodes
    cfg.scenario.node_count = 8;

    let report = run_sim(&sim, cfg).await;
    let failure = report.failure.as_ref().expect("selection should fail");
    assert_eq!(failure.stage, Stage::SelectNodes);
    assert_eq!(failure.exit_code, EXIT_ERROR);
    assert!(sim.executed().await.is_empty());
}

/// Storage marker that changes on every read, as if the database were
/// reinitialized behind the engine's back.
struct ChurningArtifact(AtomicU64);

#[async_trait]
impl StorageArtifact for ChurningArtifact {
    async fn artifact_timestamp(&self) -> Result<String, BackendError> {
        Ok(self.0.fetch_add(1, Ordering::SeqCst).to_string())
    }
}

#[faultline::test(start_paused = true)]
async fn unexpected_wipe_fails_the_iteration() {
    let dir = tempfile::tempdir().unwrap();
    let sim = sim_cluster();
    let mut backends = ClusterBackends::from_sim(sim.clone());
    backends.artifact = Arc::new(ChurningArtifact(AtomicU64::new(0)));
    let cfg = sim_config(dir.path(), NodeAction::Kill, ClusterOperation::Nothing);

    let report = run_backends(backends, cfg).await;
    let failure = report.failure.as_ref().expect("wipe check should fail");
    assert_eq!(failure.stage, Stage::CheckWipe);
    assert_eq!(failure.exit_code, EXIT_FAILURE);
    assert!(matches!(
        failure.error,
        ScenarioError::WipeMismatch {
            expected: false,
            observed: true
        }
    ));
}

/// The single node the controller will pick first for `seed`.
async fn first_pick(sim: &Arc<SimCluster>, seed: u64) -> ClusterNode {
    let snapshot = sim.snapshot().await.unwrap();
    let opts = SelectionOptions {
        count: 1,
        allow_spares: false,
        allow_mirrors: false,
        reuse: false,
        always_include_master: false,
    };
    NodeSelector::new(seed).select(&snapshot, &opts).unwrap()[0].clone()
}

#[faultline::test(start_paused = true)]
async fn unreachable_kill_target_is_treated_as_already_down() {
    let dir = tempfile::tempdir().unwrap();
    let sim = sim_cluster();
    let cfg = sim_config(dir.path(), NodeAction::Kill, ClusterOperation::Nothing);
    let target = first_pick(&sim, 17).await;
    // back on the network well before recovery, still out of service
    sim.set_unreachable_for(&target.hostname, Duration::from_millis(100))
        .await;

    let report = run_sim(&sim, cfg).await;
    assert!(report.succeeded(), "{:?}", report.failure);
    let result = &report.completed[0];
    assert_eq!(result.nodes, vec![target.hostname.clone()]);
    assert_eq!(result.assumed_down, result.nodes);
    assert_eq!(
        result.counts,
        DomainCounts {
            disabled: 1,
            missing: 0
        }
    );
    // the kill never reached the host; only the recovery did
    let kill = CommandSet::default().kill_soft;
    let executed = sim.executed().await;
    assert!(!executed.iter().any(|(h, c)| h == &target.hostname && c == &kill));
    assert!(executed.iter().any(|(h, _)| h == &target.hostname));

    let snap = sim.snapshot().await.unwrap();
    let record = snap.by_hostname(&target.hostname).unwrap().membership.unwrap();
    assert!(record.enabled && record.running);
}

#[faultline::test(start_paused = true)]
async fn failed_recovery_ends_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let sim = sim_cluster();
    let mut cfg = sim_config(dir.path(), NodeAction::Kill, ClusterOperation::Nothing);
    cfg.run.iterations = 3;
    let target = first_pick(&sim, 17).await;
    sim.set_unreachable(&target.hostname, true).await;

    let report = run_sim(&sim, cfg).await;
    let failure = report.failure.as_ref().expect("recovery should fail");
    assert_eq!(failure.iteration, 1);
    assert_eq!(failure.stage, Stage::RecoverNodes);
    assert_eq!(failure.exit_code, EXIT_FAILURE);
    assert!(matches!(failure.error, ScenarioError::RecoveryFailure(_)));
    assert!(failure.reason.contains(&target.hostname), "{}", failure.reason);
    assert!(report.completed.is_empty());
    assert!(summary_lines(dir.path()).is_empty());
}

#[faultline::test(start_paused = true)]
async fn failover_settle_runs_only_when_a_role_holder_goes_down() {
    const FAILOVER_SETTLE_MS: u64 = 60_000;

    let dir = tempfile::tempdir().unwrap();
    let sim = sim_cluster();
    let mut cfg = sim_config(dir.path(), NodeAction::Kill, ClusterOperation::Nothing);
    cfg.timing.failover_settle_ms = FAILOVER_SETTLE_MS;
    cfg.scenario.follow_master = true;
    let report = run_sim(&sim, cfg).await;
    assert!(report.succeeded(), "{:?}", report.failure);
    let result = &report.completed[0];
    assert!(result.failover_triggered);
    assert!(result.elapsed_ms >= FAILOVER_SETTLE_MS, "{}", result.elapsed_ms);

    // a seed whose first pick holds no role
    let sim = sim_cluster();
    let mut seed = 0;
    while first_pick(&sim, seed).await.role().is_some() {
        seed += 1;
    }
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = sim_config(dir.path(), NodeAction::Kill, ClusterOperation::Nothing);
    cfg.timing.failover_settle_ms = FAILOVER_SETTLE_MS;
    cfg.run.seed = Some(seed);
    let report = run_sim(&sim, cfg).await;
    assert!(report.succeeded(), "{:?}", report.failure);
    let result = &report.completed[0];
    assert!(!result.failover_triggered);
    assert!(result.elapsed_ms < FAILOVER_SETTLE_MS, "{}", result.elapsed_ms);
}

#[faultline::test(start_paused = true)]
async fn following_the_master_with_mirrors_wipes_its_pair() {
    for seed in 0..10 {
        let dir = tempfile::tempdir().unwrap();
        let sim = sim_cluster();
        let mut cfg = sim_config(dir.path(), NodeAction::Kill, ClusterOperation::Reboot);
        cfg.run.iterations = 2;
        cfg.run.seed = Some(seed);
        cfg.scenario.node_count = 2;
        cfg.scenario.allow_mirrors = true;
        cfg.scenario.follow_master = true;
        let master = sim.snapshot().await.unwrap().master().unwrap().clone();

        let report = run_sim(&sim, cfg).await;
        assert!(report.succeeded(), "seed {seed}: {:?}", report.failure);
        let first = &report.completed[0];
        assert!(first.wipe_expected && first.wiped);
        assert!(first.nodes.contains(&master.hostname), "seed {seed}: {:?}", first.nodes);
        assert_eq!(
            first.counts,
            DomainCounts {
                disabled: 0,
                missing: 2
            }
        );
        assert!(report.completed.iter().all(|r| r.failover_triggered && r.wiped));
        assert!(sim.anomalies().await.is_empty(), "{:?}", sim.anomalies().await);
    }
}

#[faultline::test(start_paused = true)]
async fn following_the_master_acknowledges_each_failover() {
    let dir = tempfile::tempdir().unwrap();
    let sim = sim_cluster();
    let mut cfg = sim_config(dir.path(), NodeAction::Kill, ClusterOperation::Nothing);
    cfg.run.iterations = 3;
    cfg.scenario.follow_master = true;
    cfg.scenario.reuse_nodes = true;

    let report = run_sim(&sim, cfg).await;
    assert!(report.succeeded(), "{:?}", report.failure);
    assert!(report.completed.iter().all(|r| r.failover_triggered));

    // the master moved every iteration, so reuse did not pin the selection
    let targets: BTreeSet<_> = report.completed.iter().map(|r| r.nodes.clone()).collect();
    assert_eq!(targets.len(), 3);
    assert!(sim.anomalies().await.is_empty(), "{:?}", sim.anomalies().await);
}

#[faultline::test(start_paused = true)]
async fn reused_nodes_stay_fixed_across_iterations() {
    let dir = tempfile::tempdir().unwrap();
    let sim = sim_cluster();
    let mut cfg = sim_config(dir.path(), NodeAction::Disable, ClusterOperation::Reboot);
    cfg.run.iterations = 3;
    cfg.scenario.node_count = 2;
    cfg.scenario.reuse_nodes = true;

    let report = run_sim(&sim, cfg).await;
    assert!(report.succeeded(), "{:?}", report.failure);
    let first = &report.completed[0].nodes;
    assert!(report.completed.iter().all(|r| &r.nodes == first));
    assert_eq!(summary_lines(dir.path()).len(), 3);
}

#[faultline::test(start_paused = true)]
async fn roll_mode_draws_a_scenario_per_iteration() {
    let dir = tempfile::tempdir().unwrap();
    let sim = sim_cluster();
    let mut cfg = sim_config(dir.path(), NodeAction::Nothing, ClusterOperation::Nothing);
    cfg.run.iterations = 6;
    cfg.scenario.roll_nodes = true;

    let report = run_sim(&sim, cfg).await;
    assert!(report.succeeded(), "{:?}", report.failure);
    assert_eq!(report.completed.len(), 6);
    for r in &report.completed {
        assert_ne!(r.action, NodeAction::Nothing);
        assert_ne!(r.cluster_operation, ClusterOperation::Extend);
    }
}

#[faultline::test(start_paused = true)]
async fn same_seed_selects_the_same_nodes() {
    let mut runs = Vec::new();
    for _ in 0..2 {
        let dir = tempfile::tempdir().unwrap();
        let sim = sim_cluster();
        let mut cfg = sim_config(dir.path(), NodeAction::Reboot, ClusterOperation::Nothing);
        cfg.run.iterations = 3;
        cfg.scenario.node_count = 3;
        let report = run_sim(&sim, cfg).await;
        assert!(report.succeeded(), "{:?}", report.failure);
        runs.push(
            report
                .completed
                .iter()
                .map(|r| r.nodes.clone())
                .collect::<Vec<_>>(),
        );
    }
    assert_eq!(runs[0], runs[1]);
}
