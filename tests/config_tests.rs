use faultline::cluster::{ClusterOperation, KillMode, NodeAction};
use faultline::error::ConfigError;
use faultline::settings::{AppConfig, BackendKind, LogFormat};
use std::io::Write;
use std::time::Duration;

#[faultline::test]
fn loads_a_full_config_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
[run]
iterations = 5
log_dir = "/var/tmp/faultline"
log_format = "json"
seed = 99

[scenario]
node_action = "disable"
cluster_operation = "hard-reboot"
node_count = 2
kill_mode = "hard"
allow_mirrors = true
follow_master = true

[timing]
convergence_timeout_ms = 900000
convergence_interval_ms = 20000

[cluster]
backend = "command"
admin_host = "hcb101"
ssh_user = "root"
weaker_level = "FT"
stronger_level = "HAFT"

[commands]
status = "dbctl status"

[hooks]
pre_iteration = ["/opt/hooks/snapshot-logs.sh"]
"#
    )
    .unwrap();

    let cfg = AppConfig::load(Some(file.path())).unwrap();
    cfg.validate().unwrap();
    assert_eq!(cfg.run.iterations, 5);
    assert_eq!(cfg.run.log_format, LogFormat::Json);
    assert_eq!(cfg.scenario.node_action, NodeAction::Disable);
    assert_eq!(cfg.scenario.cluster_operation, ClusterOperation::HardReboot);
    assert_eq!(cfg.scenario.kill_mode, KillMode::Hard);
    assert!(cfg.scenario.allow_mirrors && cfg.scenario.follow_master);
    assert!(!cfg.scenario.reuse_nodes);
    assert_eq!(cfg.timing.convergence_timeout(), Duration::from_secs(900));
    assert_eq!(cfg.cluster.backend, BackendKind::Command);
    assert_eq!(cfg.commands.status, "dbctl status");
    // unspecified commands keep their defaults
    assert_eq!(cfg.commands.recover, "clusterctl node recover");
    assert_eq!(cfg.hooks.pre_iteration.len(), 1);
}

#[faultline::test]
fn missing_file_is_a_read_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = AppConfig::load(Some(&dir.path().join("absent.toml"))).unwrap_err();
    assert!(matches!(err, ConfigError::Read { .. }));
}

#[faultline::test]
fn unknown_action_is_a_parse_error() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[scenario]\nnode_action = \"explode\"").unwrap();
    let err = AppConfig::load(Some(file.path())).unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_)));
}

#[faultline::test]
fn no_file_means_defaults() {
    let cfg = AppConfig::load(None).unwrap();
    assert_eq!(cfg.run.iterations, 1);
    assert_eq!(cfg.scenario.node_count, 1);
    assert_eq!(cfg.cluster.backend, BackendKind::Command);
}
