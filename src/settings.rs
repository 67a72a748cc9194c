use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cluster::{ClusterOperation, KillMode, NodeAction};
use crate::error::ConfigError;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub scenario: ScenarioConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub commands: CommandSet,
    #[serde(default)]
    pub hooks: HooksConfig,
}

/// Log output format.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RunConfig {
    #[serde(default = "default_iterations")]
    pub iterations: u32,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default)]
    pub log_format: LogFormat,
    /// Seed for node selection and rolls; drawn from the OS when unset
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            iterations: default_iterations(),
            log_dir: default_log_dir(),
            log_format: LogFormat::default(),
            seed: None,
        }
    }
}

fn default_iterations() -> u32 {
    1
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("/tmp/faultline")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScenarioConfig {
    #[serde(default)]
    pub node_action: NodeAction,
    #[serde(default)]
    pub cluster_operation: ClusterOperation,
    #[serde(default = "default_node_count")]
    pub node_count: usize,
    #[serde(default)]
    pub kill_mode: KillMode,
    /// Select whole mirror pairs; when unset, never select both partners of a pair
    #[serde(default)]
    pub allow_mirrors: bool,
    #[serde(default)]
    pub allow_spares: bool,
    /// Act on the same nodes every iteration
    #[serde(default)]
    pub reuse_nodes: bool,
    /// Draw a fresh node action and cluster operation every iteration
    #[serde(default)]
    pub roll_nodes: bool,
    /// Always include the current master in the acting set
    #[serde(default)]
    pub follow_master: bool,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            node_action: NodeAction::default(),
            cluster_operation: ClusterOperation::default(),
            node_count: default_node_count(),
            kill_mode: KillMode::default(),
            allow_mirrors: false,
            allow_spares: false,
            reuse_nodes: false,
            roll_nodes: false,
            follow_master: false,
        }
    }
}

fn default_node_count() -> usize {
    1
}

/// Durations for every settle and wait, in milliseconds.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TimingConfig {
    pub settle_ms: u64,
    /// Extra settle after the master was taken down, before the cluster operation
    pub failover_settle_ms: u64,
    pub convergence_timeout_ms: u64,
    pub convergence_interval_ms: u64,
    pub wipe_timeout_ms: u64,
    pub wipe_interval_ms: u64,
    pub sanity_timeout_ms: u64,
    pub sanity_interval_ms: u64,
    pub recovery_timeout_ms: u64,
    pub remote_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            settle_ms: 30_000,
            failover_settle_ms: 120_000,
            convergence_timeout_ms: 1_800_000,
            convergence_interval_ms: 30_000,
            wipe_timeout_ms: 300_000,
            wipe_interval_ms: 10_000,
            sanity_timeout_ms: 600_000,
            sanity_interval_ms: 15_000,
            recovery_timeout_ms: 1_800_000,
            remote_timeout_ms: 120_000,
        }
    }
}

impl TimingConfig {
    /// Short waits for an in-memory cluster, where nothing takes real time.
    pub fn simulated() -> Self {
        Self {
            settle_ms: 10,
            failover_settle_ms: 10,
            convergence_timeout_ms: 5_000,
            convergence_interval_ms: 50,
            wipe_timeout_ms: 200,
            wipe_interval_ms: 50,
            sanity_timeout_ms: 2_000,
            sanity_interval_ms: 50,
            recovery_timeout_ms: 5_000,
            remote_timeout_ms: 1_000,
        }
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
    pub fn failover_settle(&self) -> Duration {
        Duration::from_millis(self.failover_settle_ms)
    }
    pub fn convergence_timeout(&self) -> Duration {
        Duration::from_millis(self.convergence_timeout_ms)
    }
    pub fn convergence_interval(&self) -> Duration {
        Duration::from_millis(self.convergence_interval_ms)
    }
    pub fn wipe_timeout(&self) -> Duration {
        Duration::from_millis(self.wipe_timeout_ms)
    }
    pub fn wipe_interval(&self) -> Duration {
        Duration::from_millis(self.wipe_interval_ms)
    }
    pub fn sanity_timeout(&self) -> Duration {
        Duration::from_millis(self.sanity_timeout_ms)
    }
    pub fn sanity_interval(&self) -> Duration {
        Duration::from_millis(self.sanity_interval_ms)
    }
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("timing.convergence_interval_ms", self.convergence_interval_ms),
            ("timing.wipe_interval_ms", self.wipe_interval_ms),
            ("timing.sanity_interval_ms", self.sanity_interval_ms),
            ("timing.remote_timeout_ms", self.remote_timeout_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(ConfigError::ZeroDuration(name));
            }
        }
        Ok(())
    }
}

/// Which implementation of the cluster collaborators to drive.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Run configured admin commands over ssh
    #[default]
    Command,
    /// In-memory simulated cluster
    Sim,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ClusterConfig {
    pub backend: BackendKind,
    /// Host that runs cluster-level commands and status queries
    pub admin_host: Option<String>,
    pub ssh_user: Option<String>,
    pub ssh_options: Vec<String>,
    /// Status string of the weaker fault-tolerance level
    pub weaker_level: String,
    /// Status string of the stronger fault-tolerance level
    pub stronger_level: String,
    /// Log per-node reachability and device size while polling
    pub diagnostics: bool,
    /// Node count of the simulated cluster
    pub sim_nodes: u32,
    pub sim_spares: u32,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            admin_host: None,
            ssh_user: None,
            ssh_options: vec!["-o".to_string(), "BatchMode=yes".to_string()],
            weaker_level: "FaultTolerant".to_string(),
            stronger_level: "HAFaultTolerant".to_string(),
            diagnostics: true,
            sim_nodes: 16,
            sim_spares: 2,
        }
    }
}

/// Remote command lines for every action and query.
///
/// `failover_ack` may contain a "%role%" placeholder that will be replaced
/// with the role expected to fail over.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct CommandSet {
    pub disable: String,
    pub kill_soft: String,
    pub kill_hard: String,
    pub reboot: String,
    pub recover: String,
    pub cluster_reboot: String,
    pub cluster_hard_reboot: String,
    pub extend: String,
    pub extend_integrate: String,
    pub failover_ack: String,
    pub status: String,
    pub membership: String,
    pub artifact: String,
    pub device_size: String,
}

impl Default for CommandSet {
    fn default() -> Self {
        Self {
            disable: "clusterctl node disable --persist".to_string(),
            kill_soft: "clusterctl node stop-services".to_string(),
            kill_hard: "reboot -f".to_string(),
            reboot: "clusterctl node reboot --clear-maintenance".to_string(),
            recover: "clusterctl node recover".to_string(),
            cluster_reboot: "clusterctl cluster reboot".to_string(),
            cluster_hard_reboot: "clusterctl cluster reboot --hard".to_string(),
            extend: "clusterctl cluster extend".to_string(),
            extend_integrate: "clusterctl cluster extend --integrate".to_string(),
            failover_ack: "clusterctl domain expect-failover %role%".to_string(),
            status: "clusterctl status".to_string(),
            membership: "clusterctl domain members --json".to_string(),
            artifact: "stat -c %Y /data/db/log".to_string(),
            device_size: "df -k --output=size /data".to_string(),
        }
    }
}

impl CommandSet {
    pub fn failover_ack_for(&self, role: crate::cluster::MasterRole) -> String {
        self.failover_ack.replace("%role%", &role.to_string())
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HooksConfig {
    /// Local shell commands run before every iteration
    pub pre_iteration: Vec<String>,
    pub timeout_ms: u64,
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            pre_iteration: Vec::new(),
            timeout_ms: 600_000,
        }
    }
}

impl HooksConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => {
                let data = fs::read_to_string(p).map_err(|source| ConfigError::Read {
                    path: p.to_path_buf(),
                    source,
                })?;
                let cfg: Self = toml::from_str(&data)?;
                Ok(cfg)
            }
            None => Ok(Self::default()),
        }
    }

    /// Static checks that need no IO. Log directory and quorum checks happen
    /// at run setup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.run.iterations == 0 {
            return Err(ConfigError::ZeroIterations);
        }
        if self.scenario.node_count == 0 {
            return Err(ConfigError::ZeroNodeCount);
        }
        if self.scenario.roll_nodes && self.scenario.cluster_operation == ClusterOperation::Extend
        {
            return Err(ConfigError::RollWithExtend);
        }
        if self.cluster.weaker_level.trim().is_empty()
            || self.cluster.stronger_level.trim().is_empty()
        {
            return Err(ConfigError::EmptyLevelString);
        }
        if self.cluster.backend == BackendKind::Command && self.cluster.admin_host.is_none() {
            return Err(ConfigError::MissingAdminHost);
        }
        self.timing.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_need_an_admin_host() {
        let cfg = AppConfig::default();
        assert!(matches!(cfg.validate(), Err(ConfigError::MissingAdminHost)));
    }

    #[test]
    fn parses_partial_toml() {
        let cfg: AppConfig = toml::from_str(
            r#"
            [run]
            iterations = 3
            seed = 7

            [scenario]
            node_action = "kill"
            cluster_operation = "reboot"
            node_count = 2

            [timing]
            settle_ms = 5

            [cluster]
            admin_host = "hcb101"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.run.iterations, 3);
        assert_eq!(cfg.run.seed, Some(7));
        assert_eq!(cfg.scenario.node_action, NodeAction::Kill);
        assert_eq!(cfg.scenario.cluster_operation, ClusterOperation::Reboot);
        assert_eq!(cfg.timing.settle(), Duration::from_millis(5));
        // untouched fields keep their defaults
        assert_eq!(cfg.timing.wipe_interval_ms, 10_000);
        assert_eq!(cfg.cluster.stronger_level, "HAFaultTolerant");
        cfg.validate().unwrap();
    }

    #[test]
    fn rejects_zero_iterations_and_intervals() {
        let mut cfg = AppConfig::default();
        cfg.cluster.admin_host = Some("hcb101".to_string());
        cfg.run.iterations = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::ZeroIterations)));

        cfg.run.iterations = 1;
        cfg.timing.wipe_interval_ms = 0;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::ZeroDuration("timing.wipe_interval_ms"))
        ));
    }

    #[test]
    fn rejects_roll_with_extend() {
        let mut cfg = AppConfig::default();
        cfg.cluster.backend = BackendKind::Sim;
        cfg.scenario.roll_nodes = true;
        cfg.scenario.cluster_operation = ClusterOperation::Extend;
        assert!(matches!(cfg.validate(), Err(ConfigError::RollWithExtend)));
    }

    #[test]
    fn failover_ack_substitutes_role() {
        let cmds = CommandSet::default();
        assert_eq!(
            cmds.failover_ack_for(crate::cluster::MasterRole::Vice),
            "clusterctl domain expect-failover vice"
        );
    }
}
