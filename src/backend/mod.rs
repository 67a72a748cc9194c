//! Collaborator services the engine drives and observes.
//!
//! The engine only ever talks to the cluster through these traits. Available
//! implementations:
//!
//! - `ssh`: remote command execution through the system `ssh` binary
//! - `command`: status, membership and storage queries answered by running
//!   configured admin commands over a [`RemoteExec`]
//! - `sim`: an in-memory simulated cluster implementing every trait

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::cluster::{MembershipRecord, MembershipSnapshot};
use crate::error::{BackendError, ConfigError, RemoteError};
use crate::settings::{AppConfig, BackendKind};

pub mod command;
pub mod sim;
pub mod ssh;

pub use command::CommandCluster;
pub use sim::{SimCluster, SimTopology};
pub use ssh::SshExec;

/// Result of one remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Synchronous command execution on a cluster host.
#[async_trait]
pub trait RemoteExec: Send + Sync {
    /// Run `command` on `host`, giving up after `timeout`.
    async fn exec(
        &self,
        host: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecOutput, RemoteError>;

    /// Whether `host` currently answers at the network level.
    async fn ping(&self, host: &str) -> bool;

    /// Run `command` and require a zero exit status, returning stdout.
    async fn run(&self, host: &str, command: &str, timeout: Duration) -> Result<String, RemoteError> {
        let out = self.exec(host, command, timeout).await?;
        if out.success() {
            Ok(out.stdout)
        } else {
            Err(RemoteError::CommandFailed {
                host: host.to_string(),
                command: command.to_string(),
                code: out.exit_code,
                stderr: out.stderr.trim().to_string(),
            })
        }
    }
}

/// The cluster's current quorum/fault-tolerance state as free text.
#[async_trait]
pub trait ClusterStatus: Send + Sync {
    async fn status_text(&self) -> Result<String, BackendError>;
}

/// The replicated database's own record of which nodes are members.
#[async_trait]
pub trait DomainMembership: Send + Sync {
    /// Every configured node with its current membership, freshly fetched.
    async fn snapshot(&self) -> Result<MembershipSnapshot, BackendError>;

    /// Membership record of one node, `None` when absent from the domain.
    async fn membership(&self, hostname: &str) -> Result<Option<MembershipRecord>, BackendError> {
        let snapshot = self.snapshot().await?;
        Ok(snapshot
            .by_hostname(hostname)
            .and_then(|node| node.membership))
    }
}

/// An opaque, comparable marker of the database's storage generation.
#[async_trait]
pub trait StorageArtifact: Send + Sync {
    async fn artifact_timestamp(&self) -> Result<String, BackendError>;
}

/// The full set of collaborators one run is wired to.
#[derive(Clone)]
pub struct ClusterBackends {
    pub exec: Arc<dyn RemoteExec>,
    pub status: Arc<dyn ClusterStatus>,
    pub membership: Arc<dyn DomainMembership>,
    pub artifact: Arc<dyn StorageArtifact>,
    /// Host that runs cluster-level commands
    pub admin_host: String,
}

impl ClusterBackends {
    /// Wire every collaborator to the same simulated cluster.
    pub fn from_sim(sim: Arc<SimCluster>) -> Self {
        Self {
            admin_host: sim.admin_host().to_string(),
            exec: sim.clone(),
            status: sim.clone(),
            membership: sim.clone(),
            artifact: sim,
        }
    }

    /// Build the collaborators selected by `[cluster].backend`.
    pub fn from_config(cfg: &AppConfig) -> Result<Self, ConfigError> {
        match cfg.cluster.backend {
            BackendKind::Sim => {
                let sim = SimCluster::with_levels(
                    SimTopology {
                        nodes: cfg.cluster.sim_nodes,
                        spares: cfg.cluster.sim_spares,
                    },
                    cfg.commands.clone(),
                    cfg.cluster.weaker_level.clone(),
                    cfg.cluster.stronger_level.clone(),
                );
                Ok(Self::from_sim(sim))
            }
            BackendKind::Command => {
                let admin_host = cfg
                    .cluster
                    .admin_host
                    .clone()
                    .ok_or(ConfigError::MissingAdminHost)?;
                let exec: Arc<dyn RemoteExec> = Arc::new(SshExec::new(
                    cfg.cluster.ssh_user.clone(),
                    cfg.cluster.ssh_options.clone(),
                ));
                let cluster = Arc::new(CommandCluster::new(
                    exec.clone(),
                    admin_host.clone(),
                    cfg.commands.clone(),
                    cfg.timing.remote_timeout(),
                ));
                Ok(Self {
                    exec,
                    status: cluster.clone(),
                    membership: cluster.clone(),
                    artifact: cluster,
                    admin_host,
                })
            }
        }
    }
}
