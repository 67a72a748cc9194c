//! In-memory simulated cluster - useful for testing and dry runs.
//!
//! The simulation understands the commands of a [`CommandSet`] and models the
//! behaviour the engine verifies against:
//!
//! - a disable only takes effect at the node's next reboot
//! - killed nodes stay down (disabled, not running) until recovered
//! - acting on both partners of a mirror pair, a hard reboot, or an extend
//!   reinitializes the database: the storage generation changes and the domain
//!   is rebuilt from the nodes that are up at that moment
//! - master and vice roles fail over when their holder goes down
//! - the status drops to the weaker level with exactly two members out of
//!   service (any number on a small cluster) and to "NonFaultTolerant" with a
//!   whole mirror pair out
//!
//! Consequences of actions are applied lazily on the next query, so a batch of
//! node actions followed by a cluster operation is observed as a whole.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::backend::{
    ClusterStatus, DomainMembership, ExecOutput, RemoteExec, StorageArtifact,
};
use crate::cluster::{ClusterNode, MasterRole, MembershipRecord, MembershipSnapshot};
use crate::convergence::SMALL_CLUSTER_NODES;
use crate::error::{BackendError, RemoteError};
use crate::settings::CommandSet;

const ADMIN_HOST: &str = "admin";
const DEVICE_SIZE_KB: &str = "1953514584";

/// Shape of the simulated cluster.
#[derive(Debug, Clone, Copy)]
pub struct SimTopology {
    pub nodes: u32,
    /// The highest `spares` ordinals are standby nodes
    pub spares: u32,
}

#[derive(Debug, Clone)]
struct SimNode {
    ordinal: u32,
    hostname: String,
    spare: bool,
    mirror: Option<u32>,
    /// Managed service processes are up
    services: bool,
    /// Disable requested; takes effect at the next reboot
    maintenance: bool,
    /// Maintenance mode in effect
    offline: bool,
    in_domain: bool,
    enabled: bool,
    running: bool,
    unreachable: bool,
    /// Network returns at this instant; services stay down until recovered
    reachable_at: Option<Instant>,
}

impl SimNode {
    fn serving(&self) -> bool {
        self.in_domain && self.enabled && self.running
    }

    fn come_up(&mut self) {
        self.services = true;
        self.offline = false;
        self.enabled = true;
        self.running = true;
    }

    fn go_down(&mut self) {
        self.enabled = false;
        self.running = false;
    }

    fn is_unreachable(&self) -> bool {
        self.unreachable || self.reachable_at.is_some_and(|at| Instant::now() < at)
    }

    /// The host dropped off the network: whatever ran on it is gone.
    fn crash(&mut self) {
        self.services = false;
        self.go_down();
    }
}

#[derive(Debug)]
struct SimState {
    nodes: Vec<SimNode>,
    master: Option<u32>,
    vice: Option<u32>,
    generation: u64,
    wipe_pending: bool,
    /// Nodes hit by a non-trivial action since the last settle
    touched: BTreeSet<u32>,
    acks: HashSet<MasterRole>,
    anomalies: Vec<String>,
    commands: Vec<(String, String)>,
    /// Status polls that still report the cluster as starting
    booting_polls: u32,
    boot_polls_after_op: u32,
    status_override: Option<String>,
}

impl SimState {
    fn node_mut(&mut self, host: &str) -> Option<&mut SimNode> {
        self.nodes.iter_mut().find(|n| n.hostname == host)
    }

    fn node_by_ordinal(&self, ordinal: u32) -> Option<&SimNode> {
        self.nodes.iter().find(|n| n.ordinal == ordinal)
    }

    fn ordinal_of(&self, host: &str) -> Option<u32> {
        self.nodes
            .iter()
            .find(|n| n.hostname == host)
            .map(|n| n.ordinal)
    }

    fn role_of(&self, ordinal: u32) -> Option<MasterRole> {
        if self.master == Some(ordinal) {
            Some(MasterRole::Master)
        } else if self.vice == Some(ordinal) {
            Some(MasterRole::Vice)
        } else {
            None
        }
    }

    /// Record an unacknowledged failover of `ordinal`'s role, if it holds one.
    fn check_ack(&mut self, ordinal: u32) {
        let Some(role) = self.role_of(ordinal) else {
            return;
        };
        if !self.acks.remove(&role) {
            self.anomalies
                .push(format!("unacknowledged {role} failover of node {ordinal}"));
        }
    }

    fn next_candidate(&self, exclude: &[Option<u32>]) -> Option<u32> {
        self.nodes
            .iter()
            .filter(|n| n.serving() && !n.spare && !exclude.contains(&Some(n.ordinal)))
            .map(|n| n.ordinal)
            .next()
    }

    /// Move roles off nodes that are no longer serving.
    fn reassign_roles(&mut self) {
        let master_ok = self
            .master
            .and_then(|m| self.node_by_ordinal(m))
            .is_some_and(|n| n.serving());
        if !master_ok {
            let vice_ok = self
                .vice
                .and_then(|v| self.node_by_ordinal(v))
                .is_some_and(|n| n.serving());
            self.master = if vice_ok {
                self.vice.take()
            } else {
                self.next_candidate(&[])
            };
        }
        let vice_ok = self
            .vice
            .and_then(|v| self.node_by_ordinal(v))
            .is_some_and(|n| n.serving());
        if !vice_ok || self.vice == self.master {
            self.vice = self.next_candidate(&[self.master]);
        }
    }

    fn settle(&mut self) {
        let pair_hit = self.touched.iter().any(|ordinal| {
            self.node_by_ordinal(*ordinal)
                .and_then(|n| n.mirror)
                .is_some_and(|m| self.touched.contains(&m))
        });
        self.touched.clear();
        if pair_hit {
            self.wipe_pending = true;
        }
        if self.wipe_pending {
            self.wipe_pending = false;
            self.generation += 1;
            debug!(generation = self.generation, "sim: database reinitialized");
            for node in &mut self.nodes {
                node.in_domain = node.services && !node.offline;
                if node.in_domain {
                    node.enabled = true;
                    node.running = true;
                } else {
                    node.go_down();
                }
            }
            self.master = None;
            self.vice = None;
            self.acks.clear();
        }
        self.reassign_roles();
    }

    fn status_line(&mut self, levels: &StatusLevels) -> String {
        if let Some(s) = &self.status_override {
            return s.clone();
        }
        if self.booting_polls > 0 {
            self.booting_polls -= 1;
            return "Database status: Starting".to_string();
        }
        if self.master.is_none() {
            return "Database status: NonOperational".to_string();
        }
        let down: Vec<&SimNode> = self
            .nodes
            .iter()
            .filter(|n| n.in_domain && !n.spare && !n.serving())
            .collect();
        let pair_down = down.iter().any(|n| {
            n.mirror
                .is_some_and(|m| down.iter().any(|other| other.ordinal == m))
        });
        let level = if pair_down {
            "NonFaultTolerant"
        } else if down.is_empty() {
            levels.stronger.as_str()
        } else if down.len() == 2 || self.nodes.len() <= SMALL_CLUSTER_NODES {
            levels.weaker.as_str()
        } else {
            levels.stronger.as_str()
        };
        format!("Database status: {level}")
    }
}

#[derive(Debug, Clone)]
struct StatusLevels {
    weaker: String,
    stronger: String,
}

/// A simulated cluster implementing every collaborator trait.
pub struct SimCluster {
    commands: CommandSet,
    levels: StatusLevels,
    state: Mutex<SimState>,
}

impl SimCluster {
    pub fn new(topology: SimTopology, commands: CommandSet) -> Arc<Self> {
        Self::with_levels(topology, commands, "FaultTolerant", "HAFaultTolerant")
    }

    /// Build a cluster whose status output uses custom fault-tolerance level
    /// strings.
    pub fn with_levels(
        topology: SimTopology,
        commands: CommandSet,
        weaker: impl Into<String>,
        stronger: impl Into<String>,
    ) -> Arc<Self> {
        let active = topology.nodes.saturating_sub(topology.spares);
        let half = active / 2;
        let nodes = (1..=topology.nodes)
            .map(|ordinal| {
                let spare = ordinal > active;
                let mirror = if spare || half == 0 {
                    None
                } else if ordinal <= half {
                    Some(ordinal + half)
                } else if ordinal <= 2 * half {
                    Some(ordinal - half)
                } else {
                    None
                };
                SimNode {
                    ordinal,
                    hostname: format!("node{ordinal:02}"),
                    spare,
                    mirror,
                    services: true,
                    maintenance: false,
                    offline: false,
                    in_domain: true,
                    enabled: true,
                    running: true,
                    unreachable: false,
                    reachable_at: None,
                }
            })
            .collect();
        let mut state = SimState {
            nodes,
            master: None,
            vice: None,
            generation: 1,
            wipe_pending: false,
            touched: BTreeSet::new(),
            acks: HashSet::new(),
            anomalies: Vec::new(),
            commands: Vec::new(),
            booting_polls: 0,
            boot_polls_after_op: 1,
            status_override: None,
        };
        state.reassign_roles();
        Arc::new(Self {
            commands,
            levels: StatusLevels {
                weaker: weaker.into(),
                stronger: stronger.into(),
            },
            state: Mutex::new(state),
        })
    }

    pub fn admin_host(&self) -> &str {
        ADMIN_HOST
    }

    /// Take `host` off the network, which also takes it out of service.
    /// Clearing the flag brings it back up.
    pub async fn set_unreachable(&self, host: &str, unreachable: bool) {
        let mut state = self.state.lock().await;
        if let Some(node) = state.node_mut(host) {
            node.unreachable = unreachable;
            node.reachable_at = None;
            if unreachable {
                node.crash();
            } else {
                node.come_up();
            }
        }
    }

    /// Take `host` off the network for `outage`. It answers again afterwards
    /// but stays out of service until it is recovered.
    pub async fn set_unreachable_for(&self, host: &str, outage: Duration) {
        let mut state = self.state.lock().await;
        if let Some(node) = state.node_mut(host) {
            node.reachable_at = Some(Instant::now() + outage);
            node.crash();
        }
    }

    /// Pin the status output, e.g. to a cluster that never converges.
    pub async fn set_status_override(&self, status: Option<String>) {
        self.state.lock().await.status_override = status;
    }

    /// Number of status polls reporting "Starting" after each cluster operation.
    pub async fn set_boot_polls(&self, polls: u32) {
        self.state.lock().await.boot_polls_after_op = polls;
    }

    /// Reinitialize the database on the next query, as if it were wiped
    /// behind the engine's back.
    pub async fn force_wipe(&self) {
        self.state.lock().await.wipe_pending = true;
    }

    pub async fn generation(&self) -> u64 {
        self.state.lock().await.generation
    }

    /// Failovers that happened without a prior acknowledgment.
    pub async fn anomalies(&self) -> Vec<String> {
        self.state.lock().await.anomalies.clone()
    }

    /// Every `(host, command)` executed so far.
    pub async fn executed(&self) -> Vec<(String, String)> {
        self.state.lock().await.commands.clone()
    }

    pub async fn hostnames(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.nodes.iter().map(|n| n.hostname.clone()).collect()
    }

    fn apply_node_command(&self, state: &mut SimState, host: &str, command: &str) -> Option<ExecOutput> {
        let cmds = &self.commands;
        let ordinal = state.ordinal_of(host)?;
        if command == cmds.disable {
            state.check_ack(ordinal);
            let node = state.node_mut(host)?;
            node.maintenance = true;
            state.touched.insert(ordinal);
        } else if command == cmds.kill_soft || command == cmds.kill_hard {
            state.check_ack(ordinal);
            let node = state.node_mut(host)?;
            node.services = false;
            node.go_down();
            state.touched.insert(ordinal);
        } else if command == cmds.reboot {
            let node = state.node_mut(host)?;
            node.maintenance = false;
            node.come_up();
            state.touched.insert(ordinal);
        } else if command == cmds.recover {
            let node = state.node_mut(host)?;
            node.maintenance = false;
            node.in_domain = true;
            node.come_up();
        } else if command == cmds.device_size {
            return Some(ExecOutput::ok(DEVICE_SIZE_KB));
        } else {
            return None;
        }
        Some(ExecOutput::ok(""))
    }

    fn apply_admin_command(&self, state: &mut SimState, command: &str) -> Option<ExecOutput> {
        let cmds = &self.commands;
        if command == cmds.cluster_reboot || command == cmds.cluster_hard_reboot {
            for node in &mut state.nodes {
                if !node.services {
                    continue;
                }
                if node.maintenance {
                    node.offline = true;
                    node.go_down();
                } else {
                    node.come_up();
                }
            }
            if command == cmds.cluster_hard_reboot {
                state.wipe_pending = true;
            }
            state.booting_polls = state.boot_polls_after_op;
        } else if command == cmds.extend {
            state.wipe_pending = true;
            state.booting_polls = state.boot_polls_after_op;
        } else if command == cmds.extend_integrate {
            for node in &mut state.nodes {
                node.maintenance = false;
                node.in_domain = true;
                node.come_up();
            }
        } else if command == cmds.failover_ack_for(MasterRole::Master) {
            state.acks.insert(MasterRole::Master);
        } else if command == cmds.failover_ack_for(MasterRole::Vice) {
            state.acks.insert(MasterRole::Vice);
        } else {
            return None;
        }
        Some(ExecOutput::ok(""))
    }
}

#[async_trait]
impl RemoteExec for SimCluster {
    async fn exec(
        &self,
        host: &str,
        command: &str,
        _timeout: Duration,
    ) -> Result<ExecOutput, RemoteError> {
        let mut state = self.state.lock().await;
        if state.nodes.iter().any(|n| n.hostname == host && n.is_unreachable()) {
            return Err(RemoteError::Unreachable {
                host: host.to_string(),
            });
        }
        state.commands.push((host.to_string(), command.to_string()));

        let handled = if host == ADMIN_HOST {
            self.apply_admin_command(&mut state, command)
        } else {
            self.apply_node_command(&mut state, host, command)
        };
        Ok(handled.unwrap_or_else(|| ExecOutput {
            exit_code: 127,
            stdout: String::new(),
            stderr: format!("{command}: command not found"),
        }))
    }

    async fn ping(&self, host: &str) -> bool {
        let state = self.state.lock().await;
        state
            .nodes
            .iter()
            .any(|n| n.hostname == host && !n.is_unreachable())
    }
}

#[async_trait]
impl ClusterStatus for SimCluster {
    async fn status_text(&self) -> Result<String, BackendError> {
        let mut state = self.state.lock().await;
        state.settle();
        Ok(state.status_line(&self.levels))
    }
}

#[async_trait]
impl DomainMembership for SimCluster {
    async fn snapshot(&self) -> Result<MembershipSnapshot, BackendError> {
        let mut state = self.state.lock().await;
        state.settle();
        let nodes = state
            .nodes
            .iter()
            .map(|n| ClusterNode {
                ordinal: n.ordinal,
                hostname: n.hostname.clone(),
                pingable: !n.is_unreachable(),
                spare: n.spare,
                mirror: n.mirror,
                membership: n.in_domain.then(|| MembershipRecord {
                    enabled: n.enabled,
                    running: n.running,
                    is_master: state.master == Some(n.ordinal),
                    is_vice: state.vice == Some(n.ordinal),
                }),
            })
            .collect();
        Ok(MembershipSnapshot::new(nodes))
    }
}

#[async_trait]
impl StorageArtifact for SimCluster {
    async fn artifact_timestamp(&self) -> Result<String, BackendError> {
        let mut state = self.state.lock().await;
        state.settle();
        Ok(format!("generation-{}", state.generation))
    }
}
