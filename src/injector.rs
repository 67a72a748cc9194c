//! Applies node-level actions and cluster-level operations.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::backend::{ClusterBackends, RemoteExec};
use crate::cluster::{ClusterNode, ClusterOperation, KillMode, MasterRole, NodeAction, NodeRef};
use crate::error::{RemoteError, ScenarioError};
use crate::settings::CommandSet;

/// What happened when an action was applied to one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    /// `NodeAction::Nothing`
    Skipped,
    Applied,
    /// The node could not be reached; it is treated as already down
    AssumedDown(String),
}

/// Issues the remote commands that disrupt and recover the cluster.
pub struct FaultInjector {
    exec: Arc<dyn RemoteExec>,
    admin_host: String,
    commands: CommandSet,
    timeout: Duration,
}

/// The session to the host never completed. A local failure to start the
/// session says nothing about the host and is not one of these.
fn session_lost(err: &RemoteError) -> bool {
    matches!(err, RemoteError::Unreachable { .. } | RemoteError::Timeout { .. })
}

impl FaultInjector {
    pub fn new(backends: &ClusterBackends, commands: CommandSet, timeout: Duration) -> Self {
        Self {
            exec: backends.exec.clone(),
            admin_host: backends.admin_host.clone(),
            commands,
            timeout,
        }
    }

    /// The remote command for a node action, `None` for `Nothing`.
    pub fn node_command(&self, action: NodeAction, kill_mode: KillMode) -> Option<&str> {
        match (action, kill_mode) {
            (NodeAction::Nothing, _) => None,
            (NodeAction::Disable, _) => Some(&self.commands.disable),
            (NodeAction::Kill, KillMode::Soft) => Some(&self.commands.kill_soft),
            (NodeAction::Kill, KillMode::Hard) => Some(&self.commands.kill_hard),
            (NodeAction::Reboot, _) => Some(&self.commands.reboot),
        }
    }

    /// Tell the membership layer that `role` is about to fail over.
    pub async fn acknowledge_failover(&self, role: MasterRole) -> Result<(), RemoteError> {
        let command = self.commands.failover_ack_for(role);
        info!(%role, "acknowledging expected failover");
        self.exec
            .run(&self.admin_host, &command, self.timeout)
            .await
            .map(|_| ())
    }

    pub async fn apply_node_action(
        &self,
        node: &ClusterNode,
        action: NodeAction,
        kill_mode: KillMode,
    ) -> Result<ActionOutcome, ScenarioError> {
        let Some(command) = self.node_command(action, kill_mode) else {
            return Ok(ActionOutcome::Skipped);
        };

        if action.takes_node_down() {
            if let Some(role) = node.role() {
                self.acknowledge_failover(role).await?;
            }
        }

        info!(node = %node.hostname, %action, %kill_mode, "applying node action");
        match self.exec.run(&node.hostname, command, self.timeout).await {
            Ok(_) => Ok(ActionOutcome::Applied),
            Err(e) if session_lost(&e) && !self.exec.ping(&node.hostname).await => {
                warn!(node = %node.hostname, %action, error = %e, "node unreachable; treating it as already down");
                Ok(ActionOutcome::AssumedDown(e.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Apply `action` to every node concurrently and wait for all of them.
    ///
    /// All actions run to completion even if one fails; the first error is
    /// returned afterwards.
    pub async fn apply_node_actions(
        &self,
        nodes: &[ClusterNode],
        action: NodeAction,
        kill_mode: KillMode,
    ) -> Result<Vec<(NodeRef, ActionOutcome)>, ScenarioError> {
        let results = join_all(
            nodes
                .iter()
                .map(|node| self.apply_node_action(node, action, kill_mode)),
        )
        .await;

        let mut outcomes = Vec::with_capacity(nodes.len());
        let mut first_err = None;
        for (node, res) in nodes.iter().zip(results) {
            match res {
                Ok(outcome) => outcomes.push((node.node_ref(), outcome)),
                Err(e) => {
                    warn!(node = %node.hostname, error = %e, "node action failed");
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(outcomes),
        }
    }

    pub async fn apply_cluster_operation(&self, op: ClusterOperation) -> Result<(), ScenarioError> {
        let command = match op {
            ClusterOperation::Nothing => return Ok(()),
            ClusterOperation::Reboot => &self.commands.cluster_reboot,
            ClusterOperation::HardReboot => &self.commands.cluster_hard_reboot,
            ClusterOperation::Extend => &self.commands.extend,
        };
        info!(%op, host = %self.admin_host, "applying cluster operation");
        match self.exec.run(&self.admin_host, command, self.timeout).await {
            Ok(_) => Ok(()),
            // the admin session goes down with the cluster
            Err(e) if op.is_reboot() && session_lost(&e) => {
                warn!(%op, error = %e, "admin session dropped during cluster reboot");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Bring a node back: clear maintenance mode, restart services, rejoin the
    /// domain. A no-op on a healthy node.
    pub async fn recover_node(&self, node: &NodeRef) -> Result<(), RemoteError> {
        info!(node = %node.hostname, "recovering node");
        self.exec
            .run(&node.hostname, &self.commands.recover, self.timeout)
            .await
            .map(|_| ())
    }

    /// Recover every node concurrently, returning the nodes that failed.
    pub async fn recover_nodes(&self, nodes: &[NodeRef]) -> Vec<(NodeRef, RemoteError)> {
        let results = join_all(nodes.iter().map(|n| self.recover_node(n))).await;
        nodes
            .iter()
            .zip(results)
            .filter_map(|(node, res)| res.err().map(|e| (node.clone(), e)))
            .collect()
    }

    /// Second phase of an extend: integrate the new topology and bring every
    /// node back into the domain.
    pub async fn integrate_extend(&self) -> Result<(), ScenarioError> {
        info!(host = %self.admin_host, "integrating extended topology");
        self.exec
            .run(&self.admin_host, &self.commands.extend_integrate, self.timeout)
            .await?;
        Ok(())
    }
}
