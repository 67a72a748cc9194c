//! Cluster data model shared by every stage of a fault-injection run.
//!
//! Records here are always re-fetched from the membership service before a
//! check; nothing in this module caches cluster state across polls.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Membership attributes of a node as recorded by the replicated database's
/// domain bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MembershipRecord {
    pub enabled: bool,
    pub running: bool,
    #[serde(default)]
    pub is_master: bool,
    #[serde(default)]
    pub is_vice: bool,
}

impl MembershipRecord {
    /// A healthy, non-master member.
    pub fn healthy() -> Self {
        Self {
            enabled: true,
            running: true,
            is_master: false,
            is_vice: false,
        }
    }
}

/// A configured cluster node together with its current liveness and domain
/// membership. `membership == None` means the node is absent from the domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterNode {
    /// 1-based ordinal
    pub ordinal: u32,
    pub hostname: String,
    #[serde(default)]
    pub pingable: bool,
    /// Standby member not counted in the active replica set
    #[serde(default)]
    pub spare: bool,
    /// Ordinal of the node holding the replica copies of this node's data
    #[serde(default)]
    pub mirror: Option<u32>,
    #[serde(default)]
    pub membership: Option<MembershipRecord>,
}

impl ClusterNode {
    pub fn node_ref(&self) -> NodeRef {
        NodeRef {
            ordinal: self.ordinal,
            hostname: self.hostname.clone(),
        }
    }

    pub fn is_present(&self) -> bool {
        self.membership.is_some()
    }

    pub fn is_master(&self) -> bool {
        self.membership.is_some_and(|m| m.is_master)
    }

    pub fn is_vice(&self) -> bool {
        self.membership.is_some_and(|m| m.is_vice)
    }

    /// Role this node currently holds, if any.
    pub fn role(&self) -> Option<MasterRole> {
        if self.is_master() {
            Some(MasterRole::Master)
        } else if self.is_vice() {
            Some(MasterRole::Vice)
        } else {
            None
        }
    }
}

/// Stable identity of a node, independent of its membership state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeRef {
    pub ordinal: u32,
    pub hostname: String,
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (#{})", self.hostname, self.ordinal)
    }
}

/// The full set of node records for one cluster, read at a single point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipSnapshot {
    pub nodes: Vec<ClusterNode>,
}

impl MembershipSnapshot {
    pub fn new(nodes: Vec<ClusterNode>) -> Self {
        Self { nodes }
    }

    pub fn total_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, ordinal: u32) -> Option<&ClusterNode> {
        self.nodes.iter().find(|n| n.ordinal == ordinal)
    }

    pub fn by_hostname(&self, hostname: &str) -> Option<&ClusterNode> {
        self.nodes.iter().find(|n| n.hostname == hostname)
    }

    pub fn master(&self) -> Option<&ClusterNode> {
        self.nodes.iter().find(|n| n.is_master())
    }

    pub fn vice(&self) -> Option<&ClusterNode> {
        self.nodes.iter().find(|n| n.is_vice())
    }

    /// Whether the domain currently has a master, i.e. is quorate.
    pub fn has_master(&self) -> bool {
        self.master().is_some()
    }

    /// Members present in the domain but not enabled.
    pub fn disabled_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.membership.is_some_and(|m| !m.enabled))
            .count()
    }

    /// Configured nodes absent from the domain.
    pub fn missing_count(&self) -> usize {
        self.nodes.iter().filter(|n| !n.is_present()).count()
    }
}

/// What to do to each selected node.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum NodeAction {
    #[default]
    Nothing,
    Disable,
    Kill,
    Reboot,
}

impl NodeAction {
    pub const ALL: [NodeAction; 4] = [
        NodeAction::Nothing,
        NodeAction::Disable,
        NodeAction::Kill,
        NodeAction::Reboot,
    ];

    /// Whether the action takes the node out of service until recovered.
    pub fn takes_node_down(self) -> bool {
        matches!(self, NodeAction::Disable | NodeAction::Kill)
    }
}

impl fmt::Display for NodeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeAction::Nothing => write!(f, "nothing"),
            NodeAction::Disable => write!(f, "disable"),
            NodeAction::Kill => write!(f, "kill"),
            NodeAction::Reboot => write!(f, "reboot"),
        }
    }
}

/// What to do to the cluster as a whole after the node actions.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum ClusterOperation {
    #[default]
    Nothing,
    Reboot,
    HardReboot,
    Extend,
}

impl ClusterOperation {
    pub const ALL: [ClusterOperation; 4] = [
        ClusterOperation::Nothing,
        ClusterOperation::Reboot,
        ClusterOperation::HardReboot,
        ClusterOperation::Extend,
    ];

    /// Reboot and HardReboot both restart every node in the cluster.
    pub fn is_reboot(self) -> bool {
        matches!(self, ClusterOperation::Reboot | ClusterOperation::HardReboot)
    }
}

impl fmt::Display for ClusterOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterOperation::Nothing => write!(f, "nothing"),
            ClusterOperation::Reboot => write!(f, "reboot"),
            ClusterOperation::HardReboot => write!(f, "hard-reboot"),
            ClusterOperation::Extend => write!(f, "extend"),
        }
    }
}

/// Refines [`NodeAction::Kill`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum KillMode {
    /// Terminate the managed service processes, leave the OS up
    #[default]
    Soft,
    /// Abrupt reboot bypassing graceful shutdown
    Hard,
}

impl fmt::Display for KillMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KillMode::Soft => write!(f, "soft"),
            KillMode::Hard => write!(f, "hard"),
        }
    }
}

/// Leadership roles in the domain that fail over when their holder goes down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MasterRole {
    Master,
    Vice,
}

impl fmt::Display for MasterRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MasterRole::Master => write!(f, "master"),
            MasterRole::Vice => write!(f, "vice"),
        }
    }
}

/// The two quorum strengths the cluster status distinguishes, ordered weakest
/// first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FaultToleranceLevel {
    Weaker,
    Stronger,
}

impl fmt::Display for FaultToleranceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultToleranceLevel::Weaker => write!(f, "weaker"),
            FaultToleranceLevel::Stronger => write!(f, "stronger"),
        }
    }
}
