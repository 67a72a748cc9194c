//! The expected-state oracle: what a node's membership must look like after
//! a given node action and cluster operation, and how many nodes the domain
//! should report as disabled or missing.
//!
//! Everything here is a pure function of configuration. Nothing depends on
//! time, retries, or observed cluster state beyond whether a wipe occurred.

use serde::Serialize;

use crate::cluster::{ClusterOperation, NodeAction};

/// Expected membership of an acted-upon node. `None` fields are not checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExpectedState {
    pub present_in_domain: bool,
    pub enabled: Option<bool>,
    pub running: Option<bool>,
}

impl ExpectedState {
    /// Present, enabled, running.
    pub const HEALTHY: ExpectedState = ExpectedState {
        present_in_domain: true,
        enabled: Some(true),
        running: Some(true),
    };

    /// Absent from the domain; no other field applies.
    pub const ABSENT: ExpectedState = ExpectedState {
        present_in_domain: false,
        enabled: None,
        running: None,
    };
}

impl std::fmt::Display for ExpectedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.present_in_domain {
            return write!(f, "absent");
        }
        write!(f, "present")?;
        if let Some(enabled) = self.enabled {
            write!(f, ", {}", if enabled { "enabled" } else { "not enabled" })?;
        }
        if let Some(running) = self.running {
            write!(f, ", {}", if running { "running" } else { "not running" })?;
        }
        Ok(())
    }
}

/// Whether the run should observe a database wipe.
///
/// True for a hard reboot or an extend, or when mirror pairs are being
/// selected, more than one node is acted on, and the action is not `Nothing`.
pub fn wipe_expected(
    action: NodeAction,
    op: ClusterOperation,
    allow_mirrors: bool,
    acting_nodes: usize,
) -> bool {
    match op {
        ClusterOperation::HardReboot | ClusterOperation::Extend => true,
        ClusterOperation::Nothing | ClusterOperation::Reboot => {
            allow_mirrors && acting_nodes > 1 && action != NodeAction::Nothing
        }
    }
}

/// Expected membership of a node that received `action` before `op`.
pub fn expect(action: NodeAction, op: ClusterOperation, wiped: bool) -> ExpectedState {
    match action {
        NodeAction::Nothing | NodeAction::Reboot => ExpectedState::HEALTHY,
        NodeAction::Kill if wiped => ExpectedState::ABSENT,
        NodeAction::Kill => ExpectedState {
            present_in_domain: true,
            enabled: Some(false),
            running: Some(false),
        },
        // a disable only lands at the node's next reboot
        NodeAction::Disable if op.is_reboot() => {
            if wiped {
                ExpectedState::ABSENT
            } else {
                ExpectedState {
                    present_in_domain: true,
                    enabled: Some(false),
                    running: None,
                }
            }
        }
        NodeAction::Disable => ExpectedState::HEALTHY,
    }
}

fn disable_landed(action: NodeAction, op: ClusterOperation) -> bool {
    action == NodeAction::Kill || (action == NodeAction::Disable && op.is_reboot())
}

/// Nodes the domain should report as present but disabled.
pub fn expected_disabled_count(
    action: NodeAction,
    op: ClusterOperation,
    wiped: bool,
    selected: usize,
) -> usize {
    if !wiped && disable_landed(action, op) {
        selected
    } else {
        0
    }
}

/// Nodes the domain should report as missing.
pub fn expected_missing_count(
    action: NodeAction,
    op: ClusterOperation,
    wiped: bool,
    selected: usize,
) -> usize {
    if wiped && disable_landed(action, op) {
        selected
    } else {
        0
    }
}
