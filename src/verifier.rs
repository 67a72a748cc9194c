//! Checks acted-upon nodes against the expected-state table, and waits for
//! the domain-wide disabled/missing counts to settle.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::backend::DomainMembership;
use crate::cluster::{MembershipRecord, MembershipSnapshot, NodeRef};
use crate::error::{BackendError, Mismatch, ScenarioError};
use crate::expected::ExpectedState;
use crate::poll::Poll;

/// Compare one membership record against its prediction.
///
/// An absent node only has its absence checked; no other field applies.
pub fn compare(
    node: &NodeRef,
    record: Option<MembershipRecord>,
    expected: &ExpectedState,
) -> Vec<Mismatch> {
    let mismatch = |field, expected, actual| Mismatch {
        node: node.clone(),
        field,
        expected,
        actual,
    };

    let Some(record) = record else {
        if expected.present_in_domain {
            return vec![mismatch("presence", true, false)];
        }
        return Vec::new();
    };
    if !expected.present_in_domain {
        return vec![mismatch("presence", false, true)];
    }

    let mut out = Vec::new();
    if let Some(enabled) = expected.enabled {
        if record.enabled != enabled {
            out.push(mismatch("enabled", enabled, record.enabled));
        }
    }
    if let Some(running) = expected.running {
        if record.running != running {
            out.push(mismatch("running", running, record.running));
        }
    }
    out
}

/// Domain-wide counts expected after an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct DomainCounts {
    pub disabled: usize,
    pub missing: usize,
}

impl DomainCounts {
    pub fn of(snapshot: &MembershipSnapshot) -> Self {
        Self {
            disabled: snapshot.disabled_count(),
            missing: snapshot.missing_count(),
        }
    }
}

impl std::fmt::Display for DomainCounts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} disabled, {} missing", self.disabled, self.missing)
    }
}

pub struct NodeStateVerifier {
    membership: Arc<dyn DomainMembership>,
}

impl NodeStateVerifier {
    pub fn new(membership: Arc<dyn DomainMembership>) -> Self {
        Self { membership }
    }

    /// Fetch the node's current record and list every diverging field.
    pub async fn mismatches(
        &self,
        node: &NodeRef,
        expected: &ExpectedState,
    ) -> Result<Vec<Mismatch>, BackendError> {
        let record = self.membership.membership(&node.hostname).await?;
        let found = compare(node, record, expected);
        for m in &found {
            warn!(node = %node.hostname, field = m.field, expected = m.expected, actual = m.actual, "membership mismatch");
        }
        Ok(found)
    }

    pub async fn verify(&self, node: &NodeRef, expected: &ExpectedState) -> Result<bool, BackendError> {
        Ok(self.mismatches(node, expected).await?.is_empty())
    }

    /// Verify every node, failing with all mismatches found.
    pub async fn verify_all(
        &self,
        nodes: &[NodeRef],
        expected: &ExpectedState,
    ) -> Result<(), ScenarioError> {
        let mut all = Vec::new();
        for node in nodes {
            all.extend(self.mismatches(node, expected).await?);
        }
        if all.is_empty() {
            info!(nodes = nodes.len(), %expected, "node membership verified");
            Ok(())
        } else {
            Err(ScenarioError::VerificationMismatch(all))
        }
    }

    /// Check that every active node outside `acting` is a healthy member.
    pub async fn verify_bystanders(&self, acting: &[NodeRef]) -> Result<(), ScenarioError> {
        let snapshot = self.membership.snapshot().await?;
        let mut all = Vec::new();
        for node in snapshot
            .nodes
            .iter()
            .filter(|n| !n.spare && !acting.iter().any(|a| a.ordinal == n.ordinal))
        {
            let found = compare(&node.node_ref(), node.membership, &ExpectedState::HEALTHY);
            for m in &found {
                warn!(node = %node.hostname, field = m.field, expected = m.expected, actual = m.actual, "bystander membership mismatch");
            }
            all.extend(found);
        }
        if all.is_empty() {
            debug!("bystander nodes verified");
            Ok(())
        } else {
            Err(ScenarioError::VerificationMismatch(all))
        }
    }

    /// Re-poll the domain until it has a master and reports exactly the
    /// expected disabled and missing counts.
    pub async fn await_domain_counts(
        &self,
        expected: DomainCounts,
        timeout: Duration,
        interval: Duration,
    ) -> Result<MembershipSnapshot, ScenarioError> {
        info!(%expected, ?timeout, "waiting for domain membership to settle");
        let res = Poll::new(timeout, interval)
            .until(|attempt| async move {
                let snapshot = match self.membership.snapshot().await {
                    Ok(s) => s,
                    Err(e) => {
                        debug!(error = %e, attempt, "membership query failed");
                        return None;
                    }
                };
                let actual = DomainCounts::of(&snapshot);
                let has_master = snapshot.has_master();
                debug!(attempt, %actual, has_master, "domain counts");
                (has_master && actual == expected).then_some(snapshot)
            })
            .await;
        res.map_err(|t| ScenarioError::ConvergenceTimeout {
            what: format!("domain membership ({expected})"),
            after: t.elapsed,
        })
    }
}
