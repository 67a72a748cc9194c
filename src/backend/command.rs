//! Cluster queries answered by running admin commands on the admin host.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{ClusterStatus, DomainMembership, RemoteExec, StorageArtifact};
use crate::cluster::{ClusterNode, MembershipSnapshot};
use crate::error::BackendError;
use crate::settings::CommandSet;

/// Implements the query collaborators on top of a [`RemoteExec`].
///
/// The membership command must print a JSON array of node records.
pub struct CommandCluster {
    exec: Arc<dyn RemoteExec>,
    admin_host: String,
    commands: CommandSet,
    timeout: Duration,
}

impl CommandCluster {
    pub fn new(
        exec: Arc<dyn RemoteExec>,
        admin_host: impl Into<String>,
        commands: CommandSet,
        timeout: Duration,
    ) -> Self {
        Self {
            exec,
            admin_host: admin_host.into(),
            commands,
            timeout,
        }
    }

    async fn run_admin(&self, command: &str) -> Result<String, BackendError> {
        Ok(self.exec.run(&self.admin_host, command, self.timeout).await?)
    }
}

/// Parse the membership command's JSON output.
pub fn parse_membership(output: &str) -> Result<MembershipSnapshot, BackendError> {
    let nodes: Vec<ClusterNode> =
        serde_json::from_str(output.trim()).map_err(|e| BackendError::Parse {
            what: "membership",
            message: e.to_string(),
        })?;
    Ok(MembershipSnapshot::new(nodes))
}

#[async_trait]
impl ClusterStatus for CommandCluster {
    async fn status_text(&self) -> Result<String, BackendError> {
        self.run_admin(&self.commands.status).await
    }
}

#[async_trait]
impl DomainMembership for CommandCluster {
    async fn snapshot(&self) -> Result<MembershipSnapshot, BackendError> {
        let out = self.run_admin(&self.commands.membership).await?;
        parse_membership(&out)
    }
}

#[async_trait]
impl StorageArtifact for CommandCluster {
    async fn artifact_timestamp(&self) -> Result<String, BackendError> {
        let out = self.run_admin(&self.commands.artifact).await?;
        let marker = out.trim();
        if marker.is_empty() {
            return Err(BackendError::Parse {
                what: "storage artifact",
                message: "empty output".to_string(),
            });
        }
        Ok(marker.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_membership_json() {
        let out = r#"[
            {"ordinal": 1, "hostname": "node01", "pingable": true, "mirror": 2,
             "membership": {"enabled": true, "running": true, "is_master": true}},
            {"ordinal": 2, "hostname": "node02", "mirror": 1, "membership": null}
        ]"#;
        let snap = parse_membership(out).unwrap();
        assert_eq!(snap.total_nodes(), 2);
        assert_eq!(snap.master().map(|n| n.ordinal), Some(1));
        assert_eq!(snap.missing_count(), 1);
        assert!(!snap.nodes[1].pingable);
    }

    #[test]
    fn rejects_garbage_membership() {
        let err = parse_membership("Domain: ok").unwrap_err();
        assert!(matches!(err, BackendError::Parse { what: "membership", .. }));
    }
}
