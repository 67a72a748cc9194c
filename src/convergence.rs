//! Waits for the replicated database to reach a fault-tolerant quorum state.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::backend::{ClusterBackends, ClusterStatus, RemoteExec};
use crate::cluster::FaultToleranceLevel;
use crate::poll::Poll;

/// Clusters this small can only ever reach the weaker level with a node down.
pub const SMALL_CLUSTER_NODES: usize = 8;

/// The level a degraded cluster can be expected to reach.
///
/// The weaker level when exactly two nodes were disabled or killed, or the
/// cluster has at most [`SMALL_CLUSTER_NODES`] nodes; otherwise the stronger.
pub fn target_level(down_nodes: usize, total_nodes: usize) -> FaultToleranceLevel {
    if down_nodes == 2 || total_nodes <= SMALL_CLUSTER_NODES {
        FaultToleranceLevel::Weaker
    } else {
        FaultToleranceLevel::Stronger
    }
}

/// The status strings of the two fault-tolerance levels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelStrings {
    pub weaker: String,
    pub stronger: String,
}

impl LevelStrings {
    pub fn new(weaker: impl Into<String>, stronger: impl Into<String>) -> Self {
        Self {
            weaker: weaker.into(),
            stronger: stronger.into(),
        }
    }

    pub fn for_level(&self, level: FaultToleranceLevel) -> &str {
        match level {
            FaultToleranceLevel::Weaker => &self.weaker,
            FaultToleranceLevel::Stronger => &self.stronger,
        }
    }

    /// The strongest level named in `status`, matched on whole words so that
    /// e.g. "NonFaultTolerant" is not read as "FaultTolerant".
    pub fn observed(&self, status: &str) -> Option<FaultToleranceLevel> {
        let mut seen = None;
        for word in status.split(|c: char| !(c.is_alphanumeric() || c == '_' || c == '-')) {
            if word == self.stronger {
                return Some(FaultToleranceLevel::Stronger);
            }
            if word == self.weaker {
                seen = Some(FaultToleranceLevel::Weaker);
            }
        }
        seen
    }

    /// Whether `status` shows `target` or better.
    pub fn satisfies(&self, status: &str, target: FaultToleranceLevel) -> bool {
        self.observed(status).is_some_and(|level| level >= target)
    }
}

/// Auxiliary per-node diagnostics logged on every poll.
#[derive(Debug, Clone)]
pub struct Diagnostics {
    pub hosts: Vec<String>,
    pub device_size_command: String,
    pub remote_timeout: Duration,
}

pub struct ConvergencePoller {
    status: Arc<dyn ClusterStatus>,
    exec: Arc<dyn RemoteExec>,
    levels: LevelStrings,
    diagnostics: Option<Diagnostics>,
}

impl ConvergencePoller {
    pub fn new(
        backends: &ClusterBackends,
        levels: LevelStrings,
        diagnostics: Option<Diagnostics>,
    ) -> Self {
        Self {
            status: backends.status.clone(),
            exec: backends.exec.clone(),
            levels,
            diagnostics,
        }
    }

    /// Replace the per-node diagnostics, e.g. once the host list is known.
    pub fn set_diagnostics(&mut self, diagnostics: Option<Diagnostics>) {
        self.diagnostics = diagnostics;
    }

    pub fn levels(&self) -> &LevelStrings {
        &self.levels
    }

    /// Current status text, or `None` if the status query failed (expected
    /// while the cluster reboots).
    pub async fn current_status(&self) -> Option<String> {
        match self.status.status_text().await {
            Ok(text) => Some(text),
            Err(e) => {
                debug!(error = %e, "status query failed");
                None
            }
        }
    }

    /// Poll the cluster status until it shows `target` (or better), or
    /// `timeout` elapses. Returns whether the target was observed.
    pub async fn await_state(
        &self,
        target: FaultToleranceLevel,
        timeout: Duration,
        interval: Duration,
    ) -> bool {
        let wanted = self.levels.for_level(target);
        info!(%target, wanted, ?timeout, "waiting for database quorum");
        let res = Poll::new(timeout, interval)
            .until(|attempt| async move {
                self.log_diagnostics().await;
                let status = self.current_status().await?;
                let ok = self.levels.satisfies(&status, target);
                debug!(attempt, status = status.trim(), ok, "database status");
                ok.then_some(())
            })
            .await;
        match res {
            Ok(()) => {
                info!(%target, "database reached target state");
                true
            }
            Err(t) => {
                warn!(%target, polls = t.polls, elapsed = ?t.elapsed, "database did not reach target state");
                false
            }
        }
    }

    async fn log_diagnostics(&self) {
        let Some(diag) = &self.diagnostics else {
            return;
        };
        let probes = diag.hosts.iter().map(|host| async move {
            let reachable = self.exec.ping(host).await;
            let size = if reachable {
                self.exec
                    .run(host, &diag.device_size_command, diag.remote_timeout)
                    .await
                    .map(|s| s.trim().to_string())
                    .ok()
            } else {
                None
            };
            (host, reachable, size)
        });
        for (host, reachable, size) in join_all(probes).await {
            debug!(node = %host, reachable, device_size = size.as_deref().unwrap_or("-"), "node diagnostics");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_level_table() {
        assert_eq!(target_level(2, 16), FaultToleranceLevel::Weaker);
        assert_eq!(target_level(1, 16), FaultToleranceLevel::Stronger);
        assert_eq!(target_level(3, 16), FaultToleranceLevel::Stronger);
        assert_eq!(target_level(0, 16), FaultToleranceLevel::Stronger);
        assert_eq!(target_level(1, 8), FaultToleranceLevel::Weaker);
        assert_eq!(target_level(0, 4), FaultToleranceLevel::Weaker);
        assert_eq!(target_level(2, 9), FaultToleranceLevel::Weaker);
        assert_eq!(target_level(4, 9), FaultToleranceLevel::Stronger);
    }

    #[test]
    fn level_matching_is_word_based() {
        let levels = LevelStrings::new("FaultTolerant", "HAFaultTolerant");
        assert_eq!(
            levels.observed("Database status: HAFaultTolerant"),
            Some(FaultToleranceLevel::Stronger)
        );
        assert_eq!(
            levels.observed("Database status: FaultTolerant\n"),
            Some(FaultToleranceLevel::Weaker)
        );
        assert_eq!(levels.observed("Database status: NonFaultTolerant"), None);
        assert_eq!(levels.observed(""), None);
    }

    #[test]
    fn stronger_satisfies_weaker_but_not_the_reverse() {
        let levels = LevelStrings::new("FaultTolerant", "HAFaultTolerant");
        assert!(levels.satisfies("HAFaultTolerant", FaultToleranceLevel::Weaker));
        assert!(levels.satisfies("HAFaultTolerant", FaultToleranceLevel::Stronger));
        assert!(levels.satisfies("FaultTolerant", FaultToleranceLevel::Weaker));
        assert!(!levels.satisfies("FaultTolerant", FaultToleranceLevel::Stronger));
    }
}
