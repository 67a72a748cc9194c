//! Detects whether the database was reinitialized rather than restarted.
//!
//! A wipe shows up as a change in the storage artifact marker (for instance
//! the modification stamp of the database log directory) relative to a
//! baseline captured before any action was applied.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::backend::StorageArtifact;
use crate::error::{BackendError, ScenarioError};
use crate::poll::Poll;

/// Artifact marker captured before an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WipeBaseline(pub String);

pub struct WipeDetector {
    artifact: Arc<dyn StorageArtifact>,
    interval: Duration,
}

impl WipeDetector {
    pub fn new(artifact: Arc<dyn StorageArtifact>, interval: Duration) -> Self {
        Self { artifact, interval }
    }

    pub async fn baseline(&self) -> Result<WipeBaseline, BackendError> {
        let marker = self.artifact.artifact_timestamp().await?;
        debug!(marker = %marker, "captured storage baseline");
        Ok(WipeBaseline(marker))
    }

    /// Whether the artifact changed from `baseline` within `timeout`.
    ///
    /// A read failure counts as "not changed yet"; without a wipe this waits
    /// out the whole window.
    pub async fn occurred_since(&self, baseline: &WipeBaseline, timeout: Duration) -> bool {
        let res = Poll::new(timeout, self.interval)
            .until(|attempt| async move {
                match self.artifact.artifact_timestamp().await {
                    Ok(marker) if marker != baseline.0 => {
                        info!(before = %baseline.0, after = %marker, attempt, "storage artifact changed");
                        Some(())
                    }
                    Ok(_) => None,
                    Err(e) => {
                        debug!(error = %e, attempt, "storage artifact unavailable");
                        None
                    }
                }
            })
            .await;
        res.is_ok()
    }

    /// Observe whether a wipe happened and fail if that disagrees with
    /// `expected`. Returns the observation.
    pub async fn check(
        &self,
        baseline: &WipeBaseline,
        expected: bool,
        timeout: Duration,
    ) -> Result<bool, ScenarioError> {
        let observed = self.occurred_since(baseline, timeout).await;
        if observed != expected {
            warn!(expected, observed, "wipe expectation violated");
            return Err(ScenarioError::WipeMismatch { expected, observed });
        }
        info!(wiped = observed, "wipe check passed");
        Ok(observed)
    }
}
