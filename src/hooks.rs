//! Local scripts run before each iteration (e.g. to snapshot logs or arm an
//! external load generator).

use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::ScenarioError;

/// Run every script through `sh -c`, in order, stopping at the first failure.
///
/// Scripts see the iteration number in `FAULTLINE_ITERATION`.
pub async fn run_pre_iteration(
    scripts: &[String],
    iteration: u32,
    timeout: Duration,
) -> Result<(), ScenarioError> {
    for script in scripts {
        info!(script = %script, iteration, "running pre-iteration hook");
        let child = Command::new("sh")
            .arg("-c")
            .arg(script)
            .env("FAULTLINE_ITERATION", iteration.to_string())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(timeout, child).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ScenarioError::Hook {
                    script: script.clone(),
                    message: e.to_string(),
                });
            }
            Err(_) => {
                return Err(ScenarioError::Hook {
                    script: script.clone(),
                    message: format!("timed out after {timeout:?}"),
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            debug!(script = %script, output = %stdout.trim(), "hook output");
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ScenarioError::Hook {
                script: script.clone(),
                message: format!("{}: {}", output.status, stderr.trim()),
            });
        }
    }
    Ok(())
}
