//! Remote execution through the system `ssh` client.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::backend::{ExecOutput, RemoteExec};
use crate::error::RemoteError;

/// Exit status `ssh` reports when it could not establish the session.
const SSH_CONNECT_FAILURE: i32 = 255;

/// Runs commands with `ssh [options] [user@]host command`.
///
/// Each call opens and closes its own session; nothing is held between calls.
#[derive(Debug, Clone, Default)]
pub struct SshExec {
    user: Option<String>,
    options: Vec<String>,
}

impl SshExec {
    pub fn new(user: Option<String>, options: Vec<String>) -> Self {
        Self { user, options }
    }

    fn target(&self, host: &str) -> String {
        match &self.user {
            Some(user) => format!("{user}@{host}"),
            None => host.to_string(),
        }
    }
}

#[async_trait]
impl RemoteExec for SshExec {
    async fn exec(
        &self,
        host: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecOutput, RemoteError> {
        debug!(host, command, "ssh exec");
        let child = Command::new("ssh")
            .args(&self.options)
            .arg(self.target(host))
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RemoteError::Spawn {
                host: host.to_string(),
                message: e.to_string(),
            })?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(RemoteError::Spawn {
                    host: host.to_string(),
                    message: e.to_string(),
                });
            }
            Err(_) => {
                return Err(RemoteError::Timeout {
                    host: host.to_string(),
                    after: timeout,
                });
            }
        };

        // Killed by a signal reports no code; treat it like a failed session.
        let exit_code = output.status.code().unwrap_or(SSH_CONNECT_FAILURE);
        if exit_code == SSH_CONNECT_FAILURE {
            return Err(RemoteError::Unreachable {
                host: host.to_string(),
            });
        }
        Ok(ExecOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn ping(&self, host: &str) -> bool {
        Command::new("ping")
            .args(["-c", "1", "-W", "2", host])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }
}
