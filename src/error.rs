//! Error taxonomy for a fault-injection run and its mapping onto process
//! exit codes.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use thiserror::Error;

use crate::cluster::NodeRef;

/// Exit code for a run where every iteration converged and verified.
pub const EXIT_SUCCESS: u8 = 0;
/// Exit code for a run stopped by a failed check.
pub const EXIT_FAILURE: u8 = 1;
/// Exit code for invalid configuration or an unexpected error.
pub const EXIT_ERROR: u8 = 2;

/// Invalid configuration, detected before any cluster-affecting action.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("iteration count must be greater than zero")]
    ZeroIterations,

    #[error("node count must be greater than zero")]
    ZeroNodeCount,

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("fault-tolerance level strings must be non-empty")]
    EmptyLevelString,

    #[error("roll mode cannot be combined with the extend operation")]
    RollWithExtend,

    #[error("the command backend requires [cluster].admin_host")]
    MissingAdminHost,

    #[error("requested {requested} nodes but only {eligible} are eligible for selection")]
    NotEnoughNodes { requested: usize, eligible: usize },

    #[error("log directory {path} is not usable: {source}")]
    LogDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cluster is not quorate before the run: status was {0:?}")]
    NotQuorate(String),

    #[error("cluster has no master; cannot follow it")]
    NoMaster,

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Failure to run a command on a remote node.
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    #[error("host {host} is unreachable")]
    Unreachable { host: String },

    #[error("command on {host} timed out after {after:?}")]
    Timeout { host: String, after: Duration },

    #[error("command {command:?} on {host} exited with {code}: {stderr}")]
    CommandFailed {
        host: String,
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("failed to spawn remote session to {host}: {message}")]
    Spawn { host: String, message: String },
}

impl RemoteError {
    pub fn host(&self) -> &str {
        match self {
            RemoteError::Unreachable { host }
            | RemoteError::Timeout { host, .. }
            | RemoteError::CommandFailed { host, .. }
            | RemoteError::Spawn { host, .. } => host,
        }
    }
}

/// Failure of one of the cluster collaborator services.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("unparseable {what} output: {message}")]
    Parse { what: &'static str, message: String },
}

/// A single field of a node's membership that diverged from its prediction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    pub node: NodeRef,
    pub field: &'static str,
    pub expected: bool,
    pub actual: bool,
}

impl std::fmt::Display for Mismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} expected {} but was {}",
            self.node, self.field, self.expected, self.actual
        )
    }
}

/// Reasons a run terminates before completing every iteration.
#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("{what} did not converge within {after:?}")]
    ConvergenceTimeout { what: String, after: Duration },

    #[error("verification failed: {}", format_mismatches(.0))]
    VerificationMismatch(Vec<Mismatch>),

    #[error("wipe expectation violated: expected wipe={expected}, observed wipe={observed}")]
    WipeMismatch { expected: bool, observed: bool },

    #[error("recovery failed: {0}")]
    RecoveryFailure(String),

    #[error("pre-iteration hook {script:?} failed: {message}")]
    Hook { script: String, message: String },

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn format_mismatches(mismatches: &[Mismatch]) -> String {
    mismatches
        .iter()
        .map(|m| m.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl ScenarioError {
    /// Whether the error is a failed check (as opposed to an error running it).
    pub fn is_check_failure(&self) -> bool {
        matches!(
            self,
            ScenarioError::ConvergenceTimeout { .. }
                | ScenarioError::VerificationMismatch(_)
                | ScenarioError::WipeMismatch { .. }
                | ScenarioError::RecoveryFailure(_)
        )
    }

    pub fn exit_code(&self) -> u8 {
        if self.is_check_failure() {
            EXIT_FAILURE
        } else {
            EXIT_ERROR
        }
    }
}

impl From<RemoteError> for ScenarioError {
    fn from(e: RemoteError) -> Self {
        ScenarioError::Backend(BackendError::Remote(e))
    }
}

/// Convert an optional terminal error into the process exit code.
pub fn exit_code_for(result: Option<&ScenarioError>) -> ExitCode {
    match result {
        None => ExitCode::from(EXIT_SUCCESS),
        Some(e) => ExitCode::from(e.exit_code()),
    }
}
