use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::orchestrator::phase::Phase;
use crate::retry_policy::FailureKind;

/// Malformed inventory. Always raised before any remote command is issued.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("inventory entry #{entry}: missing required field `{field}`")]
    MissingField { entry: usize, field: &'static str },

    #[error("duplicate host `{hostname}` in inventory")]
    DuplicateHost { hostname: String },

    #[error("host `{hostname}`: invalid value `{value}` for `{field}`")]
    InvalidField {
        hostname: String,
        field: &'static str,
        value: String,
    },

    #[error("{format} syntax error: {message}")]
    Syntax {
        format: &'static str,
        message: String,
    },

    #[error("unsupported inventory format: {0}")]
    UnsupportedFormat(String),

    #[error("failed to read inventory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("failed to render yaml inventory: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("failed to render csv inventory: {0}")]
    Csv(#[from] csv::Error),

    #[error("rendered inventory is not valid utf-8")]
    Utf8,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssignmentError {
    #[error("{hosts} control-plane capable host(s) available, quorum needs {required}")]
    QuorumTooSmall { hosts: usize, required: usize },
}

/// Transport level failure for a single remote command. A command that ran and
/// exited non-zero is not an `ExecError`; it is an `ExecResult` with that exit code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("authentication failed: {0}")]
    AuthFailure(String),

    #[error("transport error: {0}")]
    Transport(String),
}

/// Why one host failed one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    Exec {
        transport: FailureKind,
        message: String,
    },
    NonZeroExit { code: i32, stderr: String },
    ConditionUnmet { message: String },
}

impl From<&ExecError> for FailureReason {
    fn from(err: &ExecError) -> Self {
        FailureReason::Exec {
            transport: FailureKind::of_exec_error(err),
            message: err.to_string(),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Exec { message, .. } => write!(f, "{message}"),
            FailureReason::NonZeroExit { code, stderr } if stderr.is_empty() => {
                write!(f, "exited with code {code}")
            }
            FailureReason::NonZeroExit { code, stderr } => {
                write!(f, "exited with code {code}: {stderr}")
            }
            FailureReason::ConditionUnmet { message } => write!(f, "{message}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostFailure {
    pub hostname: String,
    pub reason: FailureReason,
}

impl fmt::Display for HostFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.hostname, self.reason)
    }
}

/// All host failures of one phase.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("phase {phase} failed on {}", failed_hosts(.failures))]
pub struct PhaseError {
    pub phase: Phase,
    pub failures: Vec<HostFailure>,
}

impl PhaseError {
    pub fn single(phase: Phase, hostname: &str, reason: FailureReason) -> Self {
        Self {
            phase,
            failures: vec![HostFailure {
                hostname: hostname.to_string(),
                reason,
            }],
        }
    }

    pub fn hostnames(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.hostname.as_str()).collect()
    }
}

fn failed_hosts(failures: &[HostFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum ScalingError {
    #[error("entry point {host} is unreachable: {source}")]
    EntryPointUnreachable {
        host: String,
        #[source]
        source: ExecError,
    },

    #[error("host `{0}` is not in the inventory")]
    UnknownHost(String),

    #[error("host `{0}` is already a cluster member")]
    AlreadyMember(String),

    #[error("entry point `{0}` cannot coordinate its own removal")]
    EntryIsTarget(String),

    #[error("entry point `{0}` is not a control-plane member")]
    EntryNotControlPlane(String),

    #[error("`{0}` is not a member of the cluster")]
    NotAMember(String),

    #[error("cluster query on {host} failed: {reason}")]
    QueryFailed { host: String, reason: FailureReason },
}

impl ScalingError {
    /// Errors caused by what was asked for rather than by the cluster.
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            ScalingError::UnknownHost(_)
                | ScalingError::EntryIsTarget(_)
                | ScalingError::EntryNotControlPlane(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum AddNodeError {
    #[error(transparent)]
    Scaling(#[from] ScalingError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("preparing {hostname} failed: {reason}")]
    PrepareFailed {
        hostname: String,
        reason: FailureReason,
    },

    #[error("joining {hostname} failed: {reason}")]
    JoinFailed {
        hostname: String,
        reason: FailureReason,
    },

    #[error("{hostname} did not report Ready within {waited:?}")]
    NotReadyInTime { hostname: String, waited: Duration },
}

impl AddNodeError {
    pub fn scaling(&self) -> Option<&ScalingError> {
        match self {
            AddNodeError::Scaling(err) => Some(err),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum RemoveNodeError {
    #[error(transparent)]
    Scaling(#[from] ScalingError),

    #[error(
        "removing {hostname} would leave {remaining} control-plane member(s), quorum needs {required}"
    )]
    QuorumViolation {
        hostname: String,
        remaining: usize,
        required: usize,
    },

    #[error("draining {hostname} failed: {reason}")]
    DrainFailed {
        hostname: String,
        reason: FailureReason,
    },

    #[error("deleting {hostname} from the cluster failed: {reason}")]
    DeleteFailed {
        hostname: String,
        reason: FailureReason,
    },
}

impl RemoveNodeError {
    pub fn scaling(&self) -> Option<&ScalingError> {
        match self {
            RemoveNodeError::Scaling(err) => Some(err),
            _ => None,
        }
    }
}

/// Checks that must pass before a bootstrap issues its first remote command.
#[derive(Debug, Error)]
pub enum PreflightError {
    #[error(transparent)]
    Assignment(#[from] AssignmentError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to render kubeadm configuration: {0}")]
    Render(#[from] serde_yaml::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("required secret `{0}` was not supplied (set it in the config file or environment)")]
    MissingSecret(&'static str),
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("failed to access role ledger {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("role ledger {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Process exit code for a failed command: invalid input exits with 2,
/// anything that went wrong against the cluster with 1.
pub fn exit_code_for(err: &anyhow::Error) -> u8 {
    let invalid_input = err.chain().any(|cause| {
        cause.is::<ParseError>()
            || cause.is::<AssignmentError>()
            || cause.is::<ConfigError>()
            || cause.is::<PreflightError>()
            || cause.is::<LedgerError>()
            || cause
                .downcast_ref::<ScalingError>()
                .is_some_and(ScalingError::is_invalid_input)
            || matches!(
                cause.downcast_ref::<AddNodeError>(),
                Some(AddNodeError::Config(_))
            )
            || cause
                .downcast_ref::<AddNodeError>()
                .and_then(AddNodeError::scaling)
                .is_some_and(ScalingError::is_invalid_input)
            || matches!(
                cause.downcast_ref::<RemoveNodeError>(),
                Some(RemoveNodeError::QuorumViolation { .. })
            )
            || cause
                .downcast_ref::<RemoveNodeError>()
                .and_then(RemoveNodeError::scaling)
                .is_some_and(ScalingError::is_invalid_input)
    });
    if invalid_input {
        2
    } else {
        1
    }
}
