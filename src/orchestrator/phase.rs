use serde::{Deserialize, Serialize};
use std::fmt;

/// Bootstrap phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Prepare,
    InitFirstControlPlane,
    JoinControlPlane,
    JoinWorkers,
    InstallCni,
    InstallStorage,
    VerifyHealth,
}

/// What a failure inside a phase does to the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    Abort,
    /// Record a warning and keep going.
    Continue,
    /// Retry under the addon retry policy, then abort.
    RetryThenAbort,
    /// Finish the run but report the cluster as degraded.
    Degrade,
}

impl Phase {
    pub const ALL: [Phase; 7] = [
        Phase::Prepare,
        Phase::InitFirstControlPlane,
        Phase::JoinControlPlane,
        Phase::JoinWorkers,
        Phase::InstallCni,
        Phase::InstallStorage,
        Phase::VerifyHealth,
    ];

    pub fn failure_policy(self) -> FailurePolicy {
        match self {
            Phase::Prepare | Phase::InitFirstControlPlane | Phase::JoinControlPlane => {
                FailurePolicy::Abort
            }
            Phase::JoinWorkers => FailurePolicy::Continue,
            Phase::InstallCni | Phase::InstallStorage => FailurePolicy::RetryThenAbort,
            Phase::VerifyHealth => FailurePolicy::Degrade,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Prepare => "prepare",
            Phase::InitFirstControlPlane => "init-first-control-plane",
            Phase::JoinControlPlane => "join-control-plane",
            Phase::JoinWorkers => "join-workers",
            Phase::InstallCni => "install-cni",
            Phase::InstallStorage => "install-storage",
            Phase::VerifyHealth => "verify-health",
        }
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailurePolicy::Abort => "abort on failure",
            FailurePolicy::Continue => "warn and continue",
            FailurePolicy::RetryThenAbort => "retry, then abort",
            FailurePolicy::Degrade => "report degraded",
        })
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
