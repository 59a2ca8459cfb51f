//! Cluster bootstrap: phases, the per-run record and health evaluation.

pub mod bootstrap;
pub mod health;
pub mod phase;
pub mod run_record;

pub use bootstrap::{Bootstrapper, PlannedPhase};
pub use health::{HealthSnapshot, NodeSummary, PodSummary};
pub use phase::{FailurePolicy, Phase};
pub use run_record::{HostStep, PhaseRecord, RunOutcome, RunRecord, RunReport, StepStatus};
