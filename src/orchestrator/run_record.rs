use chrono::{DateTime, Utc};
use log::warn;
use serde::Serialize;
use std::fs;
use std::path::Path;
use uuid::Uuid;

use super::phase::Phase;
use crate::error::{FailureReason, PhaseError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed { reason: FailureReason },
}

impl StepStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, StepStatus::Failed { .. })
    }
}

/// One host inside one phase.
#[derive(Debug, Clone, Serialize)]
pub struct HostStep {
    pub hostname: String,
    pub status: StepStatus,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseRecord {
    pub phase: Phase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub steps: Vec<HostStep>,
}

impl PhaseRecord {
    pub fn step(&self, hostname: &str) -> Option<&HostStep> {
        self.steps.iter().find(|s| s.hostname == hostname)
    }

    pub fn failed_hosts(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| s.status.is_failed())
            .map(|s| s.hostname.as_str())
            .collect()
    }
}

/// Progress of one bootstrap run.
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub phases: Vec<PhaseRecord>,
    pub warnings: Vec<String>,
}

impl RunRecord {
    /// Every phase with its targets, all steps pending.
    pub fn new(targets: Vec<(Phase, Vec<String>)>) -> Self {
        let phases = targets
            .into_iter()
            .map(|(phase, hosts)| PhaseRecord {
                phase,
                started_at: None,
                finished_at: None,
                steps: hosts
                    .into_iter()
                    .map(|hostname| HostStep {
                        hostname,
                        status: StepStatus::Pending,
                        attempts: 0,
                    })
                    .collect(),
            })
            .collect();

        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            phases,
            warnings: Vec::new(),
        }
    }

    pub fn phase(&self, phase: Phase) -> Option<&PhaseRecord> {
        self.phases.iter().find(|p| p.phase == phase)
    }

    fn phase_mut(&mut self, phase: Phase) -> Option<&mut PhaseRecord> {
        self.phases.iter_mut().find(|p| p.phase == phase)
    }

    fn step_mut(&mut self, phase: Phase, hostname: &str) -> Option<&mut HostStep> {
        self.phase_mut(phase)?
            .steps
            .iter_mut()
            .find(|s| s.hostname == hostname)
    }

    pub fn status(&self, phase: Phase, hostname: &str) -> Option<&StepStatus> {
        self.phase(phase)?.step(hostname).map(|s| &s.status)
    }

    pub fn begin_phase(&mut self, phase: Phase) {
        if let Some(record) = self.phase_mut(phase) {
            record.started_at = Some(Utc::now());
        }
    }

    pub fn finish_phase(&mut self, phase: Phase) {
        if let Some(record) = self.phase_mut(phase) {
            record.finished_at = Some(Utc::now());
        }
    }

    /// Mark a host running and count the attempt.
    pub fn attempt(&mut self, phase: Phase, hostname: &str) {
        if let Some(step) = self.step_mut(phase, hostname) {
            step.status = StepStatus::Running;
            step.attempts += 1;
        }
    }

    pub fn succeed(&mut self, phase: Phase, hostname: &str) {
        if let Some(step) = self.step_mut(phase, hostname) {
            step.status = StepStatus::Succeeded;
        }
    }

    pub fn fail(&mut self, phase: Phase, hostname: &str, reason: FailureReason) {
        if let Some(step) = self.step_mut(phase, hostname) {
            step.status = StepStatus::Failed { reason };
        }
    }

    pub fn warn(&mut self, message: String) {
        warn!("{message}");
        self.warnings.push(message);
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    /// The run completed but some non-fatal step failed; see the warnings.
    Degraded,
    Aborted { error: PhaseError },
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    #[serde(flatten)]
    pub outcome: RunOutcome,
    pub record: RunRecord,
}

impl RunReport {
    pub fn exit_code(&self) -> i32 {
        match self.outcome {
            RunOutcome::Succeeded | RunOutcome::Degraded => 0,
            RunOutcome::Aborted { .. } => 1,
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self.outcome, RunOutcome::Aborted { .. })
    }

    pub fn write_json(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Human summary, one line per phase.
    pub fn summary(&self) -> String {
        let mut lines = vec![format!("run {}", self.record.run_id)];
        for phase in &self.record.phases {
            let done = phase
                .steps
                .iter()
                .filter(|s| s.status == StepStatus::Succeeded)
                .count();
            let failed = phase.failed_hosts();
            let mut line = format!("  {:<26} {done}/{} succeeded", phase.phase.to_string(), phase.steps.len());
            if !failed.is_empty() {
                line.push_str(&format!(", failed: {}", failed.join(", ")));
            }
            lines.push(line);
        }
        for warning in &self.record.warnings {
            lines.push(format!("  warning: {warning}"));
        }
        lines.push(match &self.outcome {
            RunOutcome::Succeeded => "outcome: succeeded".to_string(),
            RunOutcome::Degraded => "outcome: degraded".to_string(),
            RunOutcome::Aborted { error } => format!("outcome: aborted ({error})"),
        });
        lines.join("\n")
    }
}
