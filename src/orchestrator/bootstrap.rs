use log::{debug, error, info};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::health::HealthSnapshot;
use super::phase::{FailurePolicy, Phase};
use super::run_record::{RunOutcome, RunRecord, RunReport};
use crate::config::{ClusterConfig, Secret};
use crate::error::{
    AssignmentError, FailureReason, HostFailure, PhaseError, PreflightError,
};
use crate::executor::{dispatch, run_checked, ExecResult, RemoteCommand, RemoteExecutor};
use crate::kubeadm::{self, labels, JoinToken};
use crate::platform::prepare_script;
use crate::retry_policy::FailureKind;
use crate::roles::{Member, Topology, MIN_QUORUM};

/// Extra time granted to the transport on top of a kubectl-side wait.
const WAIT_GRACE: Duration = Duration::from_secs(30);

/// What a phase would do, without doing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedPhase {
    pub phase: Phase,
    pub policy: FailurePolicy,
    pub targets: Vec<String>,
    pub commands: Vec<String>,
}

impl fmt::Display for PlannedPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let targets = if self.targets.is_empty() {
            "(no hosts)".to_string()
        } else {
            self.targets.join(", ")
        };
        write!(
            f,
            "{:<26} on {targets}: {} [{}]",
            self.phase.as_str(),
            self.commands.join(" -> "),
            self.policy
        )
    }
}

/// Drives a fresh cluster through every [`Phase`].
pub struct Bootstrapper {
    config: ClusterConfig,
    topology: Topology,
    first: Member,
    certificate_key: Secret,
    kubeadm_config: String,
    executor: Arc<dyn RemoteExecutor>,
}

impl Bootstrapper {
    /// Runs every pre-flight check; nothing is sent to any host before this
    /// returns `Ok`.
    pub fn new(
        config: ClusterConfig,
        topology: Topology,
        executor: Arc<dyn RemoteExecutor>,
    ) -> Result<Self, PreflightError> {
        config.validate()?;
        topology.ensure_quorum()?;
        let certificate_key = config.certificate_key()?.clone();
        let first = topology
            .first_control_plane()
            .cloned()
            .ok_or(AssignmentError::QuorumTooSmall {
                hosts: 0,
                required: MIN_QUORUM,
            })?;
        let kubeadm_config = kubeadm::render_config(&config, &first, Some(&certificate_key))?;

        Ok(Self {
            config,
            topology,
            first,
            certificate_key,
            kubeadm_config,
            executor,
        })
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    fn joining_control_plane(&self) -> Vec<&Member> {
        self.topology
            .control_plane()
            .filter(|m| m.hostname() != self.first.hostname())
            .collect()
    }

    fn workers(&self) -> Vec<&Member> {
        self.topology.workers().collect()
    }

    fn targets(&self, phase: Phase) -> Vec<String> {
        let names = |members: Vec<&Member>| -> Vec<String> {
            members.iter().map(|m| m.hostname().to_string()).collect()
        };
        match phase {
            Phase::Prepare => names(self.topology.members().iter().collect()),
            Phase::JoinControlPlane => names(self.joining_control_plane()),
            Phase::JoinWorkers => names(self.workers()),
            Phase::InitFirstControlPlane
            | Phase::InstallCni
            | Phase::InstallStorage
            | Phase::VerifyHealth => vec![self.first.hostname().to_string()],
        }
    }

    fn command_labels(phase: Phase) -> Vec<&'static str> {
        match phase {
            Phase::Prepare => vec![labels::PREPARE],
            Phase::InitFirstControlPlane => vec![labels::INIT, labels::JOIN_TOKEN],
            Phase::JoinControlPlane => vec![labels::JOIN_CONTROL_PLANE],
            Phase::JoinWorkers => vec![labels::JOIN_WORKER],
            Phase::InstallCni => vec![labels::CNI_APPLY, labels::CNI_WAIT],
            Phase::InstallStorage => vec![
                labels::STORAGE_APPLY,
                labels::STORAGE_WAIT,
                labels::STORAGE_DEFAULT,
            ],
            Phase::VerifyHealth => vec![labels::HEALTH],
        }
    }

    /// Dry run: phases, targets and commands, without connecting anywhere.
    pub fn plan(&self) -> Vec<PlannedPhase> {
        Phase::ALL
            .into_iter()
            .map(|phase| PlannedPhase {
                phase,
                policy: phase.failure_policy(),
                targets: self.targets(phase),
                commands: Self::command_labels(phase)
                    .into_iter()
                    .map(str::to_string)
                    .collect(),
            })
            .collect()
    }

    pub async fn run(&self) -> RunReport {
        let mut record = RunRecord::new(
            Phase::ALL
                .into_iter()
                .map(|phase| (phase, self.targets(phase)))
                .collect(),
        );
        info!(
            "Starting bootstrap run {} on {} host(s), first control plane {}",
            record.run_id,
            self.topology.len(),
            self.first.hostname()
        );

        let outcome = match self.execute(&mut record).await {
            Ok(()) if record.warnings.is_empty() => {
                info!("Bootstrap completed");
                RunOutcome::Succeeded
            }
            Ok(()) => {
                info!(
                    "Bootstrap completed with {} warning(s)",
                    record.warnings.len()
                );
                RunOutcome::Degraded
            }
            Err(error) => {
                error!("Bootstrap aborted: {error}");
                RunOutcome::Aborted { error }
            }
        };
        record.finish();

        RunReport { outcome, record }
    }

    async fn execute(&self, record: &mut RunRecord) -> Result<(), PhaseError> {
        self.prepare(record).await?;
        let token = self.init_first_control_plane(record).await?;
        self.join_control_plane(record, &token).await?;
        let failed_workers = self.join_workers(record, &token).await;
        self.install_cni(record).await?;
        self.install_storage(record).await?;
        self.verify_health(record, &failed_workers).await;
        Ok(())
    }

    async fn prepare(&self, record: &mut RunRecord) -> Result<(), PhaseError> {
        let phase = Phase::Prepare;
        let members = self.topology.members();
        info!("Phase {phase}: preparing {} host(s)", members.len());
        record.begin_phase(phase);
        for member in members {
            record.attempt(phase, member.hostname());
        }

        let outcomes = dispatch(
            self.executor.as_ref(),
            members,
            self.config.execution.concurrency,
            self.config.timeouts.prepare(),
            |member: &Member| {
                RemoteCommand::new(labels::PREPARE, prepare_script(member, &self.config))
            },
        )
        .await;

        let mut failures = Vec::new();
        for outcome in &outcomes {
            match outcome.verdict() {
                Ok(_) => record.succeed(phase, &outcome.hostname),
                Err(reason) => {
                    error!("Preparing {} failed: {reason}", outcome.hostname);
                    record.fail(phase, &outcome.hostname, reason.clone());
                    failures.push(HostFailure {
                        hostname: outcome.hostname.clone(),
                        reason,
                    });
                }
            }
        }
        record.finish_phase(phase);

        if failures.is_empty() {
            Ok(())
        } else {
            Err(PhaseError { phase, failures })
        }
    }

    async fn init_first_control_plane(
        &self,
        record: &mut RunRecord,
    ) -> Result<JoinToken, PhaseError> {
        let phase = Phase::InitFirstControlPlane;
        let hostname = self.first.hostname();
        info!("Phase {phase}: initialising control plane on {hostname}");
        record.begin_phase(phase);
        record.attempt(phase, hostname);

        let result = self.init_and_fetch_token().await;
        record.finish_phase(phase);

        match result {
            Ok(token) => {
                record.succeed(phase, hostname);
                debug!("Captured join token for {}", token.endpoint);
                Ok(token)
            }
            Err(reason) => {
                record.fail(phase, hostname, reason.clone());
                Err(PhaseError::single(phase, hostname, reason))
            }
        }
    }

    async fn init_and_fetch_token(&self) -> Result<JoinToken, FailureReason> {
        run_checked(
            self.executor.as_ref(),
            &self.first.host,
            &kubeadm::init(&self.kubeadm_config, &self.first),
            self.config.timeouts.init(),
        )
        .await?;
        fetch_join_token(
            self.executor.as_ref(),
            &self.first,
            Some(&self.certificate_key),
            self.config.timeouts.command(),
        )
        .await
    }

    /// One member at a time; etcd membership changes must not overlap.
    async fn join_control_plane(
        &self,
        record: &mut RunRecord,
        token: &JoinToken,
    ) -> Result<(), PhaseError> {
        let phase = Phase::JoinControlPlane;
        let members = self.joining_control_plane();
        info!("Phase {phase}: joining {} control-plane member(s)", members.len());
        record.begin_phase(phase);

        for member in members {
            let hostname = member.hostname();
            record.attempt(phase, hostname);
            let command = kubeadm::join(token, member, Some(&self.certificate_key));
            match run_checked(
                self.executor.as_ref(),
                &member.host,
                &command,
                self.config.timeouts.join(),
            )
            .await
            {
                Ok(_) => {
                    info!("{hostname} joined the control plane");
                    record.succeed(phase, hostname);
                }
                Err(reason) => {
                    error!("{hostname} failed to join the control plane: {reason}");
                    record.fail(phase, hostname, reason.clone());
                    record.finish_phase(phase);
                    return Err(PhaseError::single(phase, hostname, reason));
                }
            }
        }

        record.finish_phase(phase);
        Ok(())
    }

    /// Returns the workers that failed to join; they are warnings only.
    async fn join_workers(&self, record: &mut RunRecord, token: &JoinToken) -> Vec<String> {
        let phase = Phase::JoinWorkers;
        let workers = self.workers();
        info!("Phase {phase}: joining {} worker(s)", workers.len());
        record.begin_phase(phase);
        for worker in &workers {
            record.attempt(phase, worker.hostname());
        }

        let outcomes = dispatch(
            self.executor.as_ref(),
            workers.as_slice(),
            self.config.execution.concurrency,
            self.config.timeouts.join(),
            |member: &&Member| kubeadm::join(token, member, None),
        )
        .await;

        let mut failed = Vec::new();
        for outcome in outcomes {
            match outcome.verdict() {
                Ok(_) => record.succeed(phase, &outcome.hostname),
                Err(reason) => {
                    record.warn(format!(
                        "worker {} failed to join: {reason}",
                        outcome.hostname
                    ));
                    record.fail(phase, &outcome.hostname, reason);
                    failed.push(outcome.hostname);
                }
            }
        }
        record.finish_phase(phase);
        failed
    }

    async fn install_cni(&self, record: &mut RunRecord) -> Result<(), PhaseError> {
        let addons = &self.config.addons;
        let wait = self.config.timeouts.addon_ready();
        self.install_addon(
            record,
            Phase::InstallCni,
            vec![
                (
                    kubeadm::apply_manifest(labels::CNI_APPLY, &addons.cni_manifest),
                    self.config.timeouts.command(),
                ),
                (
                    kubeadm::wait_pods_ready(labels::CNI_WAIT, &addons.cni_namespace, wait.as_secs()),
                    wait + WAIT_GRACE,
                ),
            ],
        )
        .await
    }

    async fn install_storage(&self, record: &mut RunRecord) -> Result<(), PhaseError> {
        let addons = &self.config.addons;
        let wait = self.config.timeouts.addon_ready();
        self.install_addon(
            record,
            Phase::InstallStorage,
            vec![
                (
                    kubeadm::apply_manifest(labels::STORAGE_APPLY, &addons.storage_manifest),
                    self.config.timeouts.command(),
                ),
                (
                    kubeadm::wait_pods_ready(
                        labels::STORAGE_WAIT,
                        &addons.storage_namespace,
                        wait.as_secs(),
                    ),
                    wait + WAIT_GRACE,
                ),
                (
                    kubeadm::set_default_storage_class(&addons.storage_class),
                    self.config.timeouts.command(),
                ),
            ],
        )
        .await
    }

    /// Run `steps` in order on the first control-plane member, restarting
    /// from the first step under the addon retry policy.
    async fn install_addon(
        &self,
        record: &mut RunRecord,
        phase: Phase,
        steps: Vec<(RemoteCommand, Duration)>,
    ) -> Result<(), PhaseError> {
        let hostname = self.first.hostname();
        let policy = &self.config.execution.addon_retry;
        info!("Phase {phase}: {} step(s) on {hostname}", steps.len());
        record.begin_phase(phase);
        let started = Instant::now();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            record.attempt(phase, hostname);

            let mut failure = None;
            for (command, timeout) in &steps {
                if let Err(reason) =
                    run_checked(self.executor.as_ref(), &self.first.host, command, *timeout).await
                {
                    failure = Some((command.label(), reason));
                    break;
                }
            }

            let (label, reason) = match failure {
                None => {
                    record.succeed(phase, hostname);
                    record.finish_phase(phase);
                    return Ok(());
                }
                Some(failure) => failure,
            };

            let kind = FailureKind::of_reason(&reason);
            if policy.should_retry(kind, attempts, started.elapsed()) {
                let delay = policy.wait.calculate_delay(attempts);
                info!(
                    "{phase} step {label} failed ({kind}), attempt {attempts}, retrying in {delay:?}: {reason}"
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            error!("{phase} step {label} failed after {attempts} attempt(s): {reason}");
            record.fail(phase, hostname, reason.clone());
            record.finish_phase(phase);
            return Err(PhaseError::single(phase, hostname, reason));
        }
    }

    /// Poll until every expected node is Ready and system pods run, or the
    /// health timeout passes. Never fatal.
    async fn verify_health(&self, record: &mut RunRecord, failed_workers: &[String]) -> bool {
        let phase = Phase::VerifyHealth;
        let hostname = self.first.hostname();
        let expected: Vec<&str> = self
            .topology
            .members()
            .iter()
            .map(Member::hostname)
            .filter(|name| failed_workers.iter().all(|failed| failed.as_str() != *name))
            .collect();
        info!("Phase {phase}: waiting for {} node(s)", expected.len());
        record.begin_phase(phase);

        let timeouts = &self.config.timeouts;
        let deadline = Instant::now() + timeouts.health();
        let command = kubeadm::cluster_health();
        let mut last_problem;

        loop {
            record.attempt(phase, hostname);
            match run_checked(
                self.executor.as_ref(),
                &self.first.host,
                &command,
                timeouts.command(),
            )
            .await
            {
                Ok(output) => {
                    let snapshot = HealthSnapshot::parse(&output.stdout);
                    if snapshot.is_healthy(&expected) {
                        info!("All {} node(s) Ready, system pods running", expected.len());
                        record.succeed(phase, hostname);
                        record.finish_phase(phase);
                        return true;
                    }
                    last_problem = describe_unhealthy(&snapshot, &expected);
                }
                Err(reason) => last_problem = reason.to_string(),
            }
            debug!("Cluster not healthy yet: {last_problem}");

            if Instant::now() + timeouts.poll_interval() > deadline {
                break;
            }
            tokio::time::sleep(timeouts.poll_interval()).await;
        }

        let reason = FailureReason::ConditionUnmet {
            message: format!(
                "cluster not healthy after {:?}: {last_problem}",
                timeouts.health()
            ),
        };
        record.warn(format!("cluster is degraded: {reason}"));
        record.fail(phase, hostname, reason);
        record.finish_phase(phase);
        false
    }
}

fn describe_unhealthy(snapshot: &HealthSnapshot, expected: &[&str]) -> String {
    let mut problems = Vec::new();
    let not_ready = snapshot.nodes_not_ready(expected);
    if !not_ready.is_empty() {
        problems.push(format!("nodes not ready: {}", not_ready.join(", ")));
    }
    if snapshot.pods.is_empty() {
        problems.push("no system pods reported".to_string());
    }
    let unhealthy = snapshot.unhealthy_pods();
    if !unhealthy.is_empty() {
        problems.push(format!("unhealthy pods: {}", unhealthy.join(", ")));
    }
    problems.join("; ")
}

/// Ask an existing control-plane member for a fresh join command.
pub(crate) async fn fetch_join_token(
    executor: &dyn RemoteExecutor,
    control_plane: &Member,
    certificate_key: Option<&Secret>,
    timeout: Duration,
) -> Result<JoinToken, FailureReason> {
    let output = run_checked(
        executor,
        &control_plane.host,
        &kubeadm::join_token(certificate_key),
        timeout,
    )
    .await?;
    join_token_from(&output, control_plane)
}

/// The join command printed by [`kubeadm::join_token`] on `control_plane`.
pub(crate) fn join_token_from(
    output: &ExecResult,
    control_plane: &Member,
) -> Result<JoinToken, FailureReason> {
    JoinToken::parse(&output.stdout).ok_or_else(|| FailureReason::ConditionUnmet {
        message: format!(
            "no join command in output of {} on {}",
            labels::JOIN_TOKEN,
            control_plane.hostname()
        ),
    })
}
