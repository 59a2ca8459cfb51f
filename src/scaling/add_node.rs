use log::{debug, error, info};
use tokio::time::Instant;

use super::ScalingOperator;
use crate::error::{AddNodeError, ScalingError};
use crate::executor::{run_checked, RemoteCommand};
use crate::inventory::Host;
use crate::kubeadm::{self, labels};
use crate::orchestrator::bootstrap::join_token_from;
use crate::platform::prepare_script;
use crate::roles::{Member, Role, Topology};

/// Outcome of [`ScalingOperator::add_nodes`].
#[derive(Debug, Default)]
pub struct BatchAddReport {
    pub added: Vec<Member>,
    pub failed: Vec<(String, AddNodeError)>,
}

impl BatchAddReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

impl ScalingOperator {
    /// Add every topology host the cluster does not list yet, one at a time,
    /// as `role`. A host that fails does not stop the others.
    pub async fn add_nodes(
        &self,
        topology: &Topology,
        entry: &str,
        role: Role,
    ) -> Result<BatchAddReport, AddNodeError> {
        let entry_member = self.entry_point(topology, entry)?;
        if role.is_control_plane() {
            self.config.certificate_key()?;
        }

        let listed = self.probe(entry_member).await?;
        let pending: Vec<&Member> = topology
            .members()
            .iter()
            .filter(|m| !listed.iter().any(|n| n.name == m.hostname()))
            .collect();
        info!(
            "{} inventory host(s) not in the cluster yet",
            pending.len()
        );

        let mut report = BatchAddReport::default();
        for member in pending {
            match self.add_node(topology, entry, &member.host, role).await {
                Ok(added) => report.added.push(added),
                Err(err) => {
                    error!("Adding {} failed: {err}", member.hostname());
                    report.failed.push((member.hostname().to_string(), err));
                }
            }
        }
        info!(
            "Added {}/{} host(s)",
            report.added.len(),
            report.added.len() + report.failed.len()
        );
        Ok(report)
    }

    /// Prepare `new_host` and join it to the cluster administered from
    /// `entry`, then wait for it to report Ready.
    pub async fn add_node(
        &self,
        topology: &Topology,
        entry: &str,
        new_host: &Host,
        role: Role,
    ) -> Result<Member, AddNodeError> {
        let entry = self.entry_point(topology, entry)?;
        let member = Member {
            host: new_host.clone(),
            role,
        };
        let hostname = member.hostname().to_string();
        if entry.hostname() == hostname {
            return Err(ScalingError::AlreadyMember(hostname).into());
        }

        // Control-plane joins need the certificate key; check before any
        // remote call.
        let certificate_key = if role.is_control_plane() {
            Some(self.config.certificate_key()?)
        } else {
            None
        };

        let nodes = self.probe(entry).await?;
        if nodes.iter().any(|n| n.name == hostname) {
            return Err(ScalingError::AlreadyMember(hostname).into());
        }

        info!("Preparing {hostname} as {role}");
        let timeouts = &self.config.timeouts;
        run_checked(
            self.executor.as_ref(),
            &member.host,
            &RemoteCommand::new(labels::PREPARE, prepare_script(&member, &self.config)),
            timeouts.prepare(),
        )
        .await
        .map_err(|reason| AddNodeError::PrepareFailed {
            hostname: hostname.clone(),
            reason,
        })?;

        let output = self
            .query(entry, &kubeadm::join_token(certificate_key))
            .await?;
        let token =
            join_token_from(&output, entry).map_err(|reason| ScalingError::QueryFailed {
                host: entry.hostname().to_string(),
                reason,
            })?;

        info!("Joining {hostname} through {}", token.endpoint);
        run_checked(
            self.executor.as_ref(),
            &member.host,
            &kubeadm::join(&token, &member, certificate_key),
            timeouts.join(),
        )
        .await
        .map_err(|reason| AddNodeError::JoinFailed {
            hostname: hostname.clone(),
            reason,
        })?;

        self.wait_ready(entry, &hostname).await?;
        info!("{hostname} is Ready");
        Ok(member)
    }

    async fn wait_ready(&self, entry: &Member, hostname: &str) -> Result<(), AddNodeError> {
        let timeouts = &self.config.timeouts;
        let started = Instant::now();
        let deadline = started + timeouts.node_ready();
        let command = kubeadm::node_ready(hostname);

        loop {
            match run_checked(
                self.executor.as_ref(),
                &entry.host,
                &command,
                timeouts.command(),
            )
            .await
            {
                Ok(output) if output.stdout.trim() == "True" => return Ok(()),
                Ok(output) => debug!("{hostname} Ready condition: {:?}", output.stdout.trim()),
                Err(reason) => debug!("Readiness query for {hostname} failed: {reason}"),
            }

            if Instant::now() + timeouts.poll_interval() > deadline {
                return Err(AddNodeError::NotReadyInTime {
                    hostname: hostname.to_string(),
                    waited: started.elapsed(),
                });
            }
            tokio::time::sleep(timeouts.poll_interval()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConfigError, ExecError};
    use crate::test_harness::{test_config, test_topology, ScriptedExecutor, TEST_CERTIFICATE_KEY};
    use std::sync::Arc;
    use std::time::Duration;

    fn new_host() -> Host {
        Host::new("node-9", "10.0.0.9")
    }

    fn cluster() -> ScriptedExecutor {
        ScriptedExecutor::healthy_cluster(&["node-1", "node-2", "node-3"])
    }

    #[tokio::test]
    async fn test_add_worker() {
        let executor = cluster();
        let operator = ScalingOperator::new(test_config(), Arc::new(executor.clone()));

        let member = operator
            .add_node(&test_topology(3), "node-1", &new_host(), Role::Worker)
            .await
            .unwrap();

        assert_eq!(member.role, Role::Worker);
        assert_eq!(
            executor.labels_for("node-1"),
            vec![labels::LIST_NODES, labels::JOIN_TOKEN, labels::NODE_READY]
        );
        assert_eq!(
            executor.labels_for("node-9"),
            vec![labels::PREPARE, labels::JOIN_WORKER]
        );
        // Workers never see the certificate key.
        assert!(!executor
            .calls()
            .iter()
            .any(|c| c.body.contains(TEST_CERTIFICATE_KEY)));
    }

    #[tokio::test]
    async fn test_add_control_plane_reuploads_certificates() {
        let executor = cluster();
        let operator = ScalingOperator::new(test_config(), Arc::new(executor.clone()));

        operator
            .add_node(&test_topology(3), "node-2", &new_host(), Role::ControlPlane)
            .await
            .unwrap();

        let token_call = &executor.calls_for("node-2")[1];
        assert!(token_call.body.contains("upload-certs --upload-certs"));
        let join = &executor.calls_for("node-9")[1];
        assert_eq!(join.label, labels::JOIN_CONTROL_PLANE);
        assert!(join.body.contains("--apiserver-advertise-address 10.0.0.9"));
        assert!(!join.body.contains("taint node"));
    }

    #[tokio::test]
    async fn test_add_control_plane_without_key_fails_fast() {
        let executor = cluster();
        let mut config = test_config();
        config.secrets.certificate_key = None;
        let operator = ScalingOperator::new(config, Arc::new(executor.clone()));

        let err = operator
            .add_node(&test_topology(3), "node-1", &new_host(), Role::Hybrid)
            .await
            .unwrap_err();
        assert!(matches!(err, AddNodeError::Config(ConfigError::MissingSecret(_))));
        assert!(executor.calls().is_empty());
    }

    #[tokio::test]
    async fn test_existing_member_is_rejected() {
        let executor = ScriptedExecutor::healthy_cluster(&["node-1", "node-2", "node-3", "node-9"]);
        let operator = ScalingOperator::new(test_config(), Arc::new(executor.clone()));

        let err = operator
            .add_node(&test_topology(3), "node-1", &new_host(), Role::Worker)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AddNodeError::Scaling(ScalingError::AlreadyMember(name)) if name == "node-9"
        ));
        assert_eq!(executor.count(labels::PREPARE), 0);
    }

    #[tokio::test]
    async fn test_unreachable_entry_issues_nothing_else() {
        let executor = cluster();
        executor.fail_host(
            "node-1",
            ExecError::ConnectionRefused("node-1:22".to_string()),
        );
        let operator = ScalingOperator::new(test_config(), Arc::new(executor.clone()));

        let err = operator
            .add_node(&test_topology(3), "node-1", &new_host(), Role::Worker)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AddNodeError::Scaling(ScalingError::EntryPointUnreachable { .. })
        ));
        assert_eq!(executor.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_entry_lost_while_fetching_token() {
        let executor = cluster();
        executor
            .on(labels::JOIN_TOKEN)
            .fail(ExecError::ConnectionRefused("node-1:22".to_string()));
        let operator = ScalingOperator::new(test_config(), Arc::new(executor.clone()));

        let err = operator
            .add_node(&test_topology(3), "node-1", &new_host(), Role::Worker)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AddNodeError::Scaling(ScalingError::EntryPointUnreachable { ref host, .. }) if host == "node-1"
        ));
        assert_eq!(executor.count(labels::JOIN_WORKER), 0);
    }

    #[tokio::test]
    async fn test_garbled_token_output_is_a_query_failure() {
        let executor = cluster();
        executor.on(labels::JOIN_TOKEN).reply("no token here");
        let operator = ScalingOperator::new(test_config(), Arc::new(executor.clone()));

        let err = operator
            .add_node(&test_topology(3), "node-1", &new_host(), Role::Worker)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AddNodeError::Scaling(ScalingError::QueryFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_add_nodes_joins_only_unlisted_hosts() {
        let executor = cluster();
        executor
            .on(labels::PREPARE)
            .host("node-5")
            .exit(1, "dpkg lock held");
        let operator = ScalingOperator::new(test_config(), Arc::new(executor.clone()));

        let report = operator
            .add_nodes(&test_topology(5), "node-1", Role::Worker)
            .await
            .unwrap();

        let added: Vec<&str> = report.added.iter().map(Member::hostname).collect();
        assert_eq!(added, vec!["node-4"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "node-5");
        assert!(matches!(report.failed[0].1, AddNodeError::PrepareFailed { .. }));
        assert!(!report.is_complete());
        for member in ["node-1", "node-2", "node-3"] {
            assert_eq!(executor.count_on(labels::PREPARE, member), 0);
        }
        assert_eq!(executor.count_on(labels::JOIN_WORKER, "node-4"), 1);
    }

    #[tokio::test]
    async fn test_add_nodes_with_nothing_new() {
        let executor = cluster();
        let operator = ScalingOperator::new(test_config(), Arc::new(executor.clone()));

        let report = operator
            .add_nodes(&test_topology(3), "node-1", Role::Worker)
            .await
            .unwrap();
        assert!(report.added.is_empty());
        assert!(report.is_complete());
        assert_eq!(executor.labels(), vec![labels::LIST_NODES]);
    }

    #[tokio::test]
    async fn test_join_failure() {
        let executor = cluster();
        executor
            .on(labels::JOIN_WORKER)
            .exit(1, "error execution phase preflight");
        let operator = ScalingOperator::new(test_config(), Arc::new(executor.clone()));

        let err = operator
            .add_node(&test_topology(3), "node-1", &new_host(), Role::Worker)
            .await
            .unwrap_err();
        assert!(matches!(err, AddNodeError::JoinFailed { ref hostname, .. } if hostname == "node-9"));
        assert_eq!(executor.count(labels::NODE_READY), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_node_never_ready() {
        let executor = cluster();
        executor.on(labels::NODE_READY).reply("False");
        let operator = ScalingOperator::new(test_config(), Arc::new(executor.clone()));

        let err = operator
            .add_node(&test_topology(3), "node-1", &new_host(), Role::Worker)
            .await
            .unwrap_err();
        match err {
            AddNodeError::NotReadyInTime { hostname, waited } => {
                assert_eq!(hostname, "node-9");
                assert!(waited <= Duration::from_secs(300));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(executor.count(labels::NODE_READY) > 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_node_becomes_ready_after_polling() {
        let executor = cluster();
        executor.on(labels::NODE_READY).times(2).reply("False");
        let operator = ScalingOperator::new(test_config(), Arc::new(executor.clone()));

        operator
            .add_node(&test_topology(3), "node-1", &new_host(), Role::Worker)
            .await
            .unwrap();
        assert_eq!(executor.count(labels::NODE_READY), 3);
    }
}
