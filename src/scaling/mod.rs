//! Growing and shrinking a running cluster through one entry host.
//!
//! The entry host must be a control-plane member: it holds the admin
//! kubeconfig every membership query and change goes through.

mod add_node;
mod remove_node;

pub use add_node::BatchAddReport;
pub use remove_node::{RemovalReport, RemoveOptions};

use log::debug;
use std::sync::Arc;

use crate::config::ClusterConfig;
use crate::error::ScalingError;
use crate::executor::{verdict, ExecResult, RemoteCommand, RemoteExecutor};
use crate::kubeadm;
use crate::orchestrator::health::{parse_nodes, NodeSummary};
use crate::roles::{Member, Topology};

/// `kubectl describe node` output plus the listing row for that node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub summary: NodeSummary,
    pub description: String,
}

pub struct ScalingOperator {
    config: ClusterConfig,
    executor: Arc<dyn RemoteExecutor>,
}

impl ScalingOperator {
    pub fn new(config: ClusterConfig, executor: Arc<dyn RemoteExecutor>) -> Self {
        Self { config, executor }
    }

    /// Look `entry` up in `topology` and check it can administer the cluster.
    fn entry_point<'a>(
        &self,
        topology: &'a Topology,
        entry: &str,
    ) -> Result<&'a Member, ScalingError> {
        let member = topology
            .find(entry)
            .ok_or_else(|| ScalingError::UnknownHost(entry.to_string()))?;
        if !member.role.is_control_plane() {
            return Err(ScalingError::EntryNotControlPlane(
                member.hostname().to_string(),
            ));
        }
        Ok(member)
    }

    /// Run a query on `entry`. Any transport failure means the entry point
    /// is unreachable.
    async fn query(
        &self,
        entry: &Member,
        command: &RemoteCommand,
    ) -> Result<ExecResult, ScalingError> {
        let result = self
            .executor
            .run(&entry.host, command, self.config.timeouts.command())
            .await;

        if let Err(source) = &result {
            return Err(ScalingError::EntryPointUnreachable {
                host: entry.hostname().to_string(),
                source: source.clone(),
            });
        }
        verdict(&result)
            .cloned()
            .map_err(|reason| ScalingError::QueryFailed {
                host: entry.hostname().to_string(),
                reason,
            })
    }

    /// Current membership as seen from `entry`.
    async fn probe(&self, entry: &Member) -> Result<Vec<NodeSummary>, ScalingError> {
        let output = self.query(entry, &kubeadm::list_nodes()).await?;
        let nodes = parse_nodes(&output.stdout);
        debug!("{} reports {} node(s)", entry.hostname(), nodes.len());
        Ok(nodes)
    }

    pub async fn list_nodes(
        &self,
        topology: &Topology,
        entry: &str,
    ) -> Result<Vec<NodeSummary>, ScalingError> {
        let entry = self.entry_point(topology, entry)?;
        self.probe(entry).await
    }

    pub async fn node_status(
        &self,
        topology: &Topology,
        entry: &str,
        node: &str,
    ) -> Result<NodeStatus, ScalingError> {
        let entry = self.entry_point(topology, entry)?;
        let name = topology
            .find(node)
            .map(|m| m.hostname().to_string())
            .unwrap_or_else(|| node.to_string());

        let summary = self
            .probe(entry)
            .await?
            .into_iter()
            .find(|n| n.name == name)
            .ok_or_else(|| ScalingError::NotAMember(name.clone()))?;

        let output = self.query(entry, &kubeadm::describe_node(&name)).await?;

        Ok(NodeStatus {
            summary,
            description: output.stdout,
        })
    }
}
