use serde::Serialize;

use crate::kubeadm::HEALTH_SEPARATOR;

/// One row of `kubectl get nodes --no-headers` (optionally `-o wide`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeSummary {
    pub name: String,
    pub status: String,
    pub roles: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internal_ip: Option<String>,
}

impl NodeSummary {
    /// `Ready` and `Ready,SchedulingDisabled` both count; `NotReady` does not.
    pub fn is_ready(&self) -> bool {
        self.status.split(',').next() == Some("Ready")
    }
}

/// One row of `kubectl get pods --no-headers`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PodSummary {
    pub name: String,
    pub ready: String,
    pub status: String,
}

impl PodSummary {
    pub fn is_healthy(&self) -> bool {
        matches!(self.status.as_str(), "Running" | "Completed" | "Succeeded")
    }
}

// NAME STATUS ROLES AGE VERSION [INTERNAL-IP ...]
pub fn parse_nodes(listing: &str) -> Vec<NodeSummary> {
    listing
        .lines()
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() < 5 {
                return None;
            }
            Some(NodeSummary {
                name: cols[0].to_string(),
                status: cols[1].to_string(),
                roles: cols[2].to_string(),
                version: cols[4].to_string(),
                internal_ip: cols.get(5).map(|ip| ip.to_string()),
            })
        })
        .collect()
}

// NAME READY STATUS RESTARTS AGE
pub fn parse_pods(listing: &str) -> Vec<PodSummary> {
    listing
        .lines()
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() < 3 {
                return None;
            }
            Some(PodSummary {
                name: cols[0].to_string(),
                ready: cols[1].to_string(),
                status: cols[2].to_string(),
            })
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    pub nodes: Vec<NodeSummary>,
    pub pods: Vec<PodSummary>,
}

impl HealthSnapshot {
    /// Parse the combined output of [`crate::kubeadm::cluster_health`].
    pub fn parse(output: &str) -> Self {
        let (nodes, pods) = match output
            .lines()
            .position(|line| line.trim() == HEALTH_SEPARATOR)
        {
            Some(index) => {
                let lines: Vec<&str> = output.lines().collect();
                (lines[..index].join("\n"), lines[index + 1..].join("\n"))
            }
            None => (output.to_string(), String::new()),
        };

        Self {
            nodes: parse_nodes(&nodes),
            pods: parse_pods(&pods),
        }
    }

    /// Expected nodes that are absent or not Ready.
    pub fn nodes_not_ready<'a>(&self, expected: &[&'a str]) -> Vec<&'a str> {
        expected
            .iter()
            .copied()
            .filter(|name| {
                !self
                    .nodes
                    .iter()
                    .any(|node| node.name == *name && node.is_ready())
            })
            .collect()
    }

    pub fn unhealthy_pods(&self) -> Vec<&str> {
        self.pods
            .iter()
            .filter(|pod| !pod.is_healthy())
            .map(|pod| pod.name.as_str())
            .collect()
    }

    /// Every expected node Ready and at least one system pod, all healthy.
    pub fn is_healthy(&self, expected: &[&str]) -> bool {
        self.nodes_not_ready(expected).is_empty()
            && !self.pods.is_empty()
            && self.unhealthy_pods().is_empty()
    }
}
