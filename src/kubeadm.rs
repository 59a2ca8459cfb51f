//! kubeadm and kubectl invocations.
//!
//! Builders here only produce [`RemoteCommand`]s; running them and judging the
//! results is up to the orchestrator and the scaling operations. Commands
//! that create state are guarded so a re-run on an already converged host is
//! a no-op.

use serde::Serialize;
use std::fmt;

use crate::config::{ClusterConfig, DrainConfig, Secret};
use crate::executor::RemoteCommand;
use crate::roles::{Member, Role};

pub const KUBEADM_API_VERSION: &str = "kubeadm.k8s.io/v1beta3";
pub const KUBELET_API_VERSION: &str = "kubelet.config.k8s.io/v1beta1";
pub const CRI_SOCKET: &str = "unix:///var/run/containerd/containerd.sock";

const ADMIN_CONF: &str = "/etc/kubernetes/admin.conf";
const KUBELET_CONF: &str = "/etc/kubernetes/kubelet.conf";
const KUBEADM_CONFIG_PATH: &str = "/root/kubeadm-config.yaml";
const KUBECTL: &str = "kubectl --kubeconfig /etc/kubernetes/admin.conf";
const CONTROL_PLANE_TAINT: &str = "node-role.kubernetes.io/control-plane:NoSchedule";

/// Command labels, also used to match commands in tests.
pub mod labels {
    pub const PREPARE: &str = "prepare";
    pub const INIT: &str = "kubeadm-init";
    pub const JOIN_TOKEN: &str = "join-token";
    pub const JOIN_CONTROL_PLANE: &str = "join-control-plane";
    pub const JOIN_WORKER: &str = "join-worker";
    pub const CNI_APPLY: &str = "cni-apply";
    pub const CNI_WAIT: &str = "cni-wait";
    pub const STORAGE_APPLY: &str = "storage-apply";
    pub const STORAGE_WAIT: &str = "storage-wait";
    pub const STORAGE_DEFAULT: &str = "storage-default-class";
    pub const HEALTH: &str = "cluster-health";
    pub const LIST_NODES: &str = "list-nodes";
    pub const NODE_READY: &str = "node-ready";
    pub const DESCRIBE_NODE: &str = "describe-node";
    pub const DRAIN: &str = "drain";
    pub const RESET: &str = "kubeadm-reset";
    pub const DELETE_NODE: &str = "delete-node";
}

/// Separator between the node and pod listings of [`cluster_health`].
pub const HEALTH_SEPARATOR: &str = "---";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InitConfiguration<'a> {
    api_version: &'a str,
    kind: &'a str,
    #[serde(rename = "localAPIEndpoint")]
    local_api_endpoint: ApiEndpoint<'a>,
    node_registration: NodeRegistration<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    certificate_key: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ApiEndpoint<'a> {
    advertise_address: &'a str,
    bind_port: u16,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct NodeRegistration<'a> {
    name: &'a str,
    cri_socket: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClusterConfiguration<'a> {
    api_version: &'a str,
    kind: &'a str,
    kubernetes_version: String,
    control_plane_endpoint: &'a str,
    networking: Networking<'a>,
    etcd: Etcd<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Networking<'a> {
    pod_subnet: &'a str,
    service_subnet: &'a str,
}

#[derive(Debug, Serialize)]
struct Etcd<'a> {
    local: EtcdLocal<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EtcdLocal<'a> {
    data_dir: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct KubeletConfiguration<'a> {
    api_version: &'a str,
    kind: &'a str,
    cgroup_driver: &'a str,
}

/// `host:port` of the API server as seen by joining nodes.
pub fn control_plane_endpoint(config: &ClusterConfig, first_control_plane: &Member) -> String {
    config.control_plane_endpoint.clone().unwrap_or_else(|| {
        format!(
            "{}:{}",
            first_control_plane.host.cluster_address(),
            config.api_server_port
        )
    })
}

/// Multi-document kubeadm configuration for the first control-plane member.
pub fn render_config(
    config: &ClusterConfig,
    first_control_plane: &Member,
    certificate_key: Option<&Secret>,
) -> Result<String, serde_yaml::Error> {
    let endpoint = control_plane_endpoint(config, first_control_plane);
    let init = InitConfiguration {
        api_version: KUBEADM_API_VERSION,
        kind: "InitConfiguration",
        local_api_endpoint: ApiEndpoint {
            advertise_address: first_control_plane.host.cluster_address(),
            bind_port: config.api_server_port,
        },
        node_registration: NodeRegistration {
            name: first_control_plane.hostname(),
            cri_socket: CRI_SOCKET,
        },
        certificate_key: certificate_key.map(Secret::expose),
    };
    let cluster = ClusterConfiguration {
        api_version: KUBEADM_API_VERSION,
        kind: "ClusterConfiguration",
        kubernetes_version: format!("v{}", config.kubernetes_version.trim_start_matches('v')),
        control_plane_endpoint: &endpoint,
        networking: Networking {
            pod_subnet: &config.pod_network_cidr,
            service_subnet: &config.service_cidr,
        },
        etcd: Etcd {
            local: EtcdLocal {
                data_dir: "/var/lib/etcd",
            },
        },
    };
    let kubelet = KubeletConfiguration {
        api_version: KUBELET_API_VERSION,
        kind: "KubeletConfiguration",
        cgroup_driver: "systemd",
    };

    Ok([
        serde_yaml::to_string(&init)?,
        serde_yaml::to_string(&cluster)?,
        serde_yaml::to_string(&kubelet)?,
    ]
    .join("---\n"))
}

/// Join credentials printed by `kubeadm token create --print-join-command`.
#[derive(Clone, PartialEq, Eq)]
pub struct JoinToken {
    pub endpoint: String,
    token: Secret,
    pub ca_cert_hash: String,
}

impl fmt::Debug for JoinToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinToken")
            .field("endpoint", &self.endpoint)
            .field("token", &self.token)
            .field("ca_cert_hash", &self.ca_cert_hash)
            .finish()
    }
}

impl JoinToken {
    pub fn new(endpoint: impl Into<String>, token: Secret, ca_cert_hash: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            token,
            ca_cert_hash: ca_cert_hash.into(),
        }
    }

    /// Pull the first `kubeadm join` invocation out of command output.
    pub fn parse(output: &str) -> Option<Self> {
        let folded = output.replace("\\\r\n", " ").replace("\\\n", " ");
        let line = folded.lines().find(|line| line.contains("kubeadm join"))?;
        let mut words = line
            .split_whitespace()
            .skip_while(|word| *word != "join")
            .skip(1);

        let endpoint = words.next().filter(|word| !word.starts_with("--"))?;
        let mut token = None;
        let mut ca_cert_hash = None;
        while let Some(word) = words.next() {
            match word {
                "--token" => token = words.next(),
                "--discovery-token-ca-cert-hash" => ca_cert_hash = words.next(),
                _ => {}
            }
        }

        Some(Self::new(endpoint, Secret::new(token?), ca_cert_hash?))
    }

    fn join_arguments(&self) -> String {
        format!(
            "{} --token {} --discovery-token-ca-cert-hash {}",
            self.endpoint,
            self.token.expose(),
            self.ca_cert_hash
        )
    }
}

fn untaint(hostname: &str) -> String {
    format!("{KUBECTL} taint node {hostname} {CONTROL_PLANE_TAINT}- || true")
}

fn install_admin_kubeconfig() -> String {
    format!("mkdir -p \"$HOME/.kube\" && cp -f {ADMIN_CONF} \"$HOME/.kube/config\"")
}

/// `kubeadm init` on the first control-plane member, skipped when the
/// cluster already exists there.
pub fn init(kubeadm_config: &str, member: &Member) -> RemoteCommand {
    let mut body = format!(
        "set -euo pipefail\n\
         if [ -f {ADMIN_CONF} ]; then\n\
         \techo 'control plane already initialised'\n\
         else\n\
         \tumask 077\n\
         \tcat > {KUBEADM_CONFIG_PATH} <<'KUBEADM_EOF'\n\
         {kubeadm_config}\
         KUBEADM_EOF\n\
         \tkubeadm init --config {KUBEADM_CONFIG_PATH} --upload-certs\n\
         \trm -f {KUBEADM_CONFIG_PATH}\n\
         fi\n\
         {}\n",
        install_admin_kubeconfig()
    );
    if member.role == Role::Hybrid {
        body.push_str(&untaint(member.hostname()));
        body.push('\n');
    }
    RemoteCommand::new(labels::INIT, body).sensitive()
}

/// Fresh join command. With a certificate key the control-plane certificates
/// are re-uploaded first so a control-plane join can fetch them.
pub fn join_token(certificate_key: Option<&Secret>) -> RemoteCommand {
    let body = match certificate_key {
        Some(key) => format!(
            "kubeadm init phase upload-certs --upload-certs --certificate-key {} >/dev/null && kubeadm token create --print-join-command",
            key.expose()
        ),
        None => "kubeadm token create --print-join-command".to_string(),
    };
    RemoteCommand::new(labels::JOIN_TOKEN, body).sensitive()
}

/// Join `member` as a worker, or as a control plane when its role says so.
/// Control-plane joins need the certificate key.
pub fn join(token: &JoinToken, member: &Member, certificate_key: Option<&Secret>) -> RemoteCommand {
    let mut join = format!(
        "kubeadm join {} --node-name {}",
        token.join_arguments(),
        member.hostname()
    );
    let is_control_plane = member.role.is_control_plane();
    if is_control_plane {
        join.push_str(" --control-plane");
        if let Some(key) = certificate_key {
            join.push_str(&format!(" --certificate-key {}", key.expose()));
        }
        join.push_str(&format!(
            " --apiserver-advertise-address {}",
            member.host.cluster_address()
        ));
    }

    let mut body = format!(
        "set -euo pipefail\n\
         if [ -f {KUBELET_CONF} ]; then\n\
         \techo 'node already joined'\n\
         else\n\
         \t{join}\n\
         fi\n"
    );
    if is_control_plane {
        body.push_str(&install_admin_kubeconfig());
        body.push('\n');
    }
    if member.role == Role::Hybrid {
        body.push_str(&untaint(member.hostname()));
        body.push('\n');
    }

    let label = if is_control_plane {
        labels::JOIN_CONTROL_PLANE
    } else {
        labels::JOIN_WORKER
    };
    RemoteCommand::new(label, body).sensitive()
}

pub fn apply_manifest(label: &str, manifest: &str) -> RemoteCommand {
    RemoteCommand::new(label, format!("{KUBECTL} apply -f {manifest}"))
}

/// Block until every pod in `namespace` is Ready.
pub fn wait_pods_ready(label: &str, namespace: &str, timeout_secs: u64) -> RemoteCommand {
    RemoteCommand::new(
        label,
        format!(
            "{KUBECTL} -n {namespace} wait --for=condition=Ready pods --all --timeout={timeout_secs}s"
        ),
    )
}

pub fn set_default_storage_class(class: &str) -> RemoteCommand {
    RemoteCommand::new(
        labels::STORAGE_DEFAULT,
        format!(
            "{KUBECTL} patch storageclass {class} -p '{{\"metadata\": {{\"annotations\": {{\"storageclass.kubernetes.io/is-default-class\": \"true\"}}}}}}'"
        ),
    )
}

/// Node and kube-system pod listings in one round trip.
pub fn cluster_health() -> RemoteCommand {
    RemoteCommand::new(
        labels::HEALTH,
        format!(
            "{KUBECTL} get nodes --no-headers; echo '{HEALTH_SEPARATOR}'; {KUBECTL} get pods -n kube-system --no-headers"
        ),
    )
}

pub fn list_nodes() -> RemoteCommand {
    RemoteCommand::new(
        labels::LIST_NODES,
        format!("{KUBECTL} get nodes -o wide --no-headers"),
    )
}

/// Prints `True` once the node's Ready condition holds.
pub fn node_ready(hostname: &str) -> RemoteCommand {
    RemoteCommand::new(
        labels::NODE_READY,
        format!(
            "{KUBECTL} get node {hostname} -o jsonpath='{{.status.conditions[?(@.type==\"Ready\")].status}}'"
        ),
    )
}

pub fn describe_node(hostname: &str) -> RemoteCommand {
    RemoteCommand::new(
        labels::DESCRIBE_NODE,
        format!("{KUBECTL} describe node {hostname}"),
    )
}

pub fn drain(hostname: &str, drain: &DrainConfig, force: bool) -> RemoteCommand {
    let mut body = format!(
        "{KUBECTL} drain {hostname} --ignore-daemonsets --delete-emptydir-data --grace-period={} --timeout={}s",
        drain.grace_period_secs, drain.timeout_secs
    );
    if force {
        body.push_str(" --force");
    }
    RemoteCommand::new(labels::DRAIN, body)
}

pub fn delete_node(hostname: &str) -> RemoteCommand {
    RemoteCommand::new(
        labels::DELETE_NODE,
        format!("{KUBECTL} delete node {hostname}"),
    )
}

/// Wipe kubeadm state from a host that is leaving the cluster.
pub fn reset() -> RemoteCommand {
    RemoteCommand::new(
        labels::RESET,
        [
            "kubeadm reset --force",
            "iptables -F && iptables -t nat -F && iptables -t mangle -F && iptables -X",
            "ip link delete cni0 2>/dev/null || true",
            "ip link delete flannel.1 2>/dev/null || true",
            "rm -rf /etc/cni /var/lib/cni /var/lib/kubelet /var/lib/etcd /etc/kubernetes \"$HOME/.kube\"",
        ]
        .join("\n"),
    )
}
