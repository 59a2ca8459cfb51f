//! Host preparation, split by OS family.
//!
//! Each profile only knows how to install things; what to install and which
//! ports to open is decided by [`prepare_script`] from the member's role and
//! the cluster configuration. Every emitted line can be re-run on an already
//! prepared host.

use std::fmt::Write as _;

use crate::config::ClusterConfig;
use crate::inventory::{OsFamily, OsKind};
use crate::roles::Member;

/// Ports a host must accept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallPlan {
    pub tcp_ports: Vec<u16>,
    pub tcp_range: (u16, u16),
    pub udp_ports: Vec<u16>,
}

impl FirewallPlan {
    pub fn for_member(member: &Member, config: &ClusterConfig) -> Self {
        let firewall = &config.firewall;
        let mut tcp_ports = vec![member.host.ssh_port];
        tcp_ports.extend(&firewall.worker_ports);
        if member.role.is_control_plane() {
            tcp_ports.extend(&firewall.control_plane_ports);
            tcp_ports.push(config.api_server_port);
        }
        tcp_ports.sort_unstable();
        tcp_ports.dedup();

        Self {
            tcp_ports,
            tcp_range: firewall.node_port_range,
            udp_ports: firewall.overlay_udp_ports.clone(),
        }
    }
}

pub trait OsProfile: Send + Sync {
    fn name(&self) -> &'static str;

    /// Base packages, including the NTP daemon.
    fn install_packages(&self) -> Vec<String>;

    fn configure_firewall(&self, plan: &FirewallPlan) -> Vec<String>;

    /// containerd with the systemd cgroup driver.
    fn install_container_runtime(&self) -> Vec<String>;

    /// kubelet, kubeadm and kubectl pinned to `version`; `minor` is the
    /// `v1.28` style package channel.
    fn install_kubernetes_tooling(&self, version: &str, minor: &str) -> Vec<String>;

    /// Service name of the chrony daemon.
    fn chrony_service(&self) -> &'static str;

    fn chrony_config_path(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy)]
pub struct DebianFamily;

#[derive(Debug, Clone, Copy)]
pub struct RhelFamily;

pub fn profile_for(os: OsKind) -> &'static dyn OsProfile {
    match os.family() {
        OsFamily::Debian => &DebianFamily,
        OsFamily::Rhel => &RhelFamily,
    }
}

const CONTAINERD_CONFIG: &[&str] = &[
    "mkdir -p /etc/containerd",
    "containerd config default > /etc/containerd/config.toml",
    "sed -i 's/SystemdCgroup = false/SystemdCgroup = true/' /etc/containerd/config.toml",
    "systemctl enable containerd",
    "systemctl restart containerd",
];

fn lines(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl OsProfile for DebianFamily {
    fn name(&self) -> &'static str {
        "debian"
    }

    fn install_packages(&self) -> Vec<String> {
        lines(&[
            "export DEBIAN_FRONTEND=noninteractive",
            "apt-get update -q",
            "apt-get install -y -q apt-transport-https ca-certificates curl gpg chrony ufw socat conntrack",
        ])
    }

    fn configure_firewall(&self, plan: &FirewallPlan) -> Vec<String> {
        let mut out: Vec<String> = plan
            .tcp_ports
            .iter()
            .map(|port| format!("ufw allow {port}/tcp"))
            .collect();
        out.push(format!(
            "ufw allow {}:{}/tcp",
            plan.tcp_range.0, plan.tcp_range.1
        ));
        out.extend(plan.udp_ports.iter().map(|port| format!("ufw allow {port}/udp")));
        out.push("ufw --force enable".to_string());
        out
    }

    fn install_container_runtime(&self) -> Vec<String> {
        let mut out = lines(&["apt-get install -y -q containerd"]);
        out.extend(lines(CONTAINERD_CONFIG));
        out
    }

    fn install_kubernetes_tooling(&self, version: &str, minor: &str) -> Vec<String> {
        vec![
            "mkdir -p -m 755 /etc/apt/keyrings".to_string(),
            format!(
                "curl -fsSL https://pkgs.k8s.io/core:/stable:/{minor}/deb/Release.key | gpg --dearmor --yes -o /etc/apt/keyrings/kubernetes-apt-keyring.gpg"
            ),
            format!(
                "echo 'deb [signed-by=/etc/apt/keyrings/kubernetes-apt-keyring.gpg] https://pkgs.k8s.io/core:/stable:/{minor}/deb/ /' > /etc/apt/sources.list.d/kubernetes.list"
            ),
            "apt-get update -q".to_string(),
            "apt-mark unhold kubelet kubeadm kubectl >/dev/null 2>&1 || true".to_string(),
            format!(
                "apt-get install -y -q --allow-downgrades kubelet={version}-* kubeadm={version}-* kubectl={version}-*"
            ),
            "apt-mark hold kubelet kubeadm kubectl".to_string(),
            "systemctl enable kubelet".to_string(),
        ]
    }

    fn chrony_service(&self) -> &'static str {
        "chrony"
    }

    fn chrony_config_path(&self) -> &'static str {
        "/etc/chrony/chrony.conf"
    }
}

impl OsProfile for RhelFamily {
    fn name(&self) -> &'static str {
        "rhel"
    }

    fn install_packages(&self) -> Vec<String> {
        lines(&[
            "dnf install -y -q curl chrony firewalld socat conntrack-tools iproute-tc dnf-plugins-core",
            "setenforce 0 || true",
            "sed -i 's/^SELINUX=enforcing$/SELINUX=permissive/' /etc/selinux/config",
        ])
    }

    fn configure_firewall(&self, plan: &FirewallPlan) -> Vec<String> {
        let mut out = vec!["systemctl enable --now firewalld".to_string()];
        out.extend(
            plan.tcp_ports
                .iter()
                .map(|port| format!("firewall-cmd --permanent --add-port={port}/tcp")),
        );
        out.push(format!(
            "firewall-cmd --permanent --add-port={}-{}/tcp",
            plan.tcp_range.0, plan.tcp_range.1
        ));
        out.extend(
            plan.udp_ports
                .iter()
                .map(|port| format!("firewall-cmd --permanent --add-port={port}/udp")),
        );
        out.push("firewall-cmd --permanent --add-masquerade".to_string());
        out.push("firewall-cmd --reload".to_string());
        out
    }

    fn install_container_runtime(&self) -> Vec<String> {
        let mut out = lines(&[
            "dnf config-manager --add-repo https://download.docker.com/linux/centos/docker-ce.repo",
            "dnf install -y -q containerd.io",
        ]);
        out.extend(lines(CONTAINERD_CONFIG));
        out
    }

    fn install_kubernetes_tooling(&self, version: &str, minor: &str) -> Vec<String> {
        vec![
            format!(
                "cat > /etc/yum.repos.d/kubernetes.repo <<'EOF'\n[kubernetes]\nname=Kubernetes\nbaseurl=https://pkgs.k8s.io/core:/stable:/{minor}/rpm/\nenabled=1\ngpgcheck=1\ngpgkey=https://pkgs.k8s.io/core:/stable:/{minor}/rpm/repodata/repomd.xml.key\nexclude=kubelet kubeadm kubectl cri-tools kubernetes-cni\nEOF"
            ),
            format!(
                "dnf install -y -q kubelet-{version} kubeadm-{version} kubectl-{version} --disableexcludes=kubernetes"
            ),
            "systemctl enable kubelet".to_string(),
        ]
    }

    fn chrony_service(&self) -> &'static str {
        "chronyd"
    }

    fn chrony_config_path(&self) -> &'static str {
        "/etc/chrony.conf"
    }
}

/// Full preparation script for one member.
pub fn prepare_script(member: &Member, config: &ClusterConfig) -> String {
    let profile = profile_for(member.host.os);
    let mut script = String::from("set -euo pipefail\n");

    let mut section = |title: &str, body: Vec<String>| {
        let _ = writeln!(script, "\n# {title}");
        for line in body {
            let _ = writeln!(script, "{line}");
        }
    };

    section(
        "identity",
        vec![format!("hostnamectl set-hostname {}", member.hostname())],
    );
    section("packages", profile.install_packages());

    let mut time = vec![format!("timedatectl set-timezone {}", config.timezone)];
    if !config.ntp_servers.is_empty() {
        let conf = profile.chrony_config_path();
        time.push(format!("sed -i '/^pool /d;/^server /d' {conf}"));
        time.extend(
            config
                .ntp_servers
                .iter()
                .map(|server| format!("echo 'server {server} iburst' >> {conf}")),
        );
    }
    time.push(format!("systemctl enable {}", profile.chrony_service()));
    time.push(format!("systemctl restart {}", profile.chrony_service()));
    section("time", time);

    section(
        "swap",
        lines(&["swapoff -a", "sed -i '/\\sswap\\s/ s/^[^#]/#&/' /etc/fstab"]),
    );
    section(
        "kernel",
        lines(&[
            "printf 'overlay\\nbr_netfilter\\n' > /etc/modules-load.d/k8s.conf",
            "modprobe overlay",
            "modprobe br_netfilter",
            "printf 'net.bridge.bridge-nf-call-iptables = 1\\nnet.bridge.bridge-nf-call-ip6tables = 1\\nnet.ipv4.ip_forward = 1\\n' > /etc/sysctl.d/k8s.conf",
            "sysctl --system >/dev/null",
        ]),
    );
    section(
        "firewall",
        profile.configure_firewall(&FirewallPlan::for_member(member, config)),
    );
    section("container runtime", profile.install_container_runtime());
    section(
        "kubernetes tooling",
        profile.install_kubernetes_tooling(&config.kubernetes_version, &config.kubernetes_minor()),
    );

    script
}
