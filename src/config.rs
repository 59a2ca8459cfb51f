use anyhow::Context;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::retry_policy::RetryPolicy;
use crate::roles::MIN_QUORUM;

pub const ENV_PREFIX: &str = "KUBE_BOOTSTRAP";

/// A value that must never be logged or written back out.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

// Serialized dumps never carry the secret value.
impl Serialize for Secret {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("<redacted>")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub kubernetes_version: String,
    pub pod_network_cidr: String,
    pub service_cidr: String,
    pub control_plane_size: usize,
    pub api_server_port: u16,
    /// `host:port` clients use to reach the API server; defaults to the first
    /// control-plane member.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control_plane_endpoint: Option<String>,
    pub timezone: String,
    pub ntp_servers: Vec<String>,
    pub firewall: FirewallConfig,
    pub addons: AddonsConfig,
    pub timeouts: TimeoutsConfig,
    pub execution: ExecutionConfig,
    pub ssh: SshConfig,
    pub drain: DrainConfig,
    #[serde(skip_serializing)]
    pub secrets: SecretsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FirewallConfig {
    pub control_plane_ports: Vec<u16>,
    pub worker_ports: Vec<u16>,
    pub node_port_range: (u16, u16),
    /// Overlay network (flannel VXLAN) ports, UDP.
    pub overlay_udp_ports: Vec<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AddonsConfig {
    pub cni_manifest: String,
    pub cni_namespace: String,
    pub storage_manifest: String,
    pub storage_namespace: String,
    pub storage_class: String,
}

/// All values in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    pub command_secs: u64,
    pub prepare_secs: u64,
    pub init_secs: u64,
    pub join_secs: u64,
    pub addon_ready_secs: u64,
    pub health_secs: u64,
    pub node_ready_secs: u64,
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Upper bound on hosts driven at once within a phase; unset is unbounded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    pub addon_retry: RetryPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub program: String,
    pub connect_timeout_secs: u64,
    pub strict_host_key_checking: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub known_hosts_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DrainConfig {
    pub grace_period_secs: u64,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretsConfig {
    /// kubeadm certificate key (32 bytes, hex) protecting the uploaded
    /// control-plane certificates.
    pub certificate_key: Option<Secret>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            kubernetes_version: "1.28.0".to_string(),
            pod_network_cidr: "10.244.0.0/16".to_string(),
            service_cidr: "10.96.0.0/12".to_string(),
            control_plane_size: MIN_QUORUM,
            api_server_port: 6443,
            control_plane_endpoint: None,
            timezone: "UTC".to_string(),
            ntp_servers: vec!["pool.ntp.org".to_string(), "time.google.com".to_string()],
            firewall: FirewallConfig::default(),
            addons: AddonsConfig::default(),
            timeouts: TimeoutsConfig::default(),
            execution: ExecutionConfig::default(),
            ssh: SshConfig::default(),
            drain: DrainConfig::default(),
            secrets: SecretsConfig::default(),
        }
    }
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            control_plane_ports: vec![6443, 2379, 2380, 10250, 10257, 10259],
            worker_ports: vec![22, 80, 443, 10250, 10256],
            node_port_range: (30000, 32767),
            overlay_udp_ports: vec![8472],
        }
    }
}

impl Default for AddonsConfig {
    fn default() -> Self {
        Self {
            cni_manifest:
                "https://raw.githubusercontent.com/flannel-io/flannel/master/Documentation/kube-flannel.yml"
                    .to_string(),
            cni_namespace: "kube-flannel".to_string(),
            storage_manifest:
                "https://raw.githubusercontent.com/rancher/local-path-provisioner/master/deploy/local-path-storage.yaml"
                    .to_string(),
            storage_namespace: "local-path-storage".to_string(),
            storage_class: "local-path".to_string(),
        }
    }
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            command_secs: 300,
            prepare_secs: 600,
            init_secs: 900,
            join_secs: 600,
            addon_ready_secs: 300,
            health_secs: 300,
            node_ready_secs: 300,
            poll_interval_secs: 10,
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            concurrency: None,
            addon_retry: RetryPolicy::default(),
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            program: "ssh".to_string(),
            connect_timeout_secs: 10,
            strict_host_key_checking: "accept-new".to_string(),
            identity_file: None,
            known_hosts_file: None,
        }
    }
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: 30,
            timeout_secs: 300,
        }
    }
}

impl TimeoutsConfig {
    pub fn command(&self) -> Duration {
        Duration::from_secs(self.command_secs)
    }

    pub fn prepare(&self) -> Duration {
        Duration::from_secs(self.prepare_secs)
    }

    pub fn init(&self) -> Duration {
        Duration::from_secs(self.init_secs)
    }

    pub fn join(&self) -> Duration {
        Duration::from_secs(self.join_secs)
    }

    pub fn addon_ready(&self) -> Duration {
        Duration::from_secs(self.addon_ready_secs)
    }

    pub fn health(&self) -> Duration {
        Duration::from_secs(self.health_secs)
    }

    pub fn node_ready(&self) -> Duration {
        Duration::from_secs(self.node_ready_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl ClusterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.control_plane_size < MIN_QUORUM {
            return invalid(format!(
                "control_plane_size must be at least {MIN_QUORUM}, got {}",
                self.control_plane_size
            ));
        }

        if self.kubernetes_version.split('.').count() != 3 {
            return invalid(format!(
                "kubernetes_version must look like 1.28.0, got {}",
                self.kubernetes_version
            ));
        }

        if self.api_server_port == 0 {
            return invalid("api_server_port must be greater than 0".to_string());
        }

        if self.execution.concurrency == Some(0) {
            return invalid("execution.concurrency must be greater than 0".to_string());
        }

        let t = &self.timeouts;
        for (name, value) in [
            ("command_secs", t.command_secs),
            ("prepare_secs", t.prepare_secs),
            ("init_secs", t.init_secs),
            ("join_secs", t.join_secs),
            ("addon_ready_secs", t.addon_ready_secs),
            ("node_ready_secs", t.node_ready_secs),
            ("health_secs", t.health_secs),
            ("poll_interval_secs", t.poll_interval_secs),
        ] {
            if value == 0 {
                return invalid(format!("timeouts.{name} must be greater than 0"));
            }
        }

        if self.ssh.connect_timeout_secs == 0 {
            return invalid("ssh.connect_timeout_secs must be greater than 0".to_string());
        }

        let (low, high) = self.firewall.node_port_range;
        if low > high {
            return invalid(format!("firewall.node_port_range {low}-{high} is empty"));
        }

        self.execution
            .addon_retry
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("execution.addon_retry: {e}")))?;

        if let Some(key) = &self.secrets.certificate_key {
            validate_certificate_key(key)?;
        }

        Ok(())
    }

    /// The certificate key, or a fail-fast error when none was supplied.
    pub fn certificate_key(&self) -> Result<&Secret, ConfigError> {
        self.secrets
            .certificate_key
            .as_ref()
            .ok_or(ConfigError::MissingSecret("secrets.certificate_key"))
    }

    /// `v1.28` style minor release, used for package repositories.
    pub fn kubernetes_minor(&self) -> String {
        let mut parts = self.kubernetes_version.trim_start_matches('v').split('.');
        match (parts.next(), parts.next()) {
            (Some(major), Some(minor)) => format!("v{major}.{minor}"),
            _ => format!("v{}", self.kubernetes_version),
        }
    }
}

fn validate_certificate_key(key: &Secret) -> Result<(), ConfigError> {
    let value = key.expose();
    if value.len() != 64 || !value.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ConfigError::Invalid(
            "secrets.certificate_key must be 64 hexadecimal characters".to_string(),
        ));
    }
    Ok(())
}

/// Load configuration: env vars > config file > defaults
pub fn load_config(config_path: Option<&Path>) -> Result<ClusterConfig, ConfigError> {
    let mut builder = config::Config::builder();

    if let Some(path) = config_path {
        if !path.exists() {
            return Err(ConfigError::Invalid(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        builder = builder.add_source(config::File::from(path));
        info!("Loading configuration from file: {}", path.display());
    }

    let settings = builder
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("ntp_servers"),
        )
        .build()?;

    let config: ClusterConfig = settings.try_deserialize()?;
    config.validate()?;

    debug!("Final config: {config:?}");
    Ok(config)
}

/// Create a sample configuration file
pub fn create_sample_config(path: &Path) -> anyhow::Result<()> {
    let config = ClusterConfig::default();
    let toml_content =
        toml::to_string_pretty(&config).context("Failed to serialize default config")?;

    fs::write(path, toml_content)
        .with_context(|| format!("Failed to write sample config to: {}", path.display()))?;

    println!("Sample configuration written to: {}", path.display());
    Ok(())
}
