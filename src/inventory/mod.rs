//! Inventory model: the ordered list of hosts a cluster is built from.
//!
//! Three on-disk encodings are accepted (structured YAML lists, INI sections
//! and CSV rows) and all of them normalize to the same [`Host`] shape. Parsing
//! is pure; nothing here touches the network.

mod ini;
mod normalize;
mod tabular;
mod yaml;

use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use crate::error::{ParseError, RenderError};

pub const DEFAULT_SSH_USER: &str = "root";
pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_OS_VERSION: &str = "22.04";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OsKind {
    Ubuntu,
    Centos,
    Rocky,
}

/// Package-manager family an [`OsKind`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsFamily {
    Debian,
    Rhel,
}

impl OsKind {
    pub fn family(self) -> OsFamily {
        match self {
            OsKind::Ubuntu => OsFamily::Debian,
            OsKind::Centos | OsKind::Rocky => OsFamily::Rhel,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OsKind::Ubuntu => "ubuntu",
            OsKind::Centos => "centos",
            OsKind::Rocky => "rocky",
        }
    }
}

impl FromStr for OsKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ubuntu" => Ok(OsKind::Ubuntu),
            "centos" => Ok(OsKind::Centos),
            "rocky" | "rockylinux" => Ok(OsKind::Rocky),
            other => Err(format!("unsupported operating system: {other}")),
        }
    }
}

impl fmt::Display for OsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One cluster member as described by the inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Host {
    pub hostname: String,
    #[serde(rename = "ip_address")]
    pub address: String,
    #[serde(rename = "username")]
    pub ssh_user: String,
    pub ssh_port: u16,
    pub os: OsKind,
    pub os_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_address: Option<String>,
}

impl Host {
    pub fn new(hostname: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            address: address.into(),
            ssh_user: DEFAULT_SSH_USER.to_string(),
            ssh_port: DEFAULT_SSH_PORT,
            os: OsKind::Ubuntu,
            os_version: DEFAULT_OS_VERSION.to_string(),
            private_address: None,
        }
    }

    pub fn with_os(mut self, os: OsKind, version: impl Into<String>) -> Self {
        self.os = os;
        self.os_version = version.into();
        self
    }

    pub fn with_private_address(mut self, address: impl Into<String>) -> Self {
        self.private_address = Some(address.into());
        self
    }

    /// Address used for intra-cluster traffic.
    pub fn cluster_address(&self) -> &str {
        self.private_address.as_deref().unwrap_or(&self.address)
    }

    /// True when `identifier` names this host by hostname or by address.
    pub fn matches(&self, identifier: &str) -> bool {
        self.hostname == identifier
            || self.address == identifier
            || self.private_address.as_deref() == Some(identifier)
    }
}

impl AsRef<Host> for Host {
    fn as_ref(&self) -> &Host {
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InventoryFormat {
    /// Structured list (YAML).
    Yaml,
    /// Key-value sections (INI).
    Ini,
    /// Tabular rows with a header (CSV).
    Csv,
}

impl InventoryFormat {
    pub const ALL: [InventoryFormat; 3] = [
        InventoryFormat::Yaml,
        InventoryFormat::Ini,
        InventoryFormat::Csv,
    ];

    pub fn from_path(path: &Path) -> Result<Self, ParseError> {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .unwrap_or_default();

        match extension.as_str() {
            "yaml" | "yml" => Ok(InventoryFormat::Yaml),
            "ini" | "cfg" => Ok(InventoryFormat::Ini),
            "csv" => Ok(InventoryFormat::Csv),
            "" => Err(ParseError::UnsupportedFormat(format!(
                "{} has no file extension",
                path.display()
            ))),
            other => Err(ParseError::UnsupportedFormat(format!(".{other}"))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            InventoryFormat::Yaml => "yaml",
            InventoryFormat::Ini => "ini",
            InventoryFormat::Csv => "csv",
        }
    }
}

impl FromStr for InventoryFormat {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "yaml" | "yml" => Ok(InventoryFormat::Yaml),
            "ini" | "cfg" => Ok(InventoryFormat::Ini),
            "csv" => Ok(InventoryFormat::Csv),
            other => Err(ParseError::UnsupportedFormat(other.to_string())),
        }
    }
}

impl fmt::Display for InventoryFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Ordered, duplicate-free set of hosts. Order drives default role assignment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inventory {
    hosts: Vec<Host>,
}

impl Inventory {
    pub fn new(hosts: Vec<Host>) -> Result<Self, ParseError> {
        let mut seen = HashSet::new();
        for host in &hosts {
            if !seen.insert(host.hostname.as_str()) {
                return Err(ParseError::DuplicateHost {
                    hostname: host.hostname.clone(),
                });
            }
        }
        Ok(Self { hosts })
    }

    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Host> {
        self.hosts.iter()
    }

    /// Look a host up by hostname first, then by address.
    pub fn find(&self, identifier: &str) -> Option<&Host> {
        self.hosts
            .iter()
            .find(|host| host.hostname == identifier)
            .or_else(|| self.hosts.iter().find(|host| host.matches(identifier)))
    }

    pub fn render(&self, format: InventoryFormat) -> Result<String, RenderError> {
        match format {
            InventoryFormat::Yaml => yaml::render(&self.hosts),
            InventoryFormat::Ini => Ok(ini::render(&self.hosts)),
            InventoryFormat::Csv => tabular::render(&self.hosts),
        }
    }
}

/// Parse inventory text in the given format.
pub fn parse(source: &str, format: InventoryFormat) -> Result<Inventory, ParseError> {
    let entries = match format {
        InventoryFormat::Yaml => yaml::entries(source)?,
        InventoryFormat::Ini => ini::entries(source)?,
        InventoryFormat::Csv => tabular::entries(source)?,
    };

    let hosts = entries
        .iter()
        .enumerate()
        .map(|(index, entry)| normalize::host(index + 1, entry))
        .collect::<Result<Vec<_>, _>>()?;

    Inventory::new(hosts)
}

/// Read and parse an inventory file, detecting the format from its extension
/// unless one is forced.
pub fn load(path: &Path, format: Option<InventoryFormat>) -> Result<Inventory, ParseError> {
    let format = match format {
        Some(format) => format,
        None => InventoryFormat::from_path(path)?,
    };

    let source = fs::read_to_string(path).map_err(|source| ParseError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let inventory = parse(&source, format)?;
    log::debug!(
        "Parsed {} host(s) from {} ({format})",
        inventory.len(),
        path.display()
    );
    Ok(inventory)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_hosts() -> Inventory {
        Inventory::new(vec![
            Host::new("node-1", "10.0.0.1").with_private_address("192.168.0.1"),
            Host::new("node-2", "10.0.0.2"),
            Host::new("node-3", "10.0.0.3").with_os(OsKind::Rocky, "9.3"),
        ])
        .unwrap()
    }

    #[test]
    fn test_format_detection() {
        assert_eq!(
            InventoryFormat::from_path(Path::new("hosts.yml")).unwrap(),
            InventoryFormat::Yaml
        );
        assert_eq!(
            InventoryFormat::from_path(Path::new("hosts.CFG")).unwrap(),
            InventoryFormat::Ini
        );
        assert_eq!(
            InventoryFormat::from_path(Path::new("inventory/hosts.csv")).unwrap(),
            InventoryFormat::Csv
        );
        assert!(matches!(
            InventoryFormat::from_path(Path::new("hosts.json")),
            Err(ParseError::UnsupportedFormat(_))
        ));
        assert!(matches!(
            InventoryFormat::from_path(Path::new("hosts")),
            Err(ParseError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_duplicate_hosts_rejected_by_constructor() {
        let result = Inventory::new(vec![
            Host::new("node-1", "10.0.0.1"),
            Host::new("node-1", "10.0.0.2"),
        ]);
        assert!(matches!(
            result,
            Err(ParseError::DuplicateHost { hostname }) if hostname == "node-1"
        ));
    }

    #[test]
    fn test_parse_rejects_duplicate_hosts_in_every_shape() {
        let sources = [
            ("hosts:\n  - {hostname: a, ip: 10.0.0.1}\n  - {hostname: a, ip: 10.0.0.2}\n", InventoryFormat::Yaml),
            ("a:\n  ip: 10.0.0.1\na:\n  ip: 10.0.0.2\n", InventoryFormat::Yaml),
            ("[a]\nip = 10.0.0.1\n[b]\nhostname = a\nip = 10.0.0.2\n", InventoryFormat::Ini),
            ("hostname,ip\na,10.0.0.1\na,10.0.0.2\n", InventoryFormat::Csv),
        ];
        for (source, format) in sources {
            assert!(
                matches!(
                    parse(source, format),
                    Err(ParseError::DuplicateHost { ref hostname }) if hostname == "a"
                ),
                "{format}: {source:?}"
            );
        }
    }

    #[test]
    fn test_find_by_hostname_or_address() {
        let inventory = three_hosts();
        assert_eq!(inventory.find("node-2").unwrap().address, "10.0.0.2");
        assert_eq!(inventory.find("10.0.0.3").unwrap().hostname, "node-3");
        assert_eq!(inventory.find("192.168.0.1").unwrap().hostname, "node-1");
        assert!(inventory.find("node-9").is_none());
    }

    #[test]
    fn test_render_and_reparse_every_format() {
        let inventory = three_hosts();
        for format in InventoryFormat::ALL {
            let text = inventory.render(format).unwrap();
            let reparsed = parse(&text, format).unwrap();
            assert_eq!(reparsed, inventory, "round trip through {format}");
        }
    }

    #[test]
    fn test_cluster_address_prefers_private() {
        let inventory = three_hosts();
        assert_eq!(inventory.hosts()[0].cluster_address(), "192.168.0.1");
        assert_eq!(inventory.hosts()[1].cluster_address(), "10.0.0.2");
    }

    #[test]
    fn test_os_family() {
        assert_eq!(OsKind::Ubuntu.family(), OsFamily::Debian);
        assert_eq!(OsKind::Centos.family(), OsFamily::Rhel);
        assert_eq!("Rocky".parse::<OsKind>().unwrap(), OsKind::Rocky);
        assert!("windows".parse::<OsKind>().is_err());
    }
}
