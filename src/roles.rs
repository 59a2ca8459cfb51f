//! Role assignment and the persisted role ledger.
//!
//! The positional rule (first N hosts run the control plane) is only applied
//! once. After that the ledger, keyed by hostname, is the source of truth so a
//! reordered inventory file cannot silently move control-plane duty around.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{AssignmentError, LedgerError};
use crate::inventory::{Host, Inventory};

/// Smallest control plane that survives the loss of one member.
pub const MIN_QUORUM: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    ControlPlane,
    Worker,
    /// Control-plane member that also runs workloads.
    Hybrid,
}

impl Role {
    /// Participates in etcd quorum.
    pub fn is_control_plane(self) -> bool {
        matches!(self, Role::ControlPlane | Role::Hybrid)
    }

    pub fn runs_workloads(self) -> bool {
        matches!(self, Role::Worker | Role::Hybrid)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::ControlPlane => "control-plane",
            Role::Worker => "worker",
            Role::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "control-plane" | "controlplane" | "master" => Ok(Role::ControlPlane),
            "worker" => Ok(Role::Worker),
            "hybrid" => Ok(Role::Hybrid),
            other => Err(format!("unknown node role: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Member {
    #[serde(flatten)]
    pub host: Host,
    pub role: Role,
}

impl Member {
    pub fn hostname(&self) -> &str {
        &self.host.hostname
    }
}

impl AsRef<Host> for Member {
    fn as_ref(&self) -> &Host {
        &self.host
    }
}

/// Inventory hosts with roles attached, in inventory order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(transparent)]
pub struct Topology {
    members: Vec<Member>,
}

impl Topology {
    pub fn new(members: Vec<Member>) -> Self {
        Self { members }
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn control_plane(&self) -> impl Iterator<Item = &Member> {
        self.members.iter().filter(|m| m.role.is_control_plane())
    }

    pub fn control_plane_count(&self) -> usize {
        self.control_plane().count()
    }

    /// Members that run workloads only.
    pub fn workers(&self) -> impl Iterator<Item = &Member> {
        self.members.iter().filter(|m| !m.role.is_control_plane())
    }

    /// The member that initializes the cluster and later hosts addon installs.
    pub fn first_control_plane(&self) -> Option<&Member> {
        self.control_plane().next()
    }

    pub fn find(&self, identifier: &str) -> Option<&Member> {
        self.members
            .iter()
            .find(|m| m.host.hostname == identifier)
            .or_else(|| self.members.iter().find(|m| m.host.matches(identifier)))
    }

    pub fn ensure_quorum(&self) -> Result<(), AssignmentError> {
        let hosts = self.control_plane_count();
        if hosts < MIN_QUORUM {
            return Err(AssignmentError::QuorumTooSmall {
                hosts,
                required: MIN_QUORUM,
            });
        }
        Ok(())
    }
}

/// Positional assignment: the first `control_plane_size` hosts become
/// [`Role::Hybrid`], everything after them [`Role::Worker`].
pub fn assign_roles(
    inventory: &Inventory,
    control_plane_size: usize,
) -> Result<Topology, AssignmentError> {
    let required = control_plane_size.max(MIN_QUORUM);
    if inventory.len() < required {
        return Err(AssignmentError::QuorumTooSmall {
            hosts: inventory.len(),
            required,
        });
    }

    let members = inventory
        .iter()
        .enumerate()
        .map(|(index, host)| Member {
            host: host.clone(),
            role: if index < control_plane_size {
                Role::Hybrid
            } else {
                Role::Worker
            },
        })
        .collect();

    Ok(Topology { members })
}

/// Roles recorded the first time they were assigned, keyed by hostname.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleLedger {
    #[serde(default = "default_version")]
    pub version: u8,
    #[serde(default)]
    roles: BTreeMap<String, Role>,
}

fn default_version() -> u8 {
    1
}

impl RoleLedger {
    /// Default ledger location for an inventory file: `<inventory>.roles.json`.
    pub fn default_path(inventory_path: &Path) -> PathBuf {
        let mut name = inventory_path.as_os_str().to_os_string();
        name.push(".roles.json");
        PathBuf::from(name)
    }

    /// Load a ledger; a missing file is an empty ledger.
    pub fn load(path: &Path) -> Result<Self, LedgerError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(LedgerError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        serde_json::from_str(&content).map_err(|source| LedgerError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), LedgerError> {
        let io_err = |source| LedgerError::Io {
            path: path.to_path_buf(),
            source,
        };
        let json = serde_json::to_string_pretty(self).map_err(|source| LedgerError::Corrupt {
            path: path.to_path_buf(),
            source,
        })?;

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(io_err)?;
        fs::rename(&tmp, path).map_err(io_err)
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }

    pub fn role_of(&self, hostname: &str) -> Option<Role> {
        self.roles.get(hostname).copied()
    }

    pub fn record(&mut self, hostname: &str, role: Role) {
        self.roles.insert(hostname.to_string(), role);
    }

    pub fn forget(&mut self, hostname: &str) -> Option<Role> {
        self.roles.remove(hostname)
    }

    /// Attach roles to `inventory`. An empty ledger is seeded with the
    /// positional assignment; otherwise recorded roles win and hosts the ledger
    /// has never seen are workers.
    pub fn resolve(
        &mut self,
        inventory: &Inventory,
        control_plane_size: usize,
    ) -> Result<Topology, AssignmentError> {
        if self.roles.is_empty() {
            let topology = assign_roles(inventory, control_plane_size)?;
            for member in topology.members() {
                self.record(member.hostname(), member.role);
            }
            info!(
                "Assigned roles for {} host(s): {} control-plane",
                topology.len(),
                topology.control_plane_count()
            );
            return Ok(topology);
        }

        let mut reordered = false;
        let members: Vec<Member> = inventory
            .iter()
            .enumerate()
            .map(|(index, host)| {
                let role = match self.role_of(&host.hostname) {
                    Some(role) => {
                        let positional = if index < control_plane_size {
                            Role::Hybrid
                        } else {
                            Role::Worker
                        };
                        if role.is_control_plane() != positional.is_control_plane() {
                            reordered = true;
                        }
                        role
                    }
                    None => {
                        warn!(
                            "{} has no recorded role, treating it as a worker",
                            host.hostname
                        );
                        Role::Worker
                    }
                };
                Member {
                    host: host.clone(),
                    role,
                }
            })
            .collect();

        if reordered {
            warn!("Inventory order no longer matches recorded roles, keeping recorded roles");
        }
        for hostname in self.roles.keys() {
            if inventory.find(hostname).is_none() {
                warn!("{hostname} has a recorded role but is missing from the inventory");
            }
        }

        Ok(Topology { members })
    }
}
