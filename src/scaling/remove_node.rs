use log::{info, warn};
use std::time::Duration;

use super::ScalingOperator;
use crate::error::{RemoveNodeError, ScalingError};
use crate::executor::run_checked;
use crate::kubeadm;
use crate::roles::{Role, Topology, MIN_QUORUM};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoveOptions {
    /// Evict unmanaged pods and carry on if the drain still fails.
    pub force: bool,
    /// Wipe kubeadm state from the departing host.
    pub reset: bool,
    pub allow_quorum_loss: bool,
}

impl Default for RemoveOptions {
    fn default() -> Self {
        Self {
            force: false,
            reset: true,
            allow_quorum_loss: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovalReport {
    pub hostname: String,
    pub role: Role,
    pub warnings: Vec<String>,
}

impl RemovalReport {
    fn warn(&mut self, message: String) {
        warn!("{message}");
        self.warnings.push(message);
    }
}

impl ScalingOperator {
    /// Drain `hostname`, reset it and delete it from the cluster, in that
    /// order. Quorum is checked before anything is sent.
    pub async fn remove_node(
        &self,
        topology: &Topology,
        entry: &str,
        hostname: &str,
        options: RemoveOptions,
    ) -> Result<RemovalReport, RemoveNodeError> {
        let target = topology
            .find(hostname)
            .ok_or_else(|| ScalingError::UnknownHost(hostname.to_string()))?;
        let entry = self.entry_point(topology, entry)?;
        if entry.hostname() == target.hostname() {
            return Err(ScalingError::EntryIsTarget(entry.hostname().to_string()).into());
        }

        let name = target.hostname().to_string();
        let mut report = RemovalReport {
            hostname: name.clone(),
            role: target.role,
            warnings: Vec::new(),
        };

        if target.role.is_control_plane() {
            let remaining = topology.control_plane_count().saturating_sub(1);
            if remaining < MIN_QUORUM {
                if !options.allow_quorum_loss {
                    return Err(RemoveNodeError::QuorumViolation {
                        hostname: name,
                        remaining,
                        required: MIN_QUORUM,
                    });
                }
                report.warn(format!(
                    "removing {name} leaves {remaining} control-plane member(s), below quorum"
                ));
            }
        }

        let timeouts = &self.config.timeouts;

        let listed = self.probe(entry).await?.iter().any(|n| n.name == name);
        if !listed {
            report.warn(format!(
                "{name} is not registered with the cluster, skipping drain and delete"
            ));
        } else {
            info!("Draining {name}");
            // kubectl enforces its own drain timeout; allow for it here.
            let drain_timeout =
                timeouts.command() + Duration::from_secs(self.config.drain.timeout_secs);
            let drained = run_checked(
                self.executor.as_ref(),
                &entry.host,
                &kubeadm::drain(&name, &self.config.drain, options.force),
                drain_timeout,
            )
            .await;
            match drained {
                Ok(_) => {}
                Err(reason) if options.force => {
                    report.warn(format!("drain of {name} failed, continuing: {reason}"))
                }
                Err(reason) => {
                    return Err(RemoveNodeError::DrainFailed {
                        hostname: name,
                        reason,
                    })
                }
            }
        }

        if options.reset {
            info!("Resetting {name}");
            if let Err(reason) = run_checked(
                self.executor.as_ref(),
                &target.host,
                &kubeadm::reset(),
                timeouts.command(),
            )
            .await
            {
                report.warn(format!("reset of {name} failed: {reason}"));
            }
        }

        if listed {
            run_checked(
                self.executor.as_ref(),
                &entry.host,
                &kubeadm::delete_node(&name),
                timeouts.command(),
            )
            .await
            .map_err(|reason| RemoveNodeError::DeleteFailed {
                hostname: name.clone(),
                reason,
            })?;
        }

        info!("{name} removed ({} warning(s))", report.warnings.len());
        Ok(report)
    }
}
