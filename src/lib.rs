pub mod config;
pub mod error;
pub mod executor;
pub mod inventory;
pub mod kubeadm;
pub mod orchestrator;
pub mod platform;
pub mod retry_policy;
pub mod roles;
pub mod scaling;

#[cfg(any(test, feature = "test-harness"))]
pub mod test_harness;

pub use crate::config::{load_config, ClusterConfig};
pub use crate::executor::{RemoteExecutor, SshExecutor};
pub use crate::inventory::{Host, Inventory, InventoryFormat};
pub use crate::orchestrator::{Bootstrapper, RunReport};
pub use crate::roles::{Role, RoleLedger, Topology};
pub use crate::scaling::{RemoveOptions, ScalingOperator};
