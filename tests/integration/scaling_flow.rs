//! Growing and shrinking a running cluster, with the role ledger kept in step.

use std::sync::Arc;

use kube_bootstrap::error::{AddNodeError, RemoveNodeError, ScalingError};
use kube_bootstrap::inventory::Host;
use kube_bootstrap::kubeadm::labels;
use kube_bootstrap::roles::{Role, RoleLedger};
use kube_bootstrap::scaling::{RemoveOptions, ScalingOperator};
use kube_bootstrap::test_harness::{test_config, test_inventory, ScriptedExecutor};
use tempfile::TempDir;

#[tokio::test]
async fn test_add_then_remove_worker_updates_ledger() {
    let dir = TempDir::new().unwrap();
    let ledger_path = dir.path().join("hosts.yaml.roles.json");

    // Bootstrapped earlier with three hosts; node-4 was appended since.
    let mut ledger = RoleLedger::default();
    ledger.resolve(&test_inventory(3), 3).unwrap();
    ledger.save(&ledger_path).unwrap();

    let inventory = test_inventory(4);
    let mut ledger = RoleLedger::load(&ledger_path).unwrap();
    let topology = ledger.resolve(&inventory, 3).unwrap();
    assert_eq!(topology.find("node-4").unwrap().role, Role::Worker);

    let executor = ScriptedExecutor::healthy_cluster(&["node-1", "node-2", "node-3"]);
    let operator = ScalingOperator::new(test_config(), Arc::new(executor.clone()));

    let new_host = inventory.find("10.0.0.4").unwrap().clone();
    let member = operator
        .add_node(&topology, "node-1", &new_host, Role::Worker)
        .await
        .unwrap();
    ledger.record(member.hostname(), member.role);
    ledger.save(&ledger_path).unwrap();
    assert_eq!(
        RoleLedger::load(&ledger_path).unwrap().role_of("node-4"),
        Some(Role::Worker)
    );

    // The cluster now lists node-4 as well.
    executor
        .on(labels::LIST_NODES)
        .reply(&kube_bootstrap::test_harness::node_listing(&[
            "node-1", "node-2", "node-3", "node-4",
        ]));
    executor.clear_calls();

    let report = operator
        .remove_node(&topology, "node-2", "node-4", RemoveOptions::default())
        .await
        .unwrap();
    assert!(report.warnings.is_empty());
    assert_eq!(
        executor.labels(),
        vec![
            labels::LIST_NODES,
            labels::DRAIN,
            labels::RESET,
            labels::DELETE_NODE
        ]
    );

    ledger.forget(&report.hostname);
    ledger.save(&ledger_path).unwrap();
    assert_eq!(RoleLedger::load(&ledger_path).unwrap().role_of("node-4"), None);
}

#[tokio::test]
async fn test_control_plane_cannot_shrink_below_quorum() {
    let inventory = test_inventory(4);
    let topology = RoleLedger::default().resolve(&inventory, 3).unwrap();
    let executor = ScriptedExecutor::healthy_cluster(&["node-1", "node-2", "node-3", "node-4"]);
    let operator = ScalingOperator::new(test_config(), Arc::new(executor.clone()));

    for target in ["node-2", "node-3"] {
        let err = operator
            .remove_node(&topology, "node-1", target, RemoveOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RemoveNodeError::QuorumViolation { .. }));
    }
    assert!(executor.calls().is_empty());
}

#[tokio::test]
async fn test_grow_control_plane_then_remove_one() {
    let inventory = test_inventory(3);
    let mut topology_hosts: Vec<Host> = inventory.hosts().to_vec();
    topology_hosts.push(Host::new("node-4", "10.0.0.4"));
    let grown = kube_bootstrap::inventory::Inventory::new(topology_hosts).unwrap();

    let mut ledger = RoleLedger::default();
    ledger.resolve(&inventory, 3).unwrap();

    let executor = ScriptedExecutor::healthy_cluster(&["node-1", "node-2", "node-3"]);
    let operator = ScalingOperator::new(test_config(), Arc::new(executor.clone()));
    let topology = ledger.resolve(&grown, 3).unwrap();

    let member = operator
        .add_node(
            &topology,
            "node-1",
            grown.find("node-4").unwrap(),
            Role::ControlPlane,
        )
        .await
        .unwrap();
    ledger.record(member.hostname(), member.role);
    assert_eq!(executor.count_on(labels::JOIN_CONTROL_PLANE, "node-4"), 1);

    // Four control-plane members now; one can go.
    let topology = ledger.resolve(&grown, 3).unwrap();
    assert_eq!(topology.control_plane_count(), 4);
    executor
        .on(labels::LIST_NODES)
        .reply(&kube_bootstrap::test_harness::node_listing(&[
            "node-1", "node-2", "node-3", "node-4",
        ]));

    let report = operator
        .remove_node(&topology, "node-4", "node-3", RemoveOptions::default())
        .await
        .unwrap();
    assert_eq!(report.role, Role::Hybrid);
    assert_eq!(executor.count_on(labels::DRAIN, "node-4"), 1);
}

#[tokio::test]
async fn test_worker_cannot_coordinate() {
    let inventory = test_inventory(4);
    let topology = RoleLedger::default().resolve(&inventory, 3).unwrap();
    let executor = ScriptedExecutor::new();
    let operator = ScalingOperator::new(test_config(), Arc::new(executor.clone()));

    let err = operator
        .add_node(
            &topology,
            "node-4",
            &Host::new("node-5", "10.0.0.5"),
            Role::Worker,
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AddNodeError::Scaling(ScalingError::EntryNotControlPlane(_))
    ));
    assert!(executor.calls().is_empty());
}

#[tokio::test]
async fn test_add_all_new_hosts_records_successes() {
    let dir = TempDir::new().unwrap();
    let ledger_path = dir.path().join("hosts.yaml.roles.json");

    let mut ledger = RoleLedger::default();
    let topology = ledger.resolve(&test_inventory(6), 3).unwrap();
    let executor = ScriptedExecutor::healthy_cluster(&["node-1", "node-2", "node-3", "node-4"]);
    executor
        .on(labels::JOIN_CONTROL_PLANE)
        .host("node-6")
        .exit(1, "connection to the api server timed out");
    let operator = ScalingOperator::new(test_config(), Arc::new(executor.clone()));

    let report = operator
        .add_nodes(&topology, "node-3", Role::ControlPlane)
        .await
        .unwrap();
    for member in &report.added {
        ledger.record(member.hostname(), member.role);
    }
    ledger.save(&ledger_path).unwrap();

    assert_eq!(report.added.len(), 1);
    assert_eq!(report.failed[0].0, "node-6");
    assert!(matches!(report.failed[0].1, AddNodeError::JoinFailed { .. }));
    assert_eq!(executor.count(labels::PREPARE), 2);
    assert_eq!(
        RoleLedger::load(&ledger_path).unwrap().role_of("node-5"),
        Some(Role::ControlPlane)
    );
    // The failed host keeps its positional role.
    assert_eq!(
        RoleLedger::load(&ledger_path).unwrap().role_of("node-6"),
        Some(Role::Worker)
    );
}
