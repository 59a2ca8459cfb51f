//! Full bootstrap runs from an inventory file to a run report.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use kube_bootstrap::error::{ExecError, PreflightError};
use kube_bootstrap::inventory;
use kube_bootstrap::kubeadm::labels;
use kube_bootstrap::orchestrator::{Bootstrapper, Phase, RunOutcome, StepStatus};
use kube_bootstrap::roles::{RoleLedger, Topology};
use kube_bootstrap::test_harness::{test_config, ScriptedExecutor};
use tempfile::TempDir;

use super::poll_until;

const FLEET: [&str; 4] = ["cp-1", "cp-2", "cp-3", "worker-1"];

fn fixture_topology() -> Topology {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/inventory.yaml");
    let inventory = inventory::load(&path, None).unwrap();
    RoleLedger::default().resolve(&inventory, 3).unwrap()
}

fn bootstrapper(executor: &ScriptedExecutor) -> Bootstrapper {
    Bootstrapper::new(
        test_config(),
        fixture_topology(),
        Arc::new(executor.clone()),
    )
    .unwrap()
}

#[tokio::test]
async fn test_fixture_fleet_bootstraps_and_reports() {
    let _ = env_logger::try_init();
    let executor = ScriptedExecutor::healthy_cluster(&FLEET);

    let report = bootstrapper(&executor).run().await;
    assert!(matches!(report.outcome, RunOutcome::Succeeded));
    assert_eq!(report.exit_code(), 0);

    // Each host gets packages for its own OS family.
    let prepare = |host: &str| executor.calls_for(host)[0].body.clone();
    assert!(prepare("cp-1").contains("apt-get install"));
    assert!(prepare("worker-1").contains("dnf install"));

    assert_eq!(executor.count_on(labels::INIT, "cp-1"), 1);
    assert_eq!(executor.count(labels::INIT), 1);
    assert_eq!(executor.count(labels::JOIN_CONTROL_PLANE), 2);
    assert_eq!(executor.count_on(labels::JOIN_WORKER, "worker-1"), 1);

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("report.json");
    report.write_json(&path).unwrap();
    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(json["outcome"], "succeeded");
    assert_eq!(json["record"]["phases"].as_array().unwrap().len(), Phase::ALL.len());
    assert_eq!(json["record"]["phases"][0]["phase"], "prepare");
    // The certificate key never lands in the report.
    assert!(!std::fs::read_to_string(&path)
        .unwrap()
        .contains(kube_bootstrap::test_harness::TEST_CERTIFICATE_KEY));
}

#[tokio::test]
async fn test_progress_is_observable_while_running() {
    let executor = ScriptedExecutor::healthy_cluster(&FLEET);
    let bootstrapper = bootstrapper(&executor);
    let run = tokio::spawn(async move { bootstrapper.run().await });

    let observer = executor.clone();
    let reached_health = poll_until(Duration::from_secs(5), Duration::from_millis(10), || {
        let observer = observer.clone();
        async move { (observer.count(labels::HEALTH) > 0).then_some(()) }
    })
    .await;
    assert!(reached_health.is_some(), "run never reached the health check");

    let report = run.await.unwrap();
    assert_eq!(report.exit_code(), 0);
    let labels_seen = executor.labels();
    let position = |label: &str| labels_seen.iter().position(|l| l == label).unwrap();
    assert!(position(labels::INIT) < position(labels::JOIN_CONTROL_PLANE));
    assert!(position(labels::JOIN_WORKER) < position(labels::CNI_APPLY));
    assert!(position(labels::CNI_WAIT) < position(labels::STORAGE_APPLY));
}

#[tokio::test]
async fn test_unreachable_worker_degrades_run() {
    let executor = ScriptedExecutor::healthy_cluster(&FLEET);
    executor
        .on(labels::JOIN_WORKER)
        .host("worker-1")
        .fail(ExecError::ConnectionRefused("192.0.2.21:2222".to_string()));

    let report = bootstrapper(&executor).run().await;
    assert!(matches!(report.outcome, RunOutcome::Degraded));
    assert_eq!(report.exit_code(), 0);
    assert!(report
        .record
        .warnings
        .iter()
        .any(|w| w.contains("worker-1")));

    // Addons still go in after the worker failure.
    assert_eq!(executor.count(labels::CNI_APPLY), 1);
    assert_eq!(executor.count(labels::STORAGE_DEFAULT), 1);
}

#[tokio::test]
async fn test_control_plane_join_failure_aborts_before_workers() {
    let executor = ScriptedExecutor::healthy_cluster(&FLEET);
    executor
        .on(labels::JOIN_CONTROL_PLANE)
        .host("cp-2")
        .exit(1, "error execution phase control-plane-join/etcd");

    let report = bootstrapper(&executor).run().await;
    assert_eq!(report.exit_code(), 1);
    match &report.outcome {
        RunOutcome::Aborted { error } => {
            assert_eq!(error.phase, Phase::JoinControlPlane);
            assert_eq!(error.hostnames(), vec!["cp-2"]);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(executor.count(labels::JOIN_WORKER), 0);
    assert_eq!(executor.count_on(labels::JOIN_CONTROL_PLANE, "cp-3"), 0);

    let cp3 = report
        .record
        .phase(Phase::JoinControlPlane)
        .and_then(|p| p.step("cp-3"))
        .unwrap();
    assert_eq!(cp3.status, StepStatus::Pending);
}

#[tokio::test]
async fn test_second_run_reuses_guards() {
    let executor = ScriptedExecutor::healthy_cluster(&FLEET);
    let bootstrapper = bootstrapper(&executor);

    assert_eq!(bootstrapper.run().await.exit_code(), 0);
    let first: Vec<String> = executor.labels();
    executor.clear_calls();
    assert_eq!(bootstrapper.run().await.exit_code(), 0);

    assert_eq!(executor.labels(), first);
    let init = executor
        .calls_for("cp-1")
        .into_iter()
        .find(|c| c.label == labels::INIT)
        .unwrap();
    assert!(init.body.contains("/etc/kubernetes/admin.conf"));
}

#[tokio::test]
async fn test_missing_certificate_key_is_rejected_up_front() {
    let executor = ScriptedExecutor::healthy_cluster(&FLEET);
    let mut config = test_config();
    config.secrets.certificate_key = None;

    let result = Bootstrapper::new(config, fixture_topology(), Arc::new(executor.clone()));
    assert!(matches!(result, Err(PreflightError::Config(_))));
    assert!(executor.calls().is_empty());
}
