//! In-memory stand-in for a fleet of SSH hosts.
//!
//! [`ScriptedExecutor`] answers commands from a rule table keyed by command
//! label and, optionally, hostname, and records every call it receives so
//! tests can assert on what was sent where and in which order.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::config::{ClusterConfig, Secret};
use crate::error::ExecError;
use crate::executor::{ExecResult, RemoteCommand, RemoteExecutor};
use crate::inventory::{Host, Inventory};
use crate::kubeadm::labels;
use crate::roles::{assign_roles, Topology};

pub const TEST_CERTIFICATE_KEY: &str =
    "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

pub const TEST_JOIN_COMMAND: &str = "kubeadm join 10.0.0.1:6443 --token abcdef.0123456789abcdef --discovery-token-ca-cert-hash sha256:0a1b2c3d\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub hostname: String,
    pub label: String,
    pub body: String,
}

#[derive(Debug, Clone)]
enum Response {
    Reply(ExecResult),
    Fail(ExecError),
}

#[derive(Debug, Clone)]
struct Rule {
    label: Option<String>,
    host: Option<String>,
    remaining: Option<usize>,
    response: Response,
}

impl Rule {
    fn matches(&self, hostname: &str, label: &str) -> bool {
        self.remaining != Some(0)
            && self.label.as_deref().map_or(true, |l| l == label)
            && self.host.as_deref().map_or(true, |h| h == hostname)
    }
}

#[derive(Debug, Default)]
struct State {
    rules: Vec<Rule>,
    calls: Vec<RecordedCall>,
}

/// Commands without a matching rule succeed with empty output. The most
/// recently added matching rule wins.
#[derive(Debug, Clone, Default)]
pub struct ScriptedExecutor {
    state: Arc<Mutex<State>>,
}

pub struct RuleBuilder<'a> {
    executor: &'a ScriptedExecutor,
    rule: Rule,
}

impl<'a> RuleBuilder<'a> {
    pub fn host(mut self, hostname: &str) -> Self {
        self.rule.host = Some(hostname.to_string());
        self
    }

    /// Only answer the next `count` matching calls.
    pub fn times(mut self, count: usize) -> Self {
        self.rule.remaining = Some(count);
        self
    }

    pub fn reply(self, stdout: &str) -> &'a ScriptedExecutor {
        self.respond(Response::Reply(ExecResult {
            stdout: stdout.to_string(),
            ..Default::default()
        }))
    }

    pub fn exit(self, exit_code: i32, stderr: &str) -> &'a ScriptedExecutor {
        self.respond(Response::Reply(ExecResult {
            stdout: String::new(),
            stderr: stderr.to_string(),
            exit_code,
        }))
    }

    pub fn fail(self, error: ExecError) -> &'a ScriptedExecutor {
        self.respond(Response::Fail(error))
    }

    fn respond(mut self, response: Response) -> &'a ScriptedExecutor {
        self.rule.response = response;
        self.executor.lock().rules.push(self.rule);
        self.executor
    }
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// An executor that behaves like a healthy cluster made of `nodes`: join
    /// tokens are printed, every node is Ready and system pods run.
    pub fn healthy_cluster(nodes: &[&str]) -> Self {
        let executor = Self::new();
        executor.on(labels::JOIN_TOKEN).reply(TEST_JOIN_COMMAND);
        executor.on(labels::HEALTH).reply(&health_output(nodes, &[]));
        executor.on(labels::LIST_NODES).reply(&node_listing(nodes));
        executor.on(labels::NODE_READY).reply("True");
        executor
    }

    pub fn on(&self, label: &str) -> RuleBuilder<'_> {
        RuleBuilder {
            executor: self,
            rule: Rule {
                label: Some(label.to_string()),
                host: None,
                remaining: None,
                response: Response::Reply(ExecResult::default()),
            },
        }
    }

    /// Every command sent to `hostname` fails with `error`.
    pub fn fail_host(&self, hostname: &str, error: ExecError) -> &Self {
        self.lock().rules.push(Rule {
            label: None,
            host: Some(hostname.to_string()),
            remaining: None,
            response: Response::Fail(error),
        });
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock().calls.clone()
    }

    pub fn calls_for(&self, hostname: &str) -> Vec<RecordedCall> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.hostname == hostname)
            .cloned()
            .collect()
    }

    /// Labels in call order.
    pub fn labels(&self) -> Vec<String> {
        self.lock().calls.iter().map(|c| c.label.clone()).collect()
    }

    pub fn labels_for(&self, hostname: &str) -> Vec<String> {
        self.calls_for(hostname)
            .into_iter()
            .map(|c| c.label)
            .collect()
    }

    pub fn count(&self, label: &str) -> usize {
        self.lock().calls.iter().filter(|c| c.label == label).count()
    }

    pub fn count_on(&self, label: &str, hostname: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.label == label && c.hostname == hostname)
            .count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panicking test thread must not hide the calls from the others.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl RemoteExecutor for ScriptedExecutor {
    async fn run(
        &self,
        host: &Host,
        command: &RemoteCommand,
        _timeout: Duration,
    ) -> Result<ExecResult, ExecError> {
        let response = {
            let mut state = self.lock();
            state.calls.push(RecordedCall {
                hostname: host.hostname.clone(),
                label: command.label().to_string(),
                body: command.body().to_string(),
            });
            let rule = state
                .rules
                .iter_mut()
                .rev()
                .find(|rule| rule.matches(&host.hostname, command.label()));
            match rule {
                Some(rule) => {
                    if let Some(remaining) = rule.remaining.as_mut() {
                        *remaining -= 1;
                    }
                    rule.response.clone()
                }
                None => Response::Reply(ExecResult::default()),
            }
        };
        // Let sibling futures interleave as they would over real connections.
        tokio::task::yield_now().await;

        match response {
            Response::Reply(result) => Ok(result),
            Response::Fail(error) => Err(error),
        }
    }
}

/// `kubectl get nodes` rows for `nodes`, all Ready.
pub fn node_listing(nodes: &[&str]) -> String {
    nodes
        .iter()
        .map(|name| format!("{name}   Ready   control-plane   5m   v1.28.0\n"))
        .collect()
}

/// Output of the combined health command. Nodes in `not_ready` report
/// `NotReady`.
pub fn health_output(nodes: &[&str], not_ready: &[&str]) -> String {
    let mut out: String = nodes
        .iter()
        .map(|name| {
            let status = if not_ready.contains(name) {
                "NotReady"
            } else {
                "Ready"
            };
            format!("{name}   {status}   <none>   5m   v1.28.0\n")
        })
        .collect();
    out.push_str("---\n");
    out.push_str("coredns-5dd5756b68-abcde   1/1   Running   0   5m\n");
    out.push_str("kube-proxy-abcde           1/1   Running   0   5m\n");
    out
}

/// Default configuration with the certificate key filled in.
pub fn test_config() -> ClusterConfig {
    let mut config = ClusterConfig::default();
    config.secrets.certificate_key = Some(Secret::new(TEST_CERTIFICATE_KEY));
    config
}

/// `node-1..=node-N` at `10.0.0.1..`, roles assigned for a three member
/// control plane.
pub fn test_topology(count: usize) -> Topology {
    let inventory = test_inventory(count);
    match assign_roles(&inventory, 3) {
        Ok(topology) => topology,
        Err(e) => panic!("test topology of {count} hosts: {e}"),
    }
}

pub fn test_inventory(count: usize) -> Inventory {
    let hosts = (1..=count)
        .map(|i| Host::new(format!("node-{i}"), format!("10.0.0.{i}")))
        .collect();
    match Inventory::new(hosts) {
        Ok(inventory) => inventory,
        Err(e) => panic!("test inventory: {e}"),
    }
}
