//! Remote command execution.
//!
//! Every command body is shipped to the host as a script on stdin, so
//! secrets embedded in a body never show up in a process listing.

pub mod ssh;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use log::debug;
use std::fmt;
use std::time::Duration;

use crate::error::{ExecError, FailureReason};
use crate::inventory::Host;

pub use ssh::SshExecutor;

/// Number of trailing stderr lines kept in a failure reason.
const STDERR_TAIL_LINES: usize = 20;

#[derive(Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    label: String,
    body: String,
    sensitive: bool,
}

impl RemoteCommand {
    pub fn new(label: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            body: body.into(),
            sensitive: false,
        }
    }

    /// Mark the body as carrying secret material; only the label is logged.
    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn is_sensitive(&self) -> bool {
        self.sensitive
    }
}

impl fmt::Debug for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("RemoteCommand");
        s.field("label", &self.label);
        if self.sensitive {
            s.field("body", &"<redacted>");
        } else {
            s.field("body", &self.body);
        }
        s.finish()
    }
}

impl fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs one command on one host. Implementations never retry.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn run(
        &self,
        host: &Host,
        command: &RemoteCommand,
        timeout: Duration,
    ) -> Result<ExecResult, ExecError>;
}

/// Outcome of a command on one host of a [`dispatch`].
#[derive(Debug, Clone)]
pub struct HostOutcome {
    pub hostname: String,
    pub result: Result<ExecResult, ExecError>,
}

impl HostOutcome {
    pub fn verdict(&self) -> Result<&ExecResult, FailureReason> {
        verdict(&self.result)
    }
}

/// Fold transport errors and non-zero exits into a single failure reason.
pub fn verdict(result: &Result<ExecResult, ExecError>) -> Result<&ExecResult, FailureReason> {
    match result {
        Ok(output) if output.success() => Ok(output),
        Ok(output) => Err(FailureReason::NonZeroExit {
            code: output.exit_code,
            stderr: stderr_tail(&output.stderr),
        }),
        Err(err) => Err(err.into()),
    }
}

/// Run a single command and fold its outcome with [`verdict`].
pub async fn run_checked(
    executor: &dyn RemoteExecutor,
    host: &Host,
    command: &RemoteCommand,
    timeout: Duration,
) -> Result<ExecResult, FailureReason> {
    let result = executor.run(host, command, timeout).await;
    verdict(&result).cloned()
}

fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.trim().lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

/// Run one command per target, at most `concurrency` at a time (`None` is
/// unbounded). Outcomes come back in the order of `targets`; one host failing
/// never cancels its siblings.
pub async fn dispatch<'e, T, F>(
    executor: &'e dyn RemoteExecutor,
    targets: &[T],
    concurrency: Option<usize>,
    timeout: Duration,
    make_command: F,
) -> Vec<HostOutcome>
where
    T: AsRef<Host>,
    F: Fn(&T) -> RemoteCommand,
{
    let jobs: Vec<(Host, RemoteCommand)> = targets
        .iter()
        .map(|target| (target.as_ref().clone(), make_command(target)))
        .collect();
    let limit = concurrency.unwrap_or(jobs.len()).max(1);

    debug!("Dispatching to {} host(s), limit {limit}", jobs.len());

    // Boxed so the caller's future stays `Send`.
    stream::iter(jobs)
        .map(move |(host, command)| -> BoxFuture<'e, HostOutcome> {
            async move {
                let result = executor.run(&host, &command, timeout).await;
                HostOutcome {
                    hostname: host.hostname,
                    result,
                }
            }
            .boxed()
        })
        .buffered(limit)
        .collect()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_harness::ScriptedExecutor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_sensitive_body_is_redacted() {
        let command = RemoteCommand::new("join", "kubeadm join --token abc.def").sensitive();
        let debug = format!("{command:?}");
        assert!(debug.contains("join"));
        assert!(!debug.contains("abc.def"));
        assert_eq!(command.to_string(), "join");
    }

    #[test]
    fn test_verdict_folds_exit_codes() {
        let ok: Result<ExecResult, ExecError> = Ok(ExecResult::default());
        assert!(verdict(&ok).is_ok());

        let failed: Result<ExecResult, ExecError> = Ok(ExecResult {
            stdout: String::new(),
            stderr: "warning\nfatal: boom\n".to_string(),
            exit_code: 3,
        });
        assert_eq!(
            verdict(&failed).unwrap_err(),
            FailureReason::NonZeroExit {
                code: 3,
                stderr: "warning\nfatal: boom".to_string()
            }
        );

        let refused: Result<ExecResult, ExecError> =
            Err(ExecError::ConnectionRefused("port 22".to_string()));
        assert_eq!(
            verdict(&refused).unwrap_err().to_string(),
            "connection refused: port 22"
        );
    }

    #[test]
    fn test_stderr_tail_keeps_last_lines() {
        let stderr: String = (0..50).map(|i| format!("line {i}\n")).collect();
        let tail = stderr_tail(&stderr);
        assert_eq!(tail.lines().count(), STDERR_TAIL_LINES);
        assert!(tail.ends_with("line 49"));
    }

    #[tokio::test]
    async fn test_dispatch_keeps_input_order_and_isolates_failures() {
        let executor = ScriptedExecutor::new();
        executor.fail_host("b", ExecError::ConnectionRefused("b:22".to_string()));

        let hosts = vec![
            Host::new("a", "10.0.0.1"),
            Host::new("b", "10.0.0.2"),
            Host::new("c", "10.0.0.3"),
        ];
        let outcomes = dispatch(&executor, hosts.as_slice(), None, Duration::from_secs(5), |host| {
            RemoteCommand::new("echo", format!("echo {}", host.hostname))
        })
        .await;

        let names: Vec<&str> = outcomes.iter().map(|o| o.hostname.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert!(outcomes[0].verdict().is_ok());
        assert!(outcomes[1].verdict().is_err());
        assert!(outcomes[2].verdict().is_ok());
        assert_eq!(executor.calls().len(), 3);
    }

    struct CountingExecutor {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl RemoteExecutor for CountingExecutor {
        async fn run(
            &self,
            _host: &Host,
            _command: &RemoteCommand,
            _timeout: Duration,
        ) -> Result<ExecResult, ExecError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(ExecResult::default())
        }
    }

    #[tokio::test]
    async fn test_dispatch_respects_concurrency_bound() {
        let executor = Arc::new(CountingExecutor {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let hosts: Vec<Host> = (0..8)
            .map(|i| Host::new(format!("n{i}"), format!("10.0.0.{i}")))
            .collect();

        dispatch(
            executor.as_ref(),
            hosts.as_slice(),
            Some(2),
            Duration::from_secs(5),
            |_: &Host| RemoteCommand::new("noop", "true"),
        )
        .await;
        assert_eq!(executor.peak.load(Ordering::SeqCst), 2);

        executor.peak.store(0, Ordering::SeqCst);
        dispatch(
            executor.as_ref(),
            hosts.as_slice(),
            None,
            Duration::from_secs(5),
            |_: &Host| RemoteCommand::new("noop", "true"),
        )
        .await;
        assert_eq!(executor.peak.load(Ordering::SeqCst), 8);
    }
}
