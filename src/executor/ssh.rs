use async_trait::async_trait;
use log::{debug, warn};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{ExecResult, RemoteCommand, RemoteExecutor};
use crate::config::SshConfig;
use crate::error::ExecError;
use crate::inventory::Host;

/// ssh reserves this exit code for its own failures, but a remote script may
/// exit with it too; only ssh's own diagnostics mark a transport failure.
const SSH_ERROR_EXIT: i32 = 255;

const SSH_DIAGNOSTIC_PREFIXES: &[&str] = &[
    "ssh:",
    "kex_exchange_identification:",
    "Connection closed by",
    "Connection reset by",
    "Connection timed out during banner exchange",
];

const AUTH_FAILURE_MARKERS: &[&str] = &[
    "Permission denied",
    "Host key verification failed",
    "Too many authentication failures",
];

/// Executor backed by the system OpenSSH client.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    config: SshConfig,
}

impl SshExecutor {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    fn command_for(&self, host: &Host) -> Command {
        let mut cmd = Command::new(&self.config.program);
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.config.connect_timeout_secs))
            .arg("-o")
            .arg(format!(
                "StrictHostKeyChecking={}",
                self.config.strict_host_key_checking
            ));

        if let Some(known_hosts) = &self.config.known_hosts_file {
            cmd.arg("-o")
                .arg(format!("UserKnownHostsFile={}", known_hosts.display()));
        }
        if let Some(identity) = &self.config.identity_file {
            cmd.arg("-i").arg(identity);
        }

        cmd.arg("-p")
            .arg(host.ssh_port.to_string())
            .arg(format!("{}@{}", host.ssh_user, host.address))
            .arg("--")
            .args(remote_shell(&host.ssh_user));

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

/// Remote argv: a shell reading its script from stdin, escalated when the
/// login user is not root.
fn remote_shell(user: &str) -> &'static [&'static str] {
    if user == "root" {
        &["bash", "-s"]
    } else {
        &["sudo", "-n", "bash", "-s"]
    }
}

/// Transport failure reported by ssh itself, if `stderr` carries one.
fn classify_ssh_failure(stderr: &str) -> Option<ExecError> {
    let diagnostic = stderr.lines().map(str::trim).rev().find(|line| {
        AUTH_FAILURE_MARKERS.iter().any(|marker| line.contains(marker))
            || SSH_DIAGNOSTIC_PREFIXES
                .iter()
                .any(|prefix| line.starts_with(prefix))
    })?;

    let message = diagnostic.to_string();
    if AUTH_FAILURE_MARKERS
        .iter()
        .any(|marker| stderr.contains(marker))
    {
        Some(ExecError::AuthFailure(message))
    } else {
        Some(ExecError::ConnectionRefused(message))
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn run(
        &self,
        host: &Host,
        command: &RemoteCommand,
        timeout: Duration,
    ) -> Result<ExecResult, ExecError> {
        if command.is_sensitive() {
            debug!("[{}] running {}", host.hostname, command.label());
        } else {
            debug!(
                "[{}] running {}: {}",
                host.hostname,
                command.label(),
                command.body()
            );
        }

        let mut child = self
            .command_for(host)
            .spawn()
            .map_err(|e| ExecError::Transport(format!("failed to spawn ssh: {e}")))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ExecError::Transport("ssh stdin unavailable".to_string()))?;
        let script = command.body().to_string();
        let hostname = host.hostname.clone();
        // stdin is fed while output is being collected.
        let writer = tokio::spawn(async move {
            if let Err(e) = stdin.write_all(script.as_bytes()).await {
                warn!("[{hostname}] failed to send script: {e}");
            }
            // Dropping stdin sends EOF to `bash -s`.
        });

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => output.map_err(|e| ExecError::Transport(e.to_string()))?,
            Err(_) => {
                writer.abort();
                warn!(
                    "[{}] {} timed out after {timeout:?}",
                    host.hostname,
                    command.label()
                );
                return Err(ExecError::Timeout(timeout));
            }
        };
        let _ = writer.await;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let exit_code = output.status.code().unwrap_or(-1);

        if exit_code == SSH_ERROR_EXIT {
            if let Some(err) = classify_ssh_failure(&stderr) {
                return Err(err);
            }
        }

        debug!(
            "[{}] {} exited with {exit_code}",
            host.hostname,
            command.label()
        );
        Ok(ExecResult {
            stdout,
            stderr,
            exit_code,
        })
    }
}
