//! # Remote Task Runner
//!
//! Runs a [`RemoteTask`] across a set of hosts by spawning `ssh` processes
//! with a bounded concurrency pool. Failures are reported per host and
//! logged, never propagated as fatal; the caller inspects the reports if it
//! cares.
//!
//! The SSH private key is written to a mode-0600 temporary file that lives
//! as long as the runner.

use std::io::Write;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::{info, warn};

use crate::tasks::RemoteTask;

const SSH_CONNECT_TIMEOUT_SECS: u32 = 30;
const SSH_CONNECTION_ATTEMPTS: u32 = 3;

/// Outcome of one task on one host
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub host: String,
    pub success: bool,
    pub detail: String,
}

/// Fan a task out to target hosts with bounded concurrency
#[async_trait]
pub trait RemoteTaskRunner: Send + Sync {
    async fn run(&self, task: &RemoteTask, hosts: &[String]) -> Vec<TaskReport>;
}

/// `ssh`-spawning runner
pub struct SshTaskRunner {
    user: String,
    key_file: NamedTempFile,
    pool_size: usize,
}

impl SshTaskRunner {
    pub fn new(user: impl Into<String>, private_key: &str, pool_size: usize) -> Result<Self> {
        if which::which("ssh").is_err() {
            warn!("ssh binary not found on PATH, remote tasks will fail");
        }
        let mut key_file = NamedTempFile::new().context("creating ssh key file")?;
        key_file
            .write_all(private_key.as_bytes())
            .context("writing ssh key file")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(key_file.path(), std::fs::Permissions::from_mode(0o600))
                .context("restricting ssh key file permissions")?;
        }
        Ok(Self {
            user: user.into(),
            key_file,
            pool_size: pool_size.max(1),
        })
    }

    async fn run_on_host(&self, task: &RemoteTask, host: &str) -> TaskReport {
        let commands = task.commands();
        if commands.is_empty() {
            return TaskReport {
                host: host.to_string(),
                success: true,
                detail: "nothing to run".to_string(),
            };
        }
        let connect_timeout = format!("ConnectTimeout={SSH_CONNECT_TIMEOUT_SECS}");
        let connection_attempts = format!("ConnectionAttempts={SSH_CONNECTION_ATTEMPTS}");
        for command in &commands {
            let output = Command::new("ssh")
                .arg("-i")
                .arg(self.key_file.path())
                .args([
                    "-o",
                    "StrictHostKeyChecking=no",
                    "-o",
                    "UserKnownHostsFile=/dev/null",
                    "-o",
                    connect_timeout.as_str(),
                    "-o",
                    connection_attempts.as_str(),
                    "-o",
                    "ServerAliveInterval=30",
                    "-o",
                    "BatchMode=yes",
                ])
                .arg(format!("{}@{}", self.user, host))
                .arg(command)
                .output()
                .await;
            match output {
                Err(err) => {
                    return TaskReport {
                        host: host.to_string(),
                        success: false,
                        detail: format!("spawning ssh failed: {err}"),
                    };
                }
                Ok(output) if !output.status.success() => {
                    return TaskReport {
                        host: host.to_string(),
                        success: false,
                        detail: format!(
                            "{command:?} exited {}: {}",
                            output.status,
                            String::from_utf8_lossy(&output.stderr).trim()
                        ),
                    };
                }
                Ok(_) => {}
            }
        }
        TaskReport {
            host: host.to_string(),
            success: true,
            detail: format!("{} commands ok", commands.len()),
        }
    }
}

#[async_trait]
impl RemoteTaskRunner for SshTaskRunner {
    async fn run(&self, task: &RemoteTask, hosts: &[String]) -> Vec<TaskReport> {
        info!(
            "running task {} on {} hosts (pool size {})",
            task.name(),
            hosts.len(),
            self.pool_size
        );
        let host_futures: Vec<_> = hosts
            .iter()
            .map(|host| self.run_on_host(task, host))
            .collect();
        let reports: Vec<TaskReport> = stream::iter(host_futures)
            .buffer_unordered(self.pool_size)
            .collect()
            .await;
        for report in &reports {
            if report.success {
                info!("task {} on {}: {}", task.name(), report.host, report.detail);
            } else {
                warn!("task {} on {}: {}", task.name(), report.host, report.detail);
            }
        }
        reports
    }
}
