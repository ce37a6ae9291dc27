//! External summary tool invocation.
//!
//! The summary report for an instance comes from an engine-specific client
//! (`pt-mysql-summary`, `pt-mongodb-summary`, `psql`) pointed at the local end
//! of the instance's tunnel. The run is bounded by the summary timeout; on
//! timeout the child is killed and whatever it printed so far is kept.
//!
//! # Security
//! Passwords are passed through the environment where the client supports it.
//! [`SummaryInvocation`] never prints them: its `Debug` output and
//! [`SummaryInvocation::command_line`] are redacted.

use crate::client::ClusterClient;
use crate::credentials::DatabaseCredentials;
use crate::engines::{EngineProfile, UserSource};
use crate::error::{CollectorError, redact_command};
use crate::models::SummaryOutcome;
use crate::patterns;
use crate::Result;
use async_trait::async_trait;
use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use zeroize::Zeroizing;

/// A fully expanded summary tool command.
#[derive(Clone)]
pub struct SummaryInvocation {
    /// Executable to run
    pub program: String,
    /// Arguments with the tunnel endpoint filled in
    pub args: Vec<String>,
    /// Environment variables; values may hold credentials
    pub env: Vec<(String, Zeroizing<String>)>,
}

impl SummaryInvocation {
    /// Expands the engine's summary template for one tunnel endpoint.
    pub fn build(
        profile: &EngineProfile,
        cluster: &str,
        credentials: &DatabaseCredentials,
        host: &str,
        port: u16,
    ) -> Self {
        let port = port.to_string();
        let fill = |template: &str| {
            patterns::expand(template, cluster)
                .replace("{host}", host)
                .replace("{port}", &port)
                .replace("{user}", credentials.username())
                .replace("{password}", credentials.password())
        };

        Self {
            program: profile.summary.program.to_string(),
            args: profile.summary.args.iter().map(|a| fill(a)).collect(),
            env: profile
                .summary
                .env
                .iter()
                .map(|(key, value)| ((*key).to_string(), Zeroizing::new(fill(value))))
                .collect(),
        }
    }

    /// Command line safe for logs and error messages.
    pub fn command_line(&self) -> String {
        redact_command(&self.program, &self.args)
    }
}

impl fmt::Debug for SummaryInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SummaryInvocation")
            .field("command", &self.command_line())
            .field("env", &self.env.iter().map(|(k, _)| k).collect::<Vec<_>>())
            .finish()
    }
}

/// Reads the summary tool login from the engine's users secret.
///
/// # Errors
/// Returns `RemoteOperation` when the secret or one of its keys is missing.
pub async fn resolve_credentials(
    client: &dyn ClusterClient,
    profile: &EngineProfile,
    namespace: &str,
    cluster: &str,
) -> Result<DatabaseCredentials> {
    let secret_name = patterns::expand(profile.summary.users_secret, cluster);
    let secret = client.get_secret(namespace, &secret_name).await?;

    let missing = |key: &str| {
        CollectorError::remote(format!("secret {}/{} has no key {}", namespace, secret_name, key))
    };

    let username = match profile.summary.user {
        UserSource::Fixed(name) => name.to_string(),
        UserSource::SecretKey(key) => secret.get_str(key).ok_or_else(|| missing(key))?.to_string(),
    };
    let password = secret
        .get_str(profile.summary.password_key)
        .ok_or_else(|| missing(profile.summary.password_key))?;

    Ok(DatabaseCredentials::new(username, password))
}

/// Runs a summary invocation.
#[async_trait]
pub trait SummaryExecutor: Send + Sync {
    /// Runs the tool; never fails, problems are reported in the outcome.
    async fn execute(&self, invocation: &SummaryInvocation, timeout: Duration) -> SummaryOutcome;
}

/// Executes summary tools as child processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessExecutor;

#[async_trait]
impl SummaryExecutor for ProcessExecutor {
    async fn execute(&self, invocation: &SummaryInvocation, timeout: Duration) -> SummaryOutcome {
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &invocation.env {
            cmd.env(key, value.as_str());
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return SummaryOutcome::failure(format!(
                    "failed to start {}: {}",
                    invocation.program, e
                ));
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let mut out = Vec::new();
        let mut err = Vec::new();

        let finished = tokio::time::timeout(timeout, async {
            let (_, _, status) = tokio::join!(
                drain(stdout, &mut out),
                drain(stderr, &mut err),
                child.wait()
            );
            status
        })
        .await;

        match finished {
            Ok(Ok(status)) if status.success() => {
                out.extend_from_slice(&err);
                SummaryOutcome::Success { output: out }
            }
            Ok(Ok(status)) => {
                let stderr_text = String::from_utf8_lossy(&err).trim().to_string();
                let error = if stderr_text.is_empty() {
                    format!("{} exited with {}", invocation.program, status)
                } else {
                    format!("{} exited with {}: {}", invocation.program, status, stderr_text)
                };
                SummaryOutcome::Failure { output: out, error }
            }
            Ok(Err(e)) => SummaryOutcome::Failure {
                output: out,
                error: format!("waiting for {} failed: {}", invocation.program, e),
            },
            Err(_) => {
                if let Err(e) = child.kill().await {
                    tracing::debug!("summary process already gone: {}", e);
                }
                out.extend_from_slice(&err);
                SummaryOutcome::Failure {
                    output: out,
                    error: format!("{} timed out after {:?}", invocation.program, timeout),
                }
            }
        }
    }
}

async fn drain<R: AsyncRead + Unpin>(reader: Option<R>, buf: &mut Vec<u8>) {
    if let Some(mut reader) = reader
        && let Err(e) = reader.read_to_end(buf).await
    {
        tracing::debug!("summary output stream closed: {}", e);
    }
}

/// Runs summary invocations through an executor with the run's time budget.
#[derive(Clone)]
pub struct SummaryRunner {
    executor: Arc<dyn SummaryExecutor>,
    timeout: Duration,
}

impl SummaryRunner {
    /// Creates a runner that spawns local processes, each bounded by `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            executor: Arc::new(ProcessExecutor),
            timeout,
        }
    }

    /// Builder method to replace the executor.
    pub fn with_executor(mut self, executor: Arc<dyn SummaryExecutor>) -> Self {
        self.executor = executor;
        self
    }

    /// Runs one invocation. Failures are captured in the outcome.
    pub async fn run(&self, invocation: &SummaryInvocation) -> SummaryOutcome {
        tracing::debug!("Running {}", invocation.command_line());
        self.executor.execute(invocation, self.timeout).await
    }
}
