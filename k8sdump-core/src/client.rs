//! Cluster client boundary.
//!
//! Every interaction with the Kubernetes API goes through [`ClusterClient`].
//! The collector only needs a narrow, read-only capability surface: listing
//! resources, reading secrets and files, streaming logs, and forwarding a
//! local port to a pod. The production implementation drives `kubectl`; tests
//! substitute an in-memory fake.
//!
//! # Object Safety
//! The trait is object-safe and shared between workers as
//! `Arc<dyn ClusterClient>`.

use crate::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Child;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use zeroize::Zeroizing;

pub mod kubectl;

pub use kubectl::KubectlClient;

/// A namespaced object returned by a list call.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ResourceRef {
    /// Namespace of the object
    pub namespace: String,
    /// Object name
    pub name: String,
}

impl ResourceRef {
    /// Creates a reference to `namespace/name`.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

/// Decoded contents of a secret.
///
/// Values are held in zeroizing buffers; `Debug` lists keys only.
#[derive(Clone, Default)]
pub struct SecretData {
    /// Secret name
    pub name: String,
    /// Decoded values by key
    pub data: BTreeMap<String, Zeroizing<Vec<u8>>>,
}

impl SecretData {
    /// Creates an empty secret named `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: BTreeMap::new(),
        }
    }

    /// Builder method to add a key.
    pub fn with_entry(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.data.insert(key.into(), Zeroizing::new(value.into()));
        self
    }

    /// Raw value of a key.
    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.data.get(key).map(|v| v.as_slice())
    }

    /// Value of a key as UTF-8 text, with trailing newlines removed.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key)
            .and_then(|v| std::str::from_utf8(v).ok())
            .map(|s| s.trim_end_matches(['\n', '\r']))
    }
}

impl fmt::Debug for SecretData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretData")
            .field("name", &self.name)
            .field("keys", &self.data.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Bytes of forwarder stderr kept for error reports.
const STDERR_LIMIT: usize = 8 * 1024;

/// A running port-forward.
///
/// Dropping the session tears it down.
pub enum ForwardSession {
    /// An external forwarding process
    Process(ForwardProcess),
    /// An in-process forwarding task
    Task(JoinHandle<()>),
}

/// A `kubectl port-forward` child with its output drained in the background.
///
/// kubectl announces `Forwarding from 127.0.0.1:<port>` on stdout once its
/// listener is bound, and keeps writing per-connection notices to both
/// streams for as long as it runs.
pub struct ForwardProcess {
    child: Child,
    ready: watch::Receiver<bool>,
    stdout: Option<JoinHandle<()>>,
    stderr: Option<JoinHandle<String>>,
    exit_reason: Option<String>,
}

impl ForwardProcess {
    /// Takes over a spawned forwarder listening on `local_port`.
    ///
    /// The child must have been started with piped stdout and stderr.
    pub fn new(mut child: Child, local_port: u16) -> Self {
        let (ready_tx, ready) = watch::channel(false);
        let stdout = child.stdout.take().map(|stdout| {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if announces_listener(&line, local_port) {
                        let _ = ready_tx.send(true);
                    } else {
                        tracing::trace!("port-forward: {}", line);
                    }
                }
            })
        });
        let stderr = child.stderr.take().map(|stderr| tokio::spawn(drain_bounded(stderr)));
        Self {
            child,
            ready,
            stdout,
            stderr,
            exit_reason: None,
        }
    }

    /// Whether kubectl has reported its local listener.
    pub fn is_listening(&self) -> bool {
        *self.ready.borrow()
    }

    async fn exit_reason(&mut self) -> Option<String> {
        if self.exit_reason.is_some() {
            return self.exit_reason.clone();
        }
        let reason = match self.child.try_wait() {
            Ok(None) => return None,
            Ok(Some(status)) => {
                let stderr = match self.stderr.take() {
                    Some(handle) => handle.await.unwrap_or_default(),
                    None => String::new(),
                };
                if stderr.is_empty() {
                    format!("port-forward exited with {}", status)
                } else {
                    format!("port-forward exited with {}: {}", status, stderr)
                }
            }
            Err(e) => format!("port-forward status unavailable: {}", e),
        };
        self.exit_reason = Some(reason.clone());
        Some(reason)
    }

    async fn shutdown(&mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::debug!("port-forward process already gone: {}", e);
        }
        self.abort_readers();
    }

    fn abort_readers(&mut self) {
        if let Some(handle) = self.stdout.take() {
            handle.abort();
        }
        if let Some(handle) = self.stderr.take() {
            handle.abort();
        }
    }
}

/// Matches kubectl's `Forwarding from 127.0.0.1:<port> -> <remote>` line.
fn announces_listener(line: &str, local_port: u16) -> bool {
    line.strip_prefix("Forwarding from ")
        .and_then(|rest| rest.split_whitespace().next())
        .is_some_and(|addr| addr == format!("127.0.0.1:{}", local_port))
}

/// Reads a stream to its end, keeping only the last [`STDERR_LIMIT`] bytes.
async fn drain_bounded<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut kept: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                kept.extend_from_slice(&chunk[..n]);
                if kept.len() > STDERR_LIMIT {
                    let excess = kept.len() - STDERR_LIMIT;
                    kept.drain(..excess);
                }
            }
        }
    }
    String::from_utf8_lossy(&kept).trim().to_string()
}

impl ForwardSession {
    /// Returns a description of why the session ended, or `None` while it is
    /// still running.
    pub async fn exit_reason(&mut self) -> Option<String> {
        match self {
            ForwardSession::Process(process) => process.exit_reason().await,
            ForwardSession::Task(handle) => handle
                .is_finished()
                .then(|| "port-forward task ended".to_string()),
        }
    }

    /// Readiness as announced by the forwarder itself.
    ///
    /// `None` means the session gives no such signal and the caller has to
    /// probe the local port.
    pub fn announced_ready(&self) -> Option<bool> {
        match self {
            ForwardSession::Process(process) => Some(process.is_listening()),
            ForwardSession::Task(_) => None,
        }
    }

    /// Stops the forward and waits for it to go away.
    pub async fn shutdown(&mut self) {
        match self {
            ForwardSession::Process(process) => process.shutdown().await,
            ForwardSession::Task(handle) => {
                handle.abort();
                while !handle.is_finished() {
                    tokio::task::yield_now().await;
                }
            }
        }
    }
}

impl Drop for ForwardSession {
    fn drop(&mut self) {
        match self {
            ForwardSession::Process(process) => {
                let _ = process.child.start_kill();
                process.abort_readers();
            }
            ForwardSession::Task(handle) => handle.abort(),
        }
    }
}

impl fmt::Debug for ForwardSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwardSession::Process(process) => f
                .debug_tuple("Process")
                .field(&process.child.id())
                .finish(),
            ForwardSession::Task(_) => f.debug_tuple("Task").finish(),
        }
    }
}

/// Read-only access to a Kubernetes cluster.
///
/// # Errors
/// Implementations return [`CollectorError::ClusterUnreachable`] when the API
/// server cannot be reached at all, [`CollectorError::Timeout`] when a call
/// exceeds its budget, and [`CollectorError::RemoteOperation`] for any other
/// failed call.
///
/// [`CollectorError::ClusterUnreachable`]: crate::error::CollectorError::ClusterUnreachable
/// [`CollectorError::Timeout`]: crate::error::CollectorError::Timeout
/// [`CollectorError::RemoteOperation`]: crate::error::CollectorError::RemoteOperation
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Verifies that the API server answers.
    async fn check_connectivity(&self) -> Result<()>;

    /// Lists objects of a custom resource type, across all namespaces when
    /// `namespace` is `None`.
    ///
    /// A resource type that is not installed yields an empty list.
    async fn list_custom_resources(
        &self,
        resource: &str,
        namespace: Option<&str>,
    ) -> Result<Vec<ResourceRef>>;

    /// Names of the pods in `namespace` matching a label selector.
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<String>>;

    /// Names of all secrets in `namespace`.
    async fn list_secrets(&self, namespace: &str) -> Result<Vec<String>>;

    /// Fetches and decodes one secret.
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<SecretData>;

    /// Entry names in a directory inside a container. A missing directory
    /// yields an empty list.
    async fn list_directory(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        dir: &str,
    ) -> Result<Vec<String>>;

    /// Reads a file from a container; `None` when it does not exist.
    async fn copy_from_pod(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        path: &str,
    ) -> Result<Option<Vec<u8>>>;

    /// Logs of every container in the pod.
    async fn pod_logs(&self, namespace: &str, pod: &str) -> Result<Vec<u8>>;

    /// YAML dump of all objects of a resource type in `namespace`.
    async fn get_resources_yaml(&self, namespace: &str, resource: &str) -> Result<Vec<u8>>;

    /// Starts forwarding `127.0.0.1:local_port` to `remote_port` on the pod.
    ///
    /// Returns as soon as the session is started; readiness is checked by the
    /// caller.
    async fn port_forward(
        &self,
        namespace: &str,
        pod: &str,
        local_port: u16,
        remote_port: u16,
    ) -> Result<ForwardSession>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_data_debug_hides_values() {
        let secret = SecretData::new("cluster1-secrets")
            .with_entry("root", "hunter2")
            .with_entry("monitor", "m0n1t0r");
        let debug = format!("{:?}", secret);

        assert!(debug.contains("cluster1-secrets"));
        assert!(debug.contains("root"));
        assert!(!debug.contains("hunter2"));
        assert!(!debug.contains("m0n1t0r"));
    }

    #[test]
    fn test_secret_data_get_str_trims_newline() {
        let secret = SecretData::new("s").with_entry("user", "postgres\n");
        assert_eq!(secret.get_str("user"), Some("postgres"));
        assert_eq!(secret.get_str("missing"), None);
    }

    #[test]
    fn test_announces_listener() {
        assert!(announces_listener("Forwarding from 127.0.0.1:33060 -> 3306", 33060));
        assert!(!announces_listener("Forwarding from 127.0.0.1:330600 -> 3306", 33060));
        assert!(!announces_listener("Forwarding from [::1]:33060 -> 3306", 33060));
        assert!(!announces_listener("Handling connection for 33060", 33060));
    }

    #[tokio::test]
    async fn test_drain_bounded_keeps_tail() {
        let mut input = vec![b'a'; STDERR_LIMIT * 3];
        input.extend_from_slice(b"error: unable to listen on port");
        let text = drain_bounded(input.as_slice()).await;
        assert_eq!(text.len(), STDERR_LIMIT);
        assert!(text.ends_with("unable to listen on port"));
    }

    #[tokio::test]
    async fn test_task_session_has_no_announcement() {
        let session = ForwardSession::Task(tokio::spawn(async {}));
        assert_eq!(session.announced_ready(), None);
    }

    #[cfg(unix)]
    fn spawn_shell(script: &str) -> Child {
        tokio::process::Command::new("sh")
            .args(["-c", script])
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .unwrap()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_session_waits_for_announcement() {
        let child = spawn_shell("sleep 0.2; echo 'Forwarding from 127.0.0.1:40123 -> 3306'; sleep 30");
        let mut session = ForwardSession::Process(ForwardProcess::new(child, 40123));
        assert_eq!(session.announced_ready(), Some(false));

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while session.announced_ready() != Some(true) {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        assert!(session.exit_reason().await.is_none());

        session.shutdown().await;
        assert!(session.exit_reason().await.is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_session_reports_stderr_on_exit() {
        let child = spawn_shell("echo 'unable to listen on port 40124' >&2; exit 1");
        let mut session = ForwardSession::Process(ForwardProcess::new(child, 40124));

        let reason = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                if let Some(reason) = session.exit_reason().await {
                    return reason;
                }
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        assert!(reason.contains("unable to listen on port 40124"), "{}", reason);
        assert_eq!(session.announced_ready(), Some(false));
    }

    #[tokio::test]
    async fn test_task_session_shutdown() {
        let handle = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        });
        let mut session = ForwardSession::Task(handle);
        assert!(session.exit_reason().await.is_none());

        session.shutdown().await;
        assert!(session.exit_reason().await.is_some());
    }
}
