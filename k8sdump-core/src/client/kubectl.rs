//! [`ClusterClient`] backed by the `kubectl` binary.
//!
//! Each call spawns one `kubectl` process with an explicit `--kubeconfig`,
//! bounded by the per-operation timeout. Processes are created with
//! `kill_on_drop`, so a timed-out or cancelled call never leaves a child
//! behind.

use super::{ClusterClient, ForwardProcess, ForwardSession, ResourceRef, SecretData};
use crate::{Result, error::CollectorError};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::Deserialize;
use std::path::PathBuf;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;

/// stderr fragments that mean the API server itself could not be reached.
const UNREACHABLE_MARKERS: &[&str] = &[
    "Unable to connect to the server",
    "connection refused",
    "no such host",
    "i/o timeout",
    "TLS handshake timeout",
    "the server has asked for the client to provide credentials",
    "couldn't get current server API group list",
];

/// A list of arbitrary objects; only their metadata is read.
///
/// Custom resource kinds have no generated type, so `k8s_openapi::List`
/// cannot be used for them.
#[derive(Debug, Deserialize)]
struct MetadataList {
    #[serde(default)]
    items: Vec<MetadataOnly>,
}

#[derive(Debug, Deserialize)]
struct MetadataOnly {
    metadata: ObjectMeta,
}

/// Cluster client that shells out to `kubectl`.
#[derive(Debug, Clone)]
pub struct KubectlClient {
    program: PathBuf,
    kubeconfig: Option<PathBuf>,
    operation_timeout: Duration,
}

impl KubectlClient {
    /// Creates a client using `kubectl` from `PATH`.
    pub fn new(kubeconfig: Option<PathBuf>, operation_timeout: Duration) -> Self {
        Self {
            program: PathBuf::from("kubectl"),
            kubeconfig,
            operation_timeout,
        }
    }

    /// Builder method to use a different `kubectl` binary.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.program);
        if let Some(kubeconfig) = &self.kubeconfig {
            cmd.arg("--kubeconfig").arg(kubeconfig);
        }
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Runs kubectl to completion within the operation timeout.
    async fn run(&self, args: Vec<String>) -> Result<Output> {
        let description = describe(&args);
        tracing::trace!("kubectl {}", description);

        let output = tokio::time::timeout(self.operation_timeout, self.command(&args).output())
            .await
            .map_err(|_| CollectorError::timeout(format!("kubectl {}", description), self.operation_timeout))?
            .map_err(|e| {
                CollectorError::unreachable(format!(
                    "failed to start {}: {}",
                    self.program.display(),
                    e
                ))
            })?;
        Ok(output)
    }

    /// Runs kubectl and returns stdout, turning a non-zero exit into an error.
    async fn run_checked(&self, args: Vec<String>) -> Result<Vec<u8>> {
        let description = describe(&args);
        let output = self.run(args).await?;
        if output.status.success() {
            return Ok(output.stdout);
        }
        Err(classify_failure(&description, &output.stderr))
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[&str],
    ) -> Result<Output> {
        let mut args = strings(&["exec", "-n", namespace, pod, "-c", container, "--"]);
        args.extend(command.iter().map(|s| s.to_string()));
        self.run(args).await
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

fn describe(args: &[String]) -> String {
    args.join(" ")
}

fn stderr_text(stderr: &[u8]) -> String {
    String::from_utf8_lossy(stderr).trim().to_string()
}

fn is_unreachable(stderr: &str) -> bool {
    UNREACHABLE_MARKERS.iter().any(|m| stderr.contains(m))
}

fn classify_failure(description: &str, stderr: &[u8]) -> CollectorError {
    let text = stderr_text(stderr);
    if is_unreachable(&text) {
        CollectorError::unreachable(text)
    } else {
        CollectorError::remote(format!("kubectl {}: {}", description, text))
    }
}

fn is_missing_resource_type(stderr: &str) -> bool {
    stderr.contains("the server doesn't have a resource type")
}

fn is_missing_file(stderr: &str) -> bool {
    stderr.contains("No such file or directory")
}

fn parse_json<T: serde::de::DeserializeOwned>(context: &str, bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|source| CollectorError::Serialization {
        context: context.to_string(),
        source,
    })
}

fn parse_resource_list(bytes: &[u8], default_namespace: Option<&str>) -> Result<Vec<ResourceRef>> {
    let list: MetadataList = parse_json("custom resource list", bytes)?;
    let mut refs: Vec<ResourceRef> = list
        .items
        .into_iter()
        .filter_map(|item| {
            let name = item.metadata.name?;
            let namespace = item
                .metadata
                .namespace
                .or_else(|| default_namespace.map(str::to_string))
                .unwrap_or_default();
            Some(ResourceRef { namespace, name })
        })
        .collect();
    refs.sort();
    Ok(refs)
}

/// Converts `kubectl get secret -o json` output; values arrive base64-decoded.
fn parse_secret(bytes: &[u8]) -> Result<SecretData> {
    let object: Secret = parse_json("secret", bytes)?;
    let mut secret = SecretData::new(object.metadata.name.unwrap_or_default());
    for (key, value) in object.data.unwrap_or_default() {
        secret = secret.with_entry(key, value.0);
    }
    Ok(secret)
}

/// Non-empty lines, sorted.
fn parse_lines(bytes: &[u8]) -> Vec<String> {
    let mut names: Vec<String> = String::from_utf8_lossy(bytes)
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();
    names.sort();
    names
}

/// Parses `kubectl get -o name` output such as `secret/cluster1-ssl`.
fn parse_names(bytes: &[u8]) -> Vec<String> {
    let mut names: Vec<String> = parse_lines(bytes)
        .into_iter()
        .map(|l| l.rsplit_once('/').map_or(l.as_str(), |(_, name)| name).to_string())
        .collect();
    names.sort();
    names
}

#[async_trait]
impl ClusterClient for KubectlClient {
    async fn check_connectivity(&self) -> Result<()> {
        let output = self.run(strings(&["get", "--raw", "/version"])).await?;
        if output.status.success() {
            return Ok(());
        }
        Err(CollectorError::unreachable(stderr_text(&output.stderr)))
    }

    async fn list_custom_resources(
        &self,
        resource: &str,
        namespace: Option<&str>,
    ) -> Result<Vec<ResourceRef>> {
        let mut args = strings(&["get", resource, "-o", "json"]);
        match namespace {
            Some(ns) => args.extend(strings(&["-n", ns])),
            None => args.push("--all-namespaces".to_string()),
        }
        let description = describe(&args);
        let output = self.run(args).await?;
        if !output.status.success() {
            let stderr = stderr_text(&output.stderr);
            if is_missing_resource_type(&stderr) {
                tracing::debug!("resource type {} is not installed", resource);
                return Ok(Vec::new());
            }
            return Err(classify_failure(&description, &output.stderr));
        }
        parse_resource_list(&output.stdout, namespace)
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<String>> {
        let stdout = self
            .run_checked(strings(&["get", "pods", "-n", namespace, "-l", selector, "-o", "name"]))
            .await?;
        Ok(parse_names(&stdout))
    }

    async fn list_secrets(&self, namespace: &str) -> Result<Vec<String>> {
        let stdout = self
            .run_checked(strings(&["get", "secrets", "-n", namespace, "-o", "name"]))
            .await?;
        Ok(parse_names(&stdout))
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<SecretData> {
        let stdout = self
            .run_checked(strings(&["get", "secret", name, "-n", namespace, "-o", "json"]))
            .await?;
        parse_secret(&stdout)
    }

    async fn list_directory(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        dir: &str,
    ) -> Result<Vec<String>> {
        let output = self.exec(namespace, pod, container, &["ls", "-1A", dir]).await?;
        if output.status.success() {
            return Ok(parse_lines(&output.stdout));
        }
        let stderr = stderr_text(&output.stderr);
        if is_missing_file(&stderr) {
            return Ok(Vec::new());
        }
        Err(classify_failure(&format!("exec {} ls {}", pod, dir), &output.stderr))
    }

    async fn copy_from_pod(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        path: &str,
    ) -> Result<Option<Vec<u8>>> {
        let output = self.exec(namespace, pod, container, &["cat", path]).await?;
        if output.status.success() {
            return Ok(Some(output.stdout));
        }
        let stderr = stderr_text(&output.stderr);
        if is_missing_file(&stderr) {
            return Ok(None);
        }
        Err(classify_failure(&format!("exec {} cat {}", pod, path), &output.stderr))
    }

    async fn pod_logs(&self, namespace: &str, pod: &str) -> Result<Vec<u8>> {
        self.run_checked(strings(&[
            "logs",
            "-n",
            namespace,
            pod,
            "--all-containers=true",
            "--prefix=true",
        ]))
        .await
    }

    async fn get_resources_yaml(&self, namespace: &str, resource: &str) -> Result<Vec<u8>> {
        self.run_checked(strings(&["get", resource, "-n", namespace, "-o", "yaml"]))
            .await
    }

    async fn port_forward(
        &self,
        namespace: &str,
        pod: &str,
        local_port: u16,
        remote_port: u16,
    ) -> Result<ForwardSession> {
        let args = vec![
            "port-forward".to_string(),
            "-n".to_string(),
            namespace.to_string(),
            "--address".to_string(),
            "127.0.0.1".to_string(),
            format!("pod/{}", pod),
            format!("{}:{}", local_port, remote_port),
        ];
        let child = self.command(&args).spawn().map_err(|e| {
            CollectorError::tunnel(format!(
                "failed to start port-forward to {}/{}: {}",
                namespace, pod, e
            ))
        })?;
        tracing::debug!(
            "port-forward {}/{} 127.0.0.1:{} -> {} started",
            namespace,
            pod,
            local_port,
            remote_port
        );
        Ok(ForwardSession::Process(ForwardProcess::new(child, local_port)))
    }
}
