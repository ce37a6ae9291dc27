//! Core data models for a collection run.
//!
//! Everything here is created and dropped within one run. Only the archive
//! built from these values outlives the process.

use crate::error::CollectorError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Marker prefixed to captured error output inside `summary.txt`.
///
/// Downstream tooling greps for it to find instances whose summary failed
/// without having to look at exit codes.
pub const ERROR_MARKER: &str = "stderr:";

/// Supported database operator families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EngineKind {
    /// Percona XtraDB Cluster (Galera)
    Pxc,
    /// Percona Server for MySQL
    Ps,
    /// Percona Server for MongoDB
    Psmdb,
    /// Percona Distribution for PostgreSQL, operator v1
    PgV1,
    /// Percona Distribution for PostgreSQL, operator v2
    PgV2,
    /// No engine; nothing to collect per instance
    None,
}

impl EngineKind {
    /// Order in which `--resource auto` probes the cluster.
    pub const DETECTION_ORDER: [EngineKind; 5] = [
        EngineKind::Pxc,
        EngineKind::Ps,
        EngineKind::Psmdb,
        EngineKind::PgV1,
        EngineKind::PgV2,
    ];

    /// Name used on the command line and in the manifest.
    pub fn cli_name(self) -> &'static str {
        match self {
            EngineKind::Pxc => "pxc",
            EngineKind::Ps => "ps",
            EngineKind::Psmdb => "psmdb",
            EngineKind::PgV1 => "pg",
            EngineKind::PgV2 => "pgv2",
            EngineKind::None => "none",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineKind::Pxc => write!(f, "Percona XtraDB Cluster"),
            EngineKind::Ps => write!(f, "Percona Server for MySQL"),
            EngineKind::Psmdb => write!(f, "Percona Server for MongoDB"),
            EngineKind::PgV1 => write!(f, "Percona PostgreSQL (v1)"),
            EngineKind::PgV2 => write!(f, "Percona PostgreSQL (v2)"),
            EngineKind::None => write!(f, "none"),
        }
    }
}

impl FromStr for EngineKind {
    type Err = CollectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pxc" => Ok(EngineKind::Pxc),
            "ps" => Ok(EngineKind::Ps),
            "psmdb" => Ok(EngineKind::Psmdb),
            "pg" => Ok(EngineKind::PgV1),
            "pgv2" => Ok(EngineKind::PgV2),
            "none" => Ok(EngineKind::None),
            other => Err(CollectorError::configuration(format!(
                "unknown resource '{}', expected one of auto, none, pxc, ps, psmdb, pg, pgv2",
                other
            ))),
        }
    }
}

/// How the engine should be resolved for this run (the `--resource` value).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineSelection {
    /// Probe the cluster for each supported custom resource
    #[default]
    Auto,
    /// Skip engine-specific collection entirely
    None,
    /// Collect a specific engine; its resources must exist
    Explicit(EngineKind),
}

impl fmt::Display for EngineSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineSelection::Auto => write!(f, "auto"),
            EngineSelection::None => write!(f, "none"),
            EngineSelection::Explicit(kind) => write!(f, "{}", kind.cli_name()),
        }
    }
}

impl FromStr for EngineSelection {
    type Err = CollectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "auto" => Ok(EngineSelection::Auto),
            "none" => Ok(EngineSelection::None),
            other => other.parse::<EngineKind>().map(EngineSelection::Explicit),
        }
    }
}

/// One member pod of a database cluster.
///
/// Ordered by namespace, then pod name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId {
    /// Namespace of the pod
    pub namespace: String,
    /// Pod name
    pub pod: String,
}

impl InstanceId {
    /// Identifies `pod` in `namespace`.
    pub fn new(namespace: impl Into<String>, pod: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            pod: pod.into(),
        }
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.pod)
    }
}

/// A database cluster (one custom resource) and its member pods.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterTarget {
    /// Namespace of the custom resource
    pub namespace: String,
    /// Custom resource name
    pub name: String,
    /// Engine that owns the resource
    pub engine: EngineKind,
    /// Pod names, ordinal-sorted
    pub pods: Vec<String>,
}

impl ClusterTarget {
    /// Creates a target; pods are sorted by ordinal and deduplicated.
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        engine: EngineKind,
        mut pods: Vec<String>,
    ) -> Self {
        pods.sort_by(|a, b| ordinal_key(a).cmp(&ordinal_key(b)));
        pods.dedup();
        Self {
            namespace: namespace.into(),
            name: name.into(),
            engine,
            pods,
        }
    }

    /// Instance identifiers in pod order.
    pub fn instances(&self) -> impl Iterator<Item = InstanceId> + '_ {
        self.pods
            .iter()
            .map(|pod| InstanceId::new(self.namespace.clone(), pod.clone()))
    }
}

/// Sort key splitting a trailing `-<n>` ordinal off a pod name so that
/// `db-2` sorts before `db-10`.
fn ordinal_key(pod: &str) -> (&str, Option<u64>, &str) {
    match pod.rsplit_once('-') {
        Some((base, ordinal)) => match ordinal.parse::<u64>() {
            Ok(n) => (base, Some(n), pod),
            Err(_) => (pod, None, pod),
        },
        None => (pod, None, pod),
    }
}

/// Which part of the TLS setup a secret holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretRole {
    /// Certificate authority
    Ca,
    /// Client/server leaf certificate
    Leaf,
    /// Certificate used between cluster members
    Internal,
    /// Operator root certificate
    Root,
}

impl fmt::Display for SecretRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecretRole::Ca => write!(f, "ca"),
            SecretRole::Leaf => write!(f, "leaf"),
            SecretRole::Internal => write!(f, "internal"),
            SecretRole::Root => write!(f, "root"),
        }
    }
}

/// A certificate-bearing secret selected for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretRecord {
    /// Secret name
    pub name: String,
    /// Role of the certificates it holds
    pub role: SecretRole,
}

/// Human-readable rendering of the certificates inside one secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedSecret {
    /// Which secret was inspected
    pub record: SecretRecord,
    /// Rendered inspection text
    pub text: String,
}

/// Logical grouping of archive entries within an instance directory.
///
/// The derive order is the archive order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntryCategory {
    /// Container logs
    Logs,
    /// Files from the data directory
    State,
    /// Rendered certificate secrets
    Certs,
    /// Summary tool report
    Summary,
}

/// Content of a file pulled out of a pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileContent {
    /// Bytes read from the pod
    Present(Vec<u8>),
    /// The file did not exist in the pod
    Absent,
}

/// A file collected from one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Archive section the file belongs to
    pub category: EntryCategory,
    /// Path relative to the instance directory, e.g. `var/lib/mysql/grastate.dat`
    pub path: String,
    /// File bytes, or absence
    pub content: FileContent,
}

impl FileEntry {
    /// A file that was read from the pod.
    pub fn present(category: EntryCategory, path: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            category,
            path: path.into(),
            content: FileContent::Present(content),
        }
    }

    /// A file that was expected but not found.
    pub fn absent(category: EntryCategory, path: impl Into<String>) -> Self {
        Self {
            category,
            path: path.into(),
            content: FileContent::Absent,
        }
    }
}

/// Outcome of the external summary tool for one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SummaryOutcome {
    /// Tool exited successfully; combined stdout/stderr verbatim
    Success { output: Vec<u8> },
    /// Tool failed, timed out, or could not be started
    Failure { output: Vec<u8>, error: String },
}

impl SummaryOutcome {
    /// A failure with no captured output.
    pub fn failure(error: impl Into<String>) -> Self {
        Self::Failure {
            output: Vec::new(),
            error: error.into(),
        }
    }

    /// Whether the tool did not complete successfully.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure { .. })
    }

    /// Bytes written to `summary.txt`.
    ///
    /// Failures keep whatever partial output was captured and append exactly
    /// one line starting with [`ERROR_MARKER`]. Multi-line error text is
    /// folded onto that line.
    pub fn render(&self) -> Vec<u8> {
        match self {
            SummaryOutcome::Success { output } => output.clone(),
            SummaryOutcome::Failure { output, error } => {
                let mut rendered = output.clone();
                if !rendered.is_empty() && !rendered.ends_with(b"\n") {
                    rendered.push(b'\n');
                }
                let folded = error
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .collect::<Vec<_>>()
                    .join(" | ");
                rendered.extend_from_slice(format!("{} {}\n", ERROR_MARKER, folded).as_bytes());
                rendered
            }
        }
    }
}

/// Everything collected from a single instance.
#[derive(Debug, Clone)]
pub struct CollectionResult {
    /// Instance collected
    pub instance: InstanceId,
    /// Name of the cluster this instance belongs to
    pub cluster: String,
    /// Logs and state files
    pub files: Vec<FileEntry>,
    /// Inspected certificate secrets
    pub certificates: Vec<DecodedSecret>,
    /// Summary tool outcome
    pub summary: SummaryOutcome,
    /// Non-fatal problems recorded while collecting
    pub defects: Vec<String>,
    /// Set when the instance could not be collected at all
    pub fatal: Option<String>,
    /// Wall time spent on the instance
    pub elapsed: Duration,
}

impl CollectionResult {
    /// An empty result whose summary reads as not collected until a step
    /// replaces it.
    pub fn new(instance: InstanceId, cluster: impl Into<String>) -> Self {
        Self {
            instance,
            cluster: cluster.into(),
            files: Vec::new(),
            certificates: Vec::new(),
            summary: SummaryOutcome::failure("summary was not collected"),
            defects: Vec::new(),
            fatal: None,
            elapsed: Duration::ZERO,
        }
    }

    /// Records a non-fatal error for one collection step.
    pub fn record_defect(&mut self, step: &str, error: &CollectorError) {
        self.defects.push(format!("{}: {}", step, error));
    }

    /// Marks the instance as not collectable and carries the reason into the
    /// summary entry.
    pub fn mark_fatal(&mut self, error: &CollectorError) {
        let message = error.to_string();
        self.summary = SummaryOutcome::failure(message.clone());
        self.fatal = Some(message);
    }

    /// Paths of files that were expected but not found.
    pub fn absent_files(&self) -> Vec<String> {
        self.files
            .iter()
            .filter(|f| f.content == FileContent::Absent)
            .map(|f| f.path.clone())
            .collect()
    }

    /// Inspected certificate secrets with their roles, sorted by name.
    pub fn certificate_summaries(&self) -> Vec<CertificateSummary> {
        let mut summaries: Vec<CertificateSummary> = self
            .certificates
            .iter()
            .map(|c| CertificateSummary {
                secret: c.record.name.clone(),
                role: c.record.role,
            })
            .collect();
        summaries.sort_by(|a, b| a.secret.cmp(&b.secret));
        summaries
    }

    /// `Failed` when the instance aborted or its summary failed.
    pub fn status(&self) -> InstanceStatus {
        if self.fatal.is_some() || self.summary.is_failure() {
            InstanceStatus::Failed
        } else {
            InstanceStatus::Ok
        }
    }
}

/// Per-instance status recorded in the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Collected with a successful summary
    Ok,
    /// Aborted, or the summary failed
    Failed,
}

/// A single file inside the output archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Full path inside the archive, starting with the top-level directory
    pub path: String,
    /// Entry bytes
    pub content: Vec<u8>,
    /// Instance the entry came from; `None` for cluster-level entries
    pub source: Option<InstanceId>,
}

/// Cluster listed in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSummary {
    /// Namespace of the cluster
    pub namespace: String,
    /// Cluster name
    pub cluster: String,
    /// Pod names, ordinal-sorted
    pub instances: Vec<String>,
}

/// Instance listed in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSummary {
    /// `namespace/pod`
    pub id: String,
    /// Overall outcome
    pub status: InstanceStatus,
    /// Expected files that were not present
    pub absent_files: Vec<String>,
    /// Certificate secrets inspected for this instance, by name
    pub certificates: Vec<CertificateSummary>,
    /// Non-fatal step failures
    pub defects: Vec<String>,
}

/// Certificate secret listed in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateSummary {
    /// Secret name
    pub secret: String,
    /// Role of the certificates it holds
    pub role: SecretRole,
}

/// Run-level metadata stored as `metadata.json` at the archive root.
///
/// Holds no durations so that identical inputs serialize identically apart
/// from `collected_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunManifest {
    /// Name of the collecting tool
    pub tool: String,
    /// Version of the collecting tool
    pub version: String,
    /// Engine selection as given on the command line
    pub requested: String,
    /// Engine actually collected
    pub engine: String,
    /// Run start time
    pub collected_at: chrono::DateTime<chrono::Utc>,
    /// Discovered clusters
    pub targets: Vec<TargetSummary>,
    /// Collected instances
    pub instances: Vec<InstanceSummary>,
    /// Run-level warnings
    pub warnings: Vec<String>,
}

impl RunManifest {
    /// Starts a manifest for a run that resolved `selection` to `engine`.
    pub fn new(
        selection: EngineSelection,
        engine: EngineKind,
        collected_at: chrono::DateTime<chrono::Utc>,
    ) -> Self {
        Self {
            tool: crate::TOOL_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            requested: selection.to_string(),
            engine: engine.cli_name().to_string(),
            collected_at,
            targets: Vec::new(),
            instances: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Lists the discovered clusters, sorted by namespace and name.
    pub fn with_targets(mut self, targets: &[ClusterTarget]) -> Self {
        let mut summaries: Vec<TargetSummary> = targets
            .iter()
            .map(|t| TargetSummary {
                namespace: t.namespace.clone(),
                cluster: t.name.clone(),
                instances: t.pods.clone(),
            })
            .collect();
        summaries.sort_by(|a, b| (&a.namespace, &a.cluster).cmp(&(&b.namespace, &b.cluster)));
        self.targets = summaries;
        self
    }

    /// Lists every collected instance in archive order.
    pub fn with_results(mut self, results: &[CollectionResult]) -> Self {
        let mut ordered: Vec<&CollectionResult> = results.iter().collect();
        ordered.sort_by(|a, b| a.instance.cmp(&b.instance));
        self.instances = ordered
            .into_iter()
            .map(|r| InstanceSummary {
                id: r.instance.to_string(),
                status: r.status(),
                absent_files: r.absent_files(),
                certificates: r.certificate_summaries(),
                defects: r.defects.clone(),
            })
            .collect();
        self
    }

    /// Records run-level warnings, sorted.
    pub fn with_warnings(mut self, mut warnings: Vec<String>) -> Self {
        warnings.sort();
        self.warnings = warnings;
        self
    }
}
