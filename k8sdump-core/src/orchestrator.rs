//! Run orchestration.
//!
//! One run resolves the engine, discovers the clusters, fans out instance
//! collection with bounded concurrency, and publishes a single archive.
//!
//! # Failure model
//! - Errors before fan-out (connectivity, detection, discovery) end the run
//! - Per-instance errors are captured in that instance's result only
//! - Archive errors end the run and leave no artifact behind

use crate::archive::{self, ArchiveBuilder};
use crate::client::ClusterClient;
use crate::collector::InstanceCollector;
use crate::config::CollectorConfig;
use crate::detector::ResourceDetector;
use crate::engines::{self, NAMESPACE_RESOURCES};
use crate::error::CollectorError;
use crate::models::{
    ArchiveEntry, ClusterTarget, CollectionResult, EngineKind, EngineSelection, InstanceId,
    InstanceStatus, RunManifest,
};
use crate::summary::{SummaryExecutor, SummaryRunner};
use crate::tunnel::TunnelManager;
use crate::Result;
use futures::stream::{self, StreamExt};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// What a completed run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// Engine collected
    pub engine: EngineKind,
    /// Path of the written archive
    pub output: PathBuf,
    /// Number of clusters
    pub targets: usize,
    /// Number of instances
    pub instances: usize,
    /// Instances whose collection or summary failed
    pub failed_instances: usize,
    /// Non-fatal defects across all instances
    pub defects: usize,
    /// Run-level warnings
    pub warnings: Vec<String>,
    /// Compressed archive size
    pub archive_bytes: usize,
}

/// Drives one collection run.
pub struct Orchestrator {
    config: CollectorConfig,
    client: Arc<dyn ClusterClient>,
    summaries: SummaryRunner,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Creates an orchestrator that runs summary tools as local processes.
    ///
    /// # Arguments
    /// * `config` - Validated run configuration
    /// * `client` - Cluster client shared by every instance task
    pub fn new(config: CollectorConfig, client: Arc<dyn ClusterClient>) -> Self {
        let summaries = SummaryRunner::new(config.timeouts.summary);
        Self {
            config,
            client,
            summaries,
            cancel: CancellationToken::new(),
        }
    }

    /// Builder method to replace how summary tools are executed.
    pub fn with_summary_executor(mut self, executor: Arc<dyn SummaryExecutor>) -> Self {
        self.summaries = self.summaries.with_executor(executor);
        self
    }

    /// Builder method to share a cancellation token with the caller.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Runs the collection and writes the archive.
    ///
    /// # Errors
    /// Returns a fatal error when the configuration is invalid, the cluster
    /// is unreachable, an explicitly requested engine has no resources, the
    /// run is cancelled, or the archive cannot be written.
    pub async fn run(self) -> Result<RunReport> {
        self.config.validate()?;
        let started_at = chrono::Utc::now();
        let started = Instant::now();

        let (engine, targets) = self.resolve_targets().await?;
        let mut warnings: Vec<String> = targets
            .iter()
            .filter(|t| t.pods.is_empty())
            .map(|t| format!("{}/{} has no pods", t.namespace, t.name))
            .collect();

        let cluster_entries = self.dump_namespaces(engine, &targets, &mut warnings).await;
        let results = self.collect_all(&targets).await;

        if self.cancel.is_cancelled() {
            return Err(CollectorError::Cancelled);
        }

        let manifest = RunManifest::new(self.config.selection, engine, started_at)
            .with_targets(&targets)
            .with_results(&results)
            .with_warnings(warnings.clone());

        let failed_instances = results
            .iter()
            .filter(|r| r.status() == InstanceStatus::Failed)
            .count();
        let defects = results.iter().map(|r| r.defects.len()).sum();
        let instances = results.len();

        let output = self.config.output.clone();
        let builder = ArchiveBuilder::new(started_at);
        let archive_path = output.clone();
        let archive_bytes = tokio::task::spawn_blocking(move || -> Result<usize> {
            let bytes = builder.build(&manifest, &results, cluster_entries)?;
            archive::write_atomic(&archive_path, &bytes)?;
            Ok(bytes.len())
        })
        .await
        .map_err(|e| {
            CollectorError::archive("archive task failed", std::io::Error::other(e.to_string()))
        })??;

        tracing::info!(
            "Collected {} instance(s) of {} cluster(s) in {:?}; {} failed",
            instances,
            targets.len(),
            started.elapsed(),
            failed_instances
        );

        Ok(RunReport {
            engine,
            output,
            targets: targets.len(),
            instances,
            failed_instances,
            defects,
            warnings,
            archive_bytes,
        })
    }

    async fn resolve_targets(&self) -> Result<(EngineKind, Vec<ClusterTarget>)> {
        if self.config.selection == EngineSelection::None {
            tracing::info!("Resource collection disabled");
            return Ok((EngineKind::None, Vec::new()));
        }

        let client = self.client.as_ref();
        let detector =
            ResourceDetector::new(client).with_namespace(self.config.namespace.as_deref());

        let resolve = async {
            client.check_connectivity().await?;
            let engine = detector.detect(self.config.selection).await?;
            let targets = detector
                .discover(engine, self.config.cluster.as_deref())
                .await?;
            Ok::<_, CollectorError>((engine, targets))
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(CollectorError::Cancelled),
            resolved = resolve => resolved,
        }
    }

    async fn dump_namespaces(
        &self,
        engine: EngineKind,
        targets: &[ClusterTarget],
        warnings: &mut Vec<String>,
    ) -> Vec<ArchiveEntry> {
        let Some(profile) = engines::profile(engine) else {
            return Vec::new();
        };
        let namespaces: BTreeSet<&str> = targets.iter().map(|t| t.namespace.as_str()).collect();
        let resources = NAMESPACE_RESOURCES
            .iter()
            .copied()
            .chain(std::iter::once(profile.custom_resource));

        let mut entries = Vec::new();
        for namespace in namespaces {
            for resource in resources.clone() {
                if self.cancel.is_cancelled() {
                    return entries;
                }
                match self.client.get_resources_yaml(namespace, resource).await {
                    Ok(yaml) => entries.push(archive::namespace_entry(namespace, resource, yaml)),
                    Err(e) => {
                        tracing::warn!("Dumping {} in {} failed: {}", resource, namespace, e);
                        warnings.push(format!("{}/{}: {}", namespace, resource, e));
                    }
                }
            }
        }
        entries
    }

    async fn collect_all(&self, targets: &[ClusterTarget]) -> Vec<CollectionResult> {
        let tunnels = TunnelManager::new(
            Arc::clone(&self.client),
            self.config.forward_port.clone(),
            self.config.timeouts.tunnel_startup,
        )
        .with_retry(self.config.tunnel_retry.clone());
        let collector = InstanceCollector::new(
            Arc::clone(&self.client),
            Arc::new(tunnels),
            self.summaries.clone(),
            self.cancel.clone(),
        );

        let jobs = targets.iter().flat_map(|target| {
            target.pods.iter().map(move |pod| (target.clone(), pod.clone()))
        });

        let collection_futures = jobs.map(|(target, pod)| {
            let collector = collector.clone();
            async move {
                let instance = InstanceId::new(target.namespace.clone(), pod.clone());
                let cluster = target.name.clone();
                let task = tokio::spawn(async move { collector.collect(&target, &pod).await });
                match task.await {
                    Ok(result) => result,
                    Err(e) => {
                        tracing::error!("Collection task for {} failed: {}", instance, e);
                        let mut result = CollectionResult::new(instance, cluster);
                        result.mark_fatal(&CollectorError::remote(format!(
                            "collection task failed: {}",
                            e
                        )));
                        result
                    }
                }
            }
        });

        stream::iter(collection_futures)
            .buffer_unordered(self.config.concurrency)
            .collect()
            .await
    }
}

/// Runs a collection with the default process-based summary executor.
///
/// # Example
/// ```rust,no_run
/// use k8sdump_core::client::KubectlClient;
/// use k8sdump_core::config::CollectorConfig;
/// use std::sync::Arc;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() -> k8sdump_core::Result<()> {
/// let config = CollectorConfig::new();
/// let client = Arc::new(KubectlClient::new(None, config.timeouts.operation));
/// let report = k8sdump_core::orchestrator::run(config, client, CancellationToken::new()).await?;
/// println!("Collected {} instances", report.instances);
/// # Ok(())
/// # }
/// ```
pub async fn run(
    config: CollectorConfig,
    client: Arc<dyn ClusterClient>,
    cancel: CancellationToken,
) -> Result<RunReport> {
    Orchestrator::new(config, client)
        .with_cancellation(cancel)
        .run()
        .await
}
