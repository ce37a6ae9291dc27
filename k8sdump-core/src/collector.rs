//! Per-instance collection.
//!
//! [`InstanceCollector::collect`] never fails. Every problem is captured in
//! the returned [`CollectionResult`]: step failures become defects, a failed
//! summary is rendered into `summary.txt`, and an unreachable cluster or a
//! cancellation stops the remaining steps for this instance only.

use crate::certs;
use crate::client::ClusterClient;
use crate::engines::{self, EngineProfile};
use crate::error::CollectorError;
use crate::models::{
    ClusterTarget, CollectionResult, EntryCategory, FileEntry, InstanceId, SecretRecord,
    SummaryOutcome,
};
use crate::patterns::{self, NamePattern};
use crate::summary::{self, SummaryInvocation, SummaryRunner};
use crate::tunnel::{LOCAL_HOST, TunnelManager};
use crate::Result;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Name of the per-instance log entry.
pub const LOGS_FILE: &str = "logs.txt";

/// Collects one instance at a time; cheap to clone and share between tasks.
#[derive(Clone)]
pub struct InstanceCollector {
    client: Arc<dyn ClusterClient>,
    tunnels: Arc<TunnelManager>,
    summaries: SummaryRunner,
    cancel: CancellationToken,
}

impl InstanceCollector {
    /// Creates a collector sharing one tunnel manager and summary runner.
    ///
    /// `cancel` stops in-flight steps; the instance is then marked failed.
    pub fn new(
        client: Arc<dyn ClusterClient>,
        tunnels: Arc<TunnelManager>,
        summaries: SummaryRunner,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            tunnels,
            summaries,
            cancel,
        }
    }

    /// Collects logs, state files, certificates, and the summary report of
    /// one pod.
    pub async fn collect(&self, target: &ClusterTarget, pod: &str) -> CollectionResult {
        let started = Instant::now();
        let instance = InstanceId::new(target.namespace.clone(), pod);
        let mut result = CollectionResult::new(instance.clone(), target.name.clone());

        let Some(profile) = engines::profile(target.engine) else {
            result.mark_fatal(&CollectorError::configuration(format!(
                "no collection profile for {}",
                target.engine.cli_name()
            )));
            return result;
        };

        tracing::debug!("Collecting {}", instance);
        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(CollectorError::Cancelled),
            steps = self.run_steps(profile, target, &instance, &mut result) => steps,
        };

        if let Err(e) = outcome {
            tracing::error!("Collection of {} aborted: {}", instance, e);
            result.mark_fatal(&e);
        }

        result.elapsed = started.elapsed();
        tracing::info!(
            "Collected {} ({:?}, {} defect(s))",
            instance,
            result.elapsed,
            result.defects.len()
        );
        result
    }

    async fn run_steps(
        &self,
        profile: &EngineProfile,
        target: &ClusterTarget,
        instance: &InstanceId,
        result: &mut CollectionResult,
    ) -> Result<()> {
        match self.client.pod_logs(&instance.namespace, &instance.pod).await {
            Ok(logs) => result
                .files
                .push(FileEntry::present(EntryCategory::Logs, LOGS_FILE, logs)),
            Err(e) => absorb(result, "logs", e)?,
        }

        if let Some(dir) = profile.data_dir
            && let Err(e) = self.collect_files(profile, dir, instance, result).await
        {
            absorb(result, "files", e)?;
        }

        if let Err(e) = self.collect_certificates(profile, target, instance, result).await {
            absorb(result, "certificates", e)?;
        }

        result.summary = match self.run_summary(profile, target, instance).await {
            Ok(outcome) => outcome,
            Err(e) if is_aborting(&e) => return Err(e),
            Err(e) => SummaryOutcome::failure(e.to_string()),
        };
        if result.summary.is_failure() {
            tracing::warn!("Summary for {} failed", instance);
        }
        Ok(())
    }

    async fn collect_files(
        &self,
        profile: &EngineProfile,
        dir: &str,
        instance: &InstanceId,
        result: &mut CollectionResult,
    ) -> Result<()> {
        let listing = self
            .client
            .list_directory(&instance.namespace, &instance.pod, profile.container, dir)
            .await?;
        let prefix = dir.trim_matches('/');

        let mut wanted = BTreeSet::new();
        let mut absent = BTreeSet::new();
        for pattern in profile.file_patterns {
            let pattern = (*pattern).to_string();
            let matches = patterns::select(&listing, std::slice::from_ref(&pattern));
            if matches.is_empty() && patterns::is_literal(&pattern) {
                absent.insert(pattern);
            }
            wanted.extend(matches.into_iter().cloned());
        }

        for name in wanted {
            let remote = format!("{}/{}", dir.trim_end_matches('/'), name);
            let local = format!("{}/{}", prefix, name);
            match self
                .client
                .copy_from_pod(&instance.namespace, &instance.pod, profile.container, &remote)
                .await
            {
                Ok(Some(bytes)) => result
                    .files
                    .push(FileEntry::present(EntryCategory::State, local, bytes)),
                Ok(None) => result.files.push(FileEntry::absent(EntryCategory::State, local)),
                Err(e) => absorb(result, &format!("copy {}", remote), e)?,
            }
        }

        for name in absent {
            tracing::debug!("{}: {}/{} not present", instance, dir, name);
            result
                .files
                .push(FileEntry::absent(EntryCategory::State, format!("{}/{}", prefix, name)));
        }
        Ok(())
    }

    async fn collect_certificates(
        &self,
        profile: &EngineProfile,
        target: &ClusterTarget,
        instance: &InstanceId,
        result: &mut CollectionResult,
    ) -> Result<()> {
        let wanted = profile
            .secret_patterns
            .iter()
            .map(|p| {
                NamePattern::new(&patterns::expand(p.pattern, &target.name))
                    .map(|pattern| (pattern, p.role))
            })
            .collect::<Result<Vec<_>>>()?;
        let names = self.client.list_secrets(&instance.namespace).await?;

        for name in names {
            let Some(role) = wanted
                .iter()
                .find(|(pattern, _)| pattern.matches(&name))
                .map(|(_, role)| *role)
            else {
                continue;
            };

            match self.client.get_secret(&instance.namespace, &name).await {
                Ok(secret) => {
                    let record = SecretRecord {
                        name: name.clone(),
                        role,
                    };
                    result
                        .certificates
                        .push(certs::decode_secret(record, &secret, target.engine));
                }
                Err(e) => absorb(result, &format!("secret {}", name), e)?,
            }
        }
        Ok(())
    }

    async fn run_summary(
        &self,
        profile: &EngineProfile,
        target: &ClusterTarget,
        instance: &InstanceId,
    ) -> Result<SummaryOutcome> {
        let credentials = summary::resolve_credentials(
            self.client.as_ref(),
            profile,
            &instance.namespace,
            &target.name,
        )
        .await?;

        let mut tunnel = self
            .tunnels
            .open(&instance.namespace, &instance.pod, profile.database_port)
            .await?;

        let invocation = SummaryInvocation::build(
            profile,
            &target.name,
            &credentials,
            LOCAL_HOST,
            tunnel.local_port(),
        );
        let outcome = self.summaries.run(&invocation).await;
        self.tunnels.close(&mut tunnel).await;
        Ok(outcome)
    }
}

fn is_aborting(error: &CollectorError) -> bool {
    matches!(
        error,
        CollectorError::ClusterUnreachable { .. } | CollectorError::Cancelled
    )
}

/// Records a step failure as a defect, or passes it on when it must stop the
/// instance.
fn absorb(result: &mut CollectionResult, step: &str, error: CollectorError) -> Result<()> {
    if is_aborting(&error) {
        return Err(error);
    }
    tracing::warn!("{}: {} failed: {}", result.instance, step, error);
    result.record_defect(step, &error);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absorb_records_defect() {
        let mut result = CollectionResult::new(InstanceId::new("db", "c-pxc-0"), "c");
        absorb(&mut result, "logs", CollectorError::remote("forbidden")).unwrap();
        assert_eq!(result.defects.len(), 1);
        assert!(result.defects[0].starts_with("logs: "));
    }

    #[test]
    fn test_absorb_passes_unreachable() {
        let mut result = CollectionResult::new(InstanceId::new("db", "c-pxc-0"), "c");
        let err = absorb(&mut result, "logs", CollectorError::unreachable("refused")).unwrap_err();
        assert!(matches!(err, CollectorError::ClusterUnreachable { .. }));
        assert!(result.defects.is_empty());
    }
}
