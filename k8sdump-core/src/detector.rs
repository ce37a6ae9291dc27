//! Engine detection and target discovery.
//!
//! `--resource auto` probes each supported custom resource type in a fixed
//! order and picks the first that has at least one object. An explicit engine
//! must have objects; `none` never touches the cluster.

use crate::client::ClusterClient;
use crate::engines::{self, EngineProfile};
use crate::error::CollectorError;
use crate::models::{ClusterTarget, EngineKind, EngineSelection};
use crate::patterns;
use crate::Result;

/// Resolves the engine and the clusters to collect.
pub struct ResourceDetector<'a> {
    client: &'a dyn ClusterClient,
    namespace: Option<&'a str>,
}

impl<'a> ResourceDetector<'a> {
    /// Creates a detector that searches all namespaces.
    pub fn new(client: &'a dyn ClusterClient) -> Self {
        Self {
            client,
            namespace: None,
        }
    }

    /// Restricts every lookup to one namespace.
    pub fn with_namespace(mut self, namespace: Option<&'a str>) -> Self {
        self.namespace = namespace;
        self
    }

    /// Resolves `selection` to a concrete engine.
    ///
    /// # Errors
    /// - `NotFound` when an explicitly requested engine has no resources
    /// - `ClusterUnreachable` when the cluster cannot be queried
    pub async fn detect(&self, selection: EngineSelection) -> Result<EngineKind> {
        match selection {
            EngineSelection::None => Ok(EngineKind::None),
            EngineSelection::Explicit(EngineKind::None) => Ok(EngineKind::None),
            EngineSelection::Explicit(kind) => {
                let profile = profile_for(kind)?;
                if self.has_resources(profile).await? {
                    Ok(kind)
                } else {
                    Err(CollectorError::not_found(self.scoped(profile.custom_resource)))
                }
            }
            EngineSelection::Auto => {
                for kind in EngineKind::DETECTION_ORDER {
                    let profile = profile_for(kind)?;
                    if self.has_resources(profile).await? {
                        tracing::info!("Detected {} ({})", kind, profile.custom_resource);
                        return Ok(kind);
                    }
                    tracing::debug!("No {} found", profile.custom_resource);
                }
                tracing::info!("No supported database resources found");
                Ok(EngineKind::None)
            }
        }
    }

    /// Lists the clusters of `engine` with their member pods.
    ///
    /// # Errors
    /// Returns `NotFound` when a `cluster` filter matches nothing.
    pub async fn discover(
        &self,
        engine: EngineKind,
        cluster: Option<&str>,
    ) -> Result<Vec<ClusterTarget>> {
        let Some(profile) = engines::profile(engine) else {
            return Ok(Vec::new());
        };

        let resources = self
            .client
            .list_custom_resources(profile.custom_resource, self.namespace)
            .await?;

        let mut targets = Vec::new();
        for resource in resources
            .into_iter()
            .filter(|r| cluster.is_none_or(|c| c == r.name))
        {
            let selector = patterns::expand(profile.pod_selector, &resource.name);
            let pods = self.client.list_pods(&resource.namespace, &selector).await?;
            tracing::debug!(
                "{}/{} has {} pod(s)",
                resource.namespace,
                resource.name,
                pods.len()
            );
            targets.push(ClusterTarget::new(
                resource.namespace,
                resource.name,
                engine,
                pods,
            ));
        }

        if targets.is_empty()
            && let Some(name) = cluster
        {
            return Err(CollectorError::not_found(
                self.scoped(&format!("{} {}", profile.custom_resource, name)),
            ));
        }

        targets.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
        Ok(targets)
    }

    async fn has_resources(&self, profile: &EngineProfile) -> Result<bool> {
        let found = self
            .client
            .list_custom_resources(profile.custom_resource, self.namespace)
            .await?;
        Ok(!found.is_empty())
    }

    fn scoped(&self, what: &str) -> String {
        match self.namespace {
            Some(ns) => format!("{} in namespace {}", what, ns),
            None => what.to_string(),
        }
    }
}

fn profile_for(kind: EngineKind) -> Result<&'static EngineProfile> {
    engines::profile(kind).ok_or_else(|| {
        CollectorError::configuration(format!("no collection profile for {}", kind.cli_name()))
    })
}
