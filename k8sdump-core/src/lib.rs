//! Collection engine for k8sdump.
//!
//! This crate builds a diagnostic bundle from an operator-managed database
//! cluster running in Kubernetes: it detects the engine, fans out over every
//! member pod, pulls logs, state files, and certificate details, runs the
//! engine's summary tool through a forwarded tunnel, and assembles one
//! deterministic `cluster-dump.tar.gz`.
//!
//! # Guarantees
//! - All cluster access is read-only
//! - Database credentials are held in zeroizing buffers and never logged
//! - Private keys inside TLS secrets are never read out
//! - One failing instance never prevents the others from being archived
//!
//! # Architecture
//! - [`client::ClusterClient`] is the only boundary to the cluster
//! - [`engines`] holds per-engine differences as data
//! - [`orchestrator::Orchestrator`] drives detection, fan-out, and archiving

pub mod archive;
pub mod certs;
pub mod client;
pub mod collector;
pub mod config;
pub mod credentials;
pub mod detector;
pub mod engines;
pub mod error;
pub mod logging;
pub mod models;
pub mod orchestrator;
pub mod patterns;
pub mod summary;
pub mod tunnel;

/// Tool name recorded in the manifest and printed by `--version`.
pub const TOOL_NAME: &str = "k8sdump";

// Re-export commonly used types
pub use client::{ClusterClient, KubectlClient};
pub use config::{CollectorConfig, ForwardPort, RetryPolicy, Timeouts};
pub use error::{CollectorError, Result};
pub use models::{
    ClusterTarget, CollectionResult, EngineKind, EngineSelection, InstanceId, RunManifest,
    SummaryOutcome,
};
pub use orchestrator::{Orchestrator, RunReport};
