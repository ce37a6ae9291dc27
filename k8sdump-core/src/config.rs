//! Run configuration.
//!
//! [`CollectorConfig`] is built once from the command line, validated, and then
//! shared read-only by every component for the rest of the run.

use crate::error::CollectorError;
use crate::models::EngineSelection;
use std::path::PathBuf;
use std::time::Duration;

/// Default name of the output archive, relative to the working directory.
pub const DEFAULT_OUTPUT: &str = "cluster-dump.tar.gz";

/// Upper bound for parallel instance collection.
pub const MAX_CONCURRENCY: usize = 50;

/// Retry policy for opening a tunnel.
///
/// The default makes a single attempt. Observed behavior of the collector is
/// that one failed forward marks the instance failed without retrying.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each retry
    pub backoff_factor: f32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Policy with no retries.
    pub fn none() -> Self {
        Self::default()
    }

    /// Builder method to set the number of retries after the first attempt.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.max_attempts = retries.saturating_add(1);
        self
    }

    /// Delay to wait before attempt number `attempt` (1-based, so attempt 2 is
    /// the first retry).
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt.saturating_sub(2)).unwrap_or(i32::MAX);
        let factor = f64::from(self.backoff_factor.max(1.0)).powi(exponent);
        let delay = self.initial_delay.as_secs_f64() * factor;
        if delay >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay)
    }
}

/// Time budgets for the suspension points of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeouts {
    /// How long a tunnel may take to accept connections
    pub tunnel_startup: Duration,
    /// Budget for each list/get/exec/copy call against the cluster
    pub operation: Duration,
    /// Budget for one external summary tool run
    pub summary: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            tunnel_startup: Duration::from_secs(30),
            operation: Duration::from_secs(60),
            summary: Duration::from_secs(300),
        }
    }
}

/// Local port selection for tunnels, taken from `--forwardport`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ForwardPort {
    /// Allocate an unused local port per tunnel
    #[default]
    Auto,
    /// Always use this local port; tunnels are serialized
    Fixed(u16),
    /// The hint was not a usable port; every tunnel open fails with this text
    Invalid(String),
}

impl ForwardPort {
    /// Interprets the raw `--forwardport` value.
    ///
    /// An unusable hint is kept rather than rejected so that each instance
    /// records the failure in its summary and the run still completes.
    pub fn from_hint(hint: Option<&str>) -> Self {
        match hint.map(str::trim) {
            None | Some("") | Some("0") => ForwardPort::Auto,
            Some(raw) => match raw.parse::<u16>() {
                Ok(port) => ForwardPort::Fixed(port),
                Err(_) => ForwardPort::Invalid(raw.to_string()),
            },
        }
    }
}

/// Configuration for one collection run.
///
/// # Example
/// ```rust
/// use k8sdump_core::config::CollectorConfig;
/// use k8sdump_core::models::EngineSelection;
///
/// let config = CollectorConfig::new()
///     .with_selection(EngineSelection::None)
///     .with_concurrency(8)
///     .unwrap();
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Kubeconfig handed to the cluster client; `None` uses the client default
    pub kubeconfig: Option<PathBuf>,
    /// `--resource` value
    pub selection: EngineSelection,
    /// Restrict discovery to this namespace
    pub namespace: Option<String>,
    /// Restrict discovery to clusters with this name
    pub cluster: Option<String>,
    /// Local port policy for tunnels
    pub forward_port: ForwardPort,
    /// Final archive path
    pub output: PathBuf,
    /// Maximum instances collected at once (1-50)
    pub concurrency: usize,
    /// Per-operation time budgets
    pub timeouts: Timeouts,
    /// Retry policy for tunnel starts
    pub tunnel_retry: RetryPolicy,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            kubeconfig: None,
            selection: EngineSelection::Auto,
            namespace: None,
            cluster: None,
            forward_port: ForwardPort::Auto,
            output: PathBuf::from(DEFAULT_OUTPUT),
            concurrency: 4,
            timeouts: Timeouts::default(),
            tunnel_retry: RetryPolicy::default(),
        }
    }
}

impl CollectorConfig {
    /// Creates a new config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns a configuration error for out-of-range values or flag
    /// combinations that cannot work together.
    pub fn validate(&self) -> crate::Result<()> {
        if self.concurrency == 0 || self.concurrency > MAX_CONCURRENCY {
            return Err(CollectorError::configuration(format!(
                "concurrency must be between 1 and {}",
                MAX_CONCURRENCY
            )));
        }

        if self.timeouts.tunnel_startup.is_zero()
            || self.timeouts.operation.is_zero()
            || self.timeouts.summary.is_zero()
        {
            return Err(CollectorError::configuration(
                "timeouts must be greater than zero",
            ));
        }

        if self.tunnel_retry.max_attempts == 0 {
            return Err(CollectorError::configuration(
                "tunnel retry policy needs at least one attempt",
            ));
        }

        if matches!(self.selection, EngineSelection::None)
            && (self.namespace.is_some() || self.cluster.is_some())
        {
            return Err(CollectorError::configuration(
                "--namespace and --cluster cannot be combined with --resource none",
            ));
        }

        if self.output.as_os_str().is_empty() || self.output.file_name().is_none() {
            return Err(CollectorError::configuration(
                "output path must name a file",
            ));
        }

        Ok(())
    }

    /// Builder method to set the kubeconfig passed to kubectl.
    pub fn with_kubeconfig(mut self, kubeconfig: Option<PathBuf>) -> Self {
        self.kubeconfig = kubeconfig;
        self
    }

    /// Builder method to choose the engine.
    pub fn with_selection(mut self, selection: EngineSelection) -> Self {
        self.selection = selection;
        self
    }

    /// Builder method to restrict the run to one namespace. Empty means all.
    pub fn with_namespace(mut self, namespace: Option<String>) -> Self {
        self.namespace = namespace.filter(|n| !n.is_empty());
        self
    }

    /// Builder method to restrict the run to one cluster. Empty means all.
    pub fn with_cluster(mut self, cluster: Option<String>) -> Self {
        self.cluster = cluster.filter(|c| !c.is_empty());
        self
    }

    /// Builder method to set the local tunnel port policy.
    pub fn with_forward_port(mut self, forward_port: ForwardPort) -> Self {
        self.forward_port = forward_port;
        self
    }

    /// Builder method to set the archive path.
    pub fn with_output(mut self, output: PathBuf) -> Self {
        self.output = output;
        self
    }

    /// Builder method to set concurrency with validation.
    pub fn with_concurrency(mut self, concurrency: usize) -> crate::Result<Self> {
        if concurrency == 0 || concurrency > MAX_CONCURRENCY {
            return Err(CollectorError::configuration(format!(
                "concurrency must be between 1 and {}",
                MAX_CONCURRENCY
            )));
        }
        self.concurrency = concurrency;
        Ok(self)
    }

    /// Builder method to replace all timeouts.
    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Builder method to retry failed tunnel starts.
    pub fn with_tunnel_retry(mut self, policy: RetryPolicy) -> Self {
        self.tunnel_retry = policy;
        self
    }
}
