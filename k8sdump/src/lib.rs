//! Command line interface for k8sdump.
//!
//! Parsing and flag handling live here so that they can be tested without
//! spawning the binary; `main.rs` only wires the runtime together.

use clap::Parser;
use k8sdump_core::config::{CollectorConfig, ForwardPort, RetryPolicy, Timeouts};
use k8sdump_core::models::EngineSelection;
use k8sdump_core::{CollectorError, TOOL_NAME};
use std::path::PathBuf;
use std::time::Duration;

/// CLI argument structure
#[derive(Debug, Parser)]
#[command(name = "k8sdump")]
#[command(about = "Diagnostic bundle collector for Kubernetes database operators")]
#[command(disable_version_flag = true)]
#[command(long_about = "
k8sdump - diagnostic bundles for operator-managed databases

Collects, for every member pod of the detected database clusters:
- Container logs and engine state files
- Decoded TLS certificate details (never private keys)
- The engine summary report, run through a temporary port-forward

Everything is written to a single deterministic cluster-dump.tar.gz.

SUPPORTED RESOURCES:
  pxc, ps, psmdb, pg, pgv2, auto (detect), none (cluster metadata only)

EXAMPLES:
  k8sdump --resource pxc --namespace db
  k8sdump --kubeconfig ~/.kube/prod --resource auto --output /tmp/dump.tar.gz
")]
pub struct Cli {
    /// Path to the kubeconfig handed to kubectl
    #[arg(long, env = "KUBECONFIG", value_name = "FILE")]
    pub kubeconfig: Option<PathBuf>,

    /// Local port used for port-forwarding; empty picks a free port per tunnel
    #[arg(long, value_name = "PORT", default_value = "")]
    pub forwardport: String,

    /// Resource to collect
    #[arg(long, default_value = "auto", value_name = "RESOURCE")]
    pub resource: String,

    /// Only collect clusters in this namespace
    #[arg(long, value_name = "NAMESPACE")]
    pub namespace: Option<String>,

    /// Only collect the cluster with this name
    #[arg(long, value_name = "NAME")]
    pub cluster: Option<String>,

    /// Archive path
    #[arg(short, long, default_value = k8sdump_core::config::DEFAULT_OUTPUT)]
    pub output: PathBuf,

    /// Instances collected in parallel (1-50)
    #[arg(long, default_value_t = 4)]
    pub concurrency: usize,

    /// Seconds to wait for a tunnel to accept connections
    #[arg(long, default_value_t = 30, value_name = "SECS")]
    pub tunnel_timeout: u64,

    /// Seconds allowed for each cluster API call
    #[arg(long, default_value_t = 60, value_name = "SECS")]
    pub operation_timeout: u64,

    /// Seconds allowed for one summary tool run
    #[arg(long, default_value_t = 300, value_name = "SECS")]
    pub summary_timeout: u64,

    /// Extra attempts to open a tunnel before giving up
    #[arg(long, default_value_t = 0, value_name = "N")]
    pub tunnel_retries: u32,

    /// Increase verbosity
    #[arg(
        short,
        long,
        action = clap::ArgAction::Count,
        help = "Increase verbosity (-v, -vv, -vvv)"
    )]
    pub verbose: u8,

    /// Suppress output
    #[arg(short, long, help = "Suppress all output except errors")]
    pub quiet: bool,

    /// Print version information and exit
    #[arg(long)]
    pub version: bool,
}

/// Text printed by `--version`.
pub fn version_text() -> String {
    format!("{}\nVersion v{}\n", TOOL_NAME, env!("CARGO_PKG_VERSION"))
}

/// Builds the run configuration from parsed flags.
///
/// # Errors
/// Returns a configuration error for an unknown resource or out-of-range
/// values.
pub fn build_config(cli: &Cli) -> Result<CollectorConfig, CollectorError> {
    let selection: EngineSelection = cli.resource.parse()?;
    let timeouts = Timeouts {
        tunnel_startup: Duration::from_secs(cli.tunnel_timeout),
        operation: Duration::from_secs(cli.operation_timeout),
        summary: Duration::from_secs(cli.summary_timeout),
    };

    let config = CollectorConfig::new()
        .with_kubeconfig(cli.kubeconfig.clone().filter(|p| !p.as_os_str().is_empty()))
        .with_selection(selection)
        .with_namespace(cli.namespace.clone())
        .with_cluster(cli.cluster.clone())
        .with_forward_port(ForwardPort::from_hint(Some(&cli.forwardport)))
        .with_output(cli.output.clone())
        .with_timeouts(timeouts)
        .with_tunnel_retry(RetryPolicy::none().with_retries(cli.tunnel_retries))
        .with_concurrency(cli.concurrency)?;

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8sdump_core::models::EngineKind;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["k8sdump"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        temp_env::with_var_unset("KUBECONFIG", || {
            let cli = parse(&[]);
            let config = build_config(&cli).unwrap();

            assert_eq!(config.selection, EngineSelection::Auto);
            assert_eq!(config.forward_port, ForwardPort::Auto);
            assert_eq!(config.output, PathBuf::from("cluster-dump.tar.gz"));
            assert_eq!(config.concurrency, 4);
            assert!(config.kubeconfig.is_none());
            assert_eq!(config.tunnel_retry.max_attempts, 1);
        });
    }

    #[test]
    fn test_kubeconfig_from_env() {
        temp_env::with_var("KUBECONFIG", Some("/tmp/kubeconfig"), || {
            let cli = parse(&["--resource", "pxc"]);
            let config = build_config(&cli).unwrap();
            assert_eq!(config.kubeconfig, Some(PathBuf::from("/tmp/kubeconfig")));
            assert_eq!(config.selection, EngineSelection::Explicit(EngineKind::Pxc));
        });
    }

    #[test]
    fn test_flag_overrides_env() {
        temp_env::with_var("KUBECONFIG", Some("/tmp/from-env"), || {
            let cli = parse(&["--kubeconfig", "/tmp/from-flag"]);
            assert_eq!(cli.kubeconfig, Some(PathBuf::from("/tmp/from-flag")));
        });
    }

    #[test]
    fn test_garbage_forwardport_is_kept() {
        let cli = parse(&["--forwardport", "/home/user/src"]);
        let config = build_config(&cli).unwrap();
        assert_eq!(
            config.forward_port,
            ForwardPort::Invalid("/home/user/src".to_string())
        );
    }

    #[test]
    fn test_unknown_resource_is_config_error() {
        let cli = parse(&["--resource", "oracle"]);
        assert!(matches!(
            build_config(&cli),
            Err(CollectorError::Configuration { .. })
        ));
    }

    #[test]
    fn test_concurrency_out_of_range() {
        let cli = parse(&["--concurrency", "0"]);
        assert!(build_config(&cli).is_err());
        let cli = parse(&["--concurrency", "51"]);
        assert!(build_config(&cli).is_err());
    }

    #[test]
    fn test_retries_and_timeouts() {
        let cli = parse(&[
            "--tunnel-retries",
            "2",
            "--tunnel-timeout",
            "5",
            "--summary-timeout",
            "60",
        ]);
        let config = build_config(&cli).unwrap();
        assert_eq!(config.tunnel_retry.max_attempts, 3);
        assert_eq!(config.timeouts.tunnel_startup, Duration::from_secs(5));
        assert_eq!(config.timeouts.summary, Duration::from_secs(60));
    }

    #[test]
    fn test_version_text() {
        let text = version_text();
        assert!(text.starts_with("k8sdump\nVersion v"));
        assert!(text.ends_with('\n'));
    }
}
