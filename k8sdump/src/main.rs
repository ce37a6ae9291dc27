//! k8sdump binary.
//!
//! Exit status: 0 when an archive was written (per-instance failures are
//! recorded inside it), 1 for fatal errors, 2 for configuration errors.

use anyhow::Context;
use clap::Parser;
use k8sdump::{Cli, build_config, version_text};
use k8sdump_core::{CollectorError, KubectlClient, logging::init_logging, orchestrator};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const EXIT_FATAL: u8 = 1;
const EXIT_CONFIG: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.version {
        print!("{}", version_text());
        return ExitCode::SUCCESS;
    }

    if let Err(e) = init_logging(cli.verbose, cli.quiet) {
        eprintln!("{}", e);
        return ExitCode::from(EXIT_FATAL);
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::from(exit_code(&e))
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = build_config(&cli)?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping collection");
            on_signal.cancel();
        }
    });

    let client = Arc::new(KubectlClient::new(
        config.kubeconfig.clone(),
        config.timeouts.operation,
    ));
    let output = config.output.clone();

    let report = orchestrator::run(config, client, cancel)
        .await
        .with_context(|| format!("collection into {} failed", output.display()))?;

    for warning in &report.warnings {
        warn!("{}", warning);
    }
    info!(
        "Wrote {} ({} bytes): engine {}, {} cluster(s), {} instance(s), {} failed",
        report.output.display(),
        report.archive_bytes,
        report.engine.cli_name(),
        report.targets,
        report.instances,
        report.failed_instances
    );
    Ok(())
}

fn exit_code(error: &anyhow::Error) -> u8 {
    match error.downcast_ref::<CollectorError>() {
        Some(CollectorError::Configuration { .. }) => EXIT_CONFIG,
        _ => EXIT_FATAL,
    }
}
