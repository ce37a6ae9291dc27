//! Logging setup for the k8sdump binary.
//!
//! Verbosity flags pick the default level for this tool's own crates. A
//! `RUST_LOG` directive, when set, replaces it, so that e.g.
//! `RUST_LOG=k8sdump_core::tunnel=trace` narrows output to one module.

use crate::Result;
use crate::error::CollectorError;
use tracing_subscriber::EnvFilter;

/// Crates whose events are shown by default.
const OWN_TARGETS: &[&str] = &["k8sdump", "k8sdump_core"];

/// Maps CLI verbosity flags onto a tracing level.
///
/// `quiet` wins over any verbosity count.
pub fn level_for(verbose: u8, quiet: bool) -> tracing::Level {
    match (quiet, verbose) {
        (true, _) => tracing::Level::ERROR,
        (false, 0) => tracing::Level::INFO,
        (false, 1) => tracing::Level::DEBUG,
        (false, _) => tracing::Level::TRACE,
    }
}

/// Filter directives for the given flags, e.g. `warn,k8sdump=debug,k8sdump_core=debug`.
///
/// Other crates stay at `warn` unless the tool itself is quieter than that.
pub fn default_directives(verbose: u8, quiet: bool) -> String {
    let level = level_for(verbose, quiet);
    let base = if quiet { "error" } else { "warn" };
    let own: Vec<String> = OWN_TARGETS
        .iter()
        .map(|target| format!("{}={}", target, level.as_str().to_lowercase()))
        .collect();
    format!("{},{}", base, own.join(","))
}

/// Initializes structured logging.
///
/// Log lines go to stderr; stdout is reserved for `--version` output.
///
/// # Errors
/// Returns a configuration error if `RUST_LOG` cannot be parsed or a global
/// subscriber is already installed.
///
/// # Example
/// ```rust,no_run
/// use k8sdump_core::logging::init_logging;
///
/// init_logging(1, false).expect("Failed to initialize logging");
/// ```
pub fn init_logging(verbose: u8, quiet: bool) -> Result<()> {
    let filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) if !directives.trim().is_empty() => EnvFilter::try_new(directives)
            .map_err(|e| CollectorError::configuration(format!("invalid RUST_LOG: {}", e)))?,
        _ => EnvFilter::new(default_directives(verbose, quiet)),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(verbose > 1)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init()
        .map_err(|e| {
            CollectorError::configuration(format!("Failed to initialize logging: {}", e))
        })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // A global subscriber can be installed only once per process, so the
    // tests stop at the filter.
    #[test]
    fn test_verbosity_levels() {
        let test_cases = [
            ((true, 0), tracing::Level::ERROR),
            ((true, 5), tracing::Level::ERROR),
            ((false, 0), tracing::Level::INFO),
            ((false, 1), tracing::Level::DEBUG),
            ((false, 2), tracing::Level::TRACE),
            ((false, 10), tracing::Level::TRACE),
        ];

        for ((quiet, verbose), expected) in test_cases {
            assert_eq!(
                level_for(verbose, quiet),
                expected,
                "Failed for quiet={}, verbose={}",
                quiet,
                verbose
            );
        }
    }

    #[test]
    fn test_default_directives() {
        assert_eq!(
            default_directives(0, false),
            "warn,k8sdump=info,k8sdump_core=info"
        );
        assert_eq!(
            default_directives(2, false),
            "warn,k8sdump=trace,k8sdump_core=trace"
        );
        assert_eq!(
            default_directives(3, true),
            "error,k8sdump=error,k8sdump_core=error"
        );
    }

    #[test]
    fn test_default_directives_parse() {
        for (verbose, quiet) in [(0, false), (1, false), (4, true)] {
            assert!(EnvFilter::try_new(default_directives(verbose, quiet)).is_ok());
        }
    }
}
