//! Error types for collection runs.
//!
//! Errors fall into two groups. Errors raised before fan-out (detection,
//! connectivity, archive setup) are fatal and end the run. Errors raised while
//! collecting a single instance are captured into that instance's
//! [`CollectionResult`](crate::models::CollectionResult) and only ever surface
//! as text inside the archive.
//!
//! No variant carries secret values. Messages built from command lines use
//! [`redact_command`] so passwords handed to summary tools never leak.

use std::time::Duration;
use thiserror::Error;

/// Main error type for k8sdump operations.
#[derive(Debug, Error)]
pub enum CollectorError {
    /// An explicitly requested resource does not exist in the cluster
    #[error("Not found: {resource}")]
    NotFound { resource: String },

    /// Establishing or using a forwarded connection failed
    #[error("Tunnel error: {context}")]
    Tunnel { context: String },

    /// A copy, exec, or listing call against the cluster failed
    #[error("Remote operation failed: {context}")]
    RemoteOperation { context: String },

    /// The cluster API could not be reached at all
    #[error("Cluster unreachable: {context}")]
    ClusterUnreachable { context: String },

    /// Writing or publishing the archive failed
    #[error("Archive error: {context}")]
    Archive {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Invalid configuration or flag combination
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// An operation exceeded its time budget
    #[error("Operation timed out after {timeout:?}: {context}")]
    Timeout { context: String, timeout: Duration },

    /// The run was cancelled from outside
    #[error("Collection cancelled")]
    Cancelled,

    /// I/O operation failed
    #[error("I/O operation failed: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Serialization or deserialization failed
    #[error("Serialization failed: {context}")]
    Serialization {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Convenience type alias for Results with CollectorError
pub type Result<T> = std::result::Result<T, CollectorError>;

/// Replaces the value of password-bearing arguments with `****`.
///
/// Recognises `--password=<v>` and `--password <v>` style flags used by
/// the MySQL and MongoDB summary tools.
///
/// # Example
///
/// ```rust
/// use k8sdump_core::error::redact_command;
///
/// let args = vec!["--user=root".to_string(), "--password=hunter2".to_string()];
/// assert_eq!(redact_command("pt-mongodb-summary", &args), "pt-mongodb-summary --user=root --password=****");
/// ```
pub fn redact_command(program: &str, args: &[String]) -> String {
    let mut parts = vec![program.to_string()];
    let mut hide_next = false;
    for arg in args {
        if hide_next {
            parts.push("****".to_string());
            hide_next = false;
            continue;
        }
        if let Some((flag, _)) = arg.split_once('=')
            && flag.to_lowercase().contains("password")
        {
            parts.push(format!("{flag}=****"));
            continue;
        }
        if arg == "--password" {
            hide_next = true;
        }
        parts.push(arg.clone());
    }
    parts.join(" ")
}

impl CollectorError {
    /// Creates a not-found error
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    /// Creates a tunnel error
    pub fn tunnel(context: impl Into<String>) -> Self {
        Self::Tunnel {
            context: context.into(),
        }
    }

    /// Creates a remote operation error
    pub fn remote(context: impl Into<String>) -> Self {
        Self::RemoteOperation {
            context: context.into(),
        }
    }

    /// Creates a cluster-unreachable error
    pub fn unreachable(context: impl Into<String>) -> Self {
        Self::ClusterUnreachable {
            context: context.into(),
        }
    }

    /// Creates an archive error with context
    pub fn archive(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Archive {
            context: context.into(),
            source,
        }
    }

    /// Creates a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a timeout error
    pub fn timeout(context: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            context: context.into(),
            timeout,
        }
    }

    /// Creates an I/O error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_command_inline_password() {
        let args = vec![
            "--username=databaseAdmin".to_string(),
            "--password=s3cret".to_string(),
            "127.0.0.1:27017".to_string(),
        ];
        let redacted = redact_command("pt-mongodb-summary", &args);

        assert!(!redacted.contains("s3cret"));
        assert!(redacted.contains("--password=****"));
        assert!(redacted.contains("--username=databaseAdmin"));
    }

    #[test]
    fn test_redact_command_separate_password() {
        let args = vec!["--password".to_string(), "s3cret".to_string(), "-h".to_string()];
        let redacted = redact_command("tool", &args);

        assert_eq!(redacted, "tool --password **** -h");
    }

    #[test]
    fn test_redact_command_no_password() {
        let args = vec!["-h".to_string(), "127.0.0.1".to_string()];
        assert_eq!(redact_command("psql", &args), "psql -h 127.0.0.1");
    }

    #[test]
    fn test_error_creation() {
        let error = CollectorError::configuration("concurrency must be positive");
        assert!(error.to_string().contains("concurrency must be positive"));

        let error = CollectorError::not_found("perconaxtradbclusters.pxc.percona.com");
        assert!(error.to_string().contains("perconaxtradbclusters"));
    }
}
