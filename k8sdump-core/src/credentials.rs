//! Database credentials read from operator-managed user secrets.
//!
//! Summary tools need a database login. The operator stores it in a secret;
//! it is held here only for the duration of one summary invocation.
//!
//! # Security
//! - Values live in `Zeroizing` containers and are cleared on drop
//! - `Debug` output never includes the password

use std::fmt;
use zeroize::Zeroizing;

/// Username and password for a summary tool login.
///
/// # Example
///
/// ```rust
/// use k8sdump_core::credentials::DatabaseCredentials;
///
/// let creds = DatabaseCredentials::new("root", "hunter2");
/// assert_eq!(creds.username(), "root");
/// assert!(!format!("{:?}", creds).contains("hunter2"));
/// ```
#[derive(Clone)]
pub struct DatabaseCredentials {
    username: Zeroizing<String>,
    password: Zeroizing<String>,
}

impl DatabaseCredentials {
    /// Wraps a username and password read from a users secret.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Zeroizing::new(username.into()),
            password: Zeroizing::new(password.into()),
        }
    }

    /// The login name; safe to log.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Exposes the password for handing to a child process.
    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for DatabaseCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseCredentials")
            .field("username", &self.username.as_str())
            .field("password", &"****")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_new() {
        let creds = DatabaseCredentials::new("databaseAdmin", "s3cret");
        assert_eq!(creds.username(), "databaseAdmin");
        assert_eq!(creds.password(), "s3cret");
    }

    #[test]
    fn test_credentials_empty_password() {
        let creds = DatabaseCredentials::new("postgres", "");
        assert!(creds.password().is_empty());
    }

    #[test]
    fn test_debug_redacts_password() {
        let creds = DatabaseCredentials::new("root", "super_secret_password_123");
        let debug = format!("{:?}", creds);
        assert!(!debug.contains("super_secret_password_123"));
        assert!(debug.contains("root"));
        assert!(debug.contains("****"));
    }

    #[test]
    fn test_credentials_clone() {
        let creds1 = DatabaseCredentials::new("user", "pass");
        let creds2 = creds1.clone();
        assert_eq!(creds1.username(), creds2.username());
        assert_eq!(creds1.password(), creds2.password());
    }
}
