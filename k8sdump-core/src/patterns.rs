//! Name patterns used by the engine table.
//!
//! Secret names and data-directory files are selected with small glob
//! patterns. Patterns may contain a `{cluster}` placeholder that is replaced
//! with the custom resource name before matching.

use crate::Result;
use crate::error::CollectorError;
use regex::Regex;

/// Placeholder replaced by the cluster name.
pub const CLUSTER_PLACEHOLDER: &str = "{cluster}";

/// Substitutes the cluster name into a pattern template.
pub fn expand(template: &str, cluster: &str) -> String {
    template.replace(CLUSTER_PLACEHOLDER, cluster)
}

/// Whether the pattern contains glob metacharacters.
pub fn is_literal(pattern: &str) -> bool {
    !pattern.contains(['*', '?'])
}

/// A glob compiled to an anchored regular expression.
///
/// Supports:
/// - `*` matches any sequence of characters, including none
/// - `?` matches exactly one character
///
/// Everything else matches literally.
#[derive(Debug, Clone)]
pub struct NamePattern {
    glob: String,
    regex: Regex,
}

impl NamePattern {
    /// Compiles `glob`.
    ///
    /// # Errors
    /// Returns a configuration error if the resulting expression exceeds the
    /// regex engine's size limits.
    pub fn new(glob: &str) -> Result<Self> {
        let mut source = String::from("(?s)^");
        let mut literal = String::new();
        for c in glob.chars() {
            match c {
                '*' | '?' => {
                    source.push_str(&regex::escape(&literal));
                    literal.clear();
                    source.push_str(if c == '*' { ".*" } else { "." });
                }
                _ => literal.push(c),
            }
        }
        source.push_str(&regex::escape(&literal));
        source.push('$');

        let regex = Regex::new(&source).map_err(|e| {
            CollectorError::configuration(format!("invalid name pattern '{}': {}", glob, e))
        })?;
        Ok(Self {
            glob: glob.to_string(),
            regex,
        })
    }

    /// The glob this pattern was compiled from.
    pub fn as_str(&self) -> &str {
        &self.glob
    }

    /// Whether the whole of `name` matches.
    pub fn matches(&self, name: &str) -> bool {
        self.regex.is_match(name)
    }
}

/// One-off glob match over a whole name. A pattern that cannot be compiled
/// matches nothing.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    NamePattern::new(pattern).is_ok_and(|p| p.matches(text))
}

/// Returns the names matching any of the patterns, in input order and without
/// duplicates.
pub fn select<'a>(names: &'a [String], patterns: &[String]) -> Vec<&'a String> {
    let compiled: Vec<NamePattern> = patterns
        .iter()
        .filter_map(|p| match NamePattern::new(p) {
            Ok(pattern) => Some(pattern),
            Err(e) => {
                tracing::debug!("{}", e);
                None
            }
        })
        .collect();
    names
        .iter()
        .filter(|name| compiled.iter().any(|p| p.matches(name)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_glob_literal() {
        assert!(glob_match("grastate.dat", "grastate.dat"));
        assert!(!glob_match("grastate.dat", "grastate.dat.bak"));
        assert!(!glob_match("grastate.dat", "gvwstate.dat"));
        assert!(!glob_match("grastate.dat", "grastateXdat"));
    }

    #[test]
    fn test_glob_star() {
        assert!(glob_match("innobackup.*.log", "innobackup.backup.log"));
        assert!(glob_match("innobackup.*.log", "innobackup..log"));
        assert!(!glob_match("innobackup.*.log", "innobackup.backup.log.1"));
        assert!(glob_match("cluster1-*-ssl-keypair", "cluster1-pgbouncer-ssl-keypair"));
        assert!(glob_match("**", ""));
        assert!(glob_match("a**b", "axxb"));
    }

    #[test]
    fn test_glob_question_mark() {
        assert!(glob_match("mysqld-?.log", "mysqld-1.log"));
        assert!(!glob_match("mysqld-?.log", "mysqld-12.log"));
        assert!(!glob_match("?", ""));
    }

    #[test]
    fn test_regex_metacharacters_are_literal() {
        assert!(glob_match("a+b(c)[d]", "a+b(c)[d]"));
        assert!(!glob_match("a+b", "aab"));
        assert!(glob_match("^$|.*", "^$|xyz"));
    }

    #[test]
    fn test_name_pattern_keeps_glob() {
        let pattern = NamePattern::new("{cluster}-ssl").unwrap();
        assert_eq!(pattern.as_str(), "{cluster}-ssl");
        assert!(pattern.matches("{cluster}-ssl"));
    }

    #[test]
    fn test_expand_cluster_placeholder() {
        assert_eq!(expand("{cluster}-ssl-internal", "cluster1"), "cluster1-ssl-internal");
        assert_eq!(expand("pgo-root-cacert", "cluster1"), "pgo-root-cacert");
    }

    #[test]
    fn test_is_literal() {
        assert!(is_literal("auto.cnf"));
        assert!(!is_literal("*.log"));
        assert!(!is_literal("mysqld-?.log"));
    }

    #[test]
    fn test_select_keeps_input_order() {
        let names = vec![
            "cluster1-ssl".to_string(),
            "cluster1-secrets".to_string(),
            "cluster1-ca-cert".to_string(),
            "cluster2-ssl".to_string(),
        ];
        let patterns = vec!["cluster1-ca-cert".to_string(), "cluster1-ssl".to_string()];
        assert_eq!(select(&names, &patterns), vec!["cluster1-ssl", "cluster1-ca-cert"]);
    }

    proptest! {
        #[test]
        fn prop_literal_pattern_matches_itself(name in "[a-z0-9.+()-]{0,24}") {
            prop_assert!(glob_match(&name, &name));
            prop_assert!(glob_match("*", &name));
        }

        #[test]
        fn prop_prefix_star_matches_any_suffix(prefix in "[a-z-]{0,12}", suffix in "[a-z0-9.-]{0,12}") {
            let pattern = format!("{}*", prefix);
            let text = format!("{}{}", prefix, suffix);
            prop_assert!(glob_match(&pattern, &text));
        }

        #[test]
        fn prop_question_marks_match_exact_length(len in 0usize..10, text in "[a-z]{0,12}") {
            let pattern = "?".repeat(len);
            prop_assert_eq!(glob_match(&pattern, &text), text.chars().count() == len);
        }
    }
}
