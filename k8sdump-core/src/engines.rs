//! Per-engine collection profiles.
//!
//! Each supported operator differs in how its pods are labelled, where its
//! state files live, which secrets hold certificates, and which client
//! produces the summary report. Those differences are captured as data in one
//! [`EngineProfile`] per [`EngineKind`] and looked up once the engine has been
//! resolved. Templates may use the `{cluster}` placeholder; summary tool
//! arguments may also use `{host}`, `{port}`, `{user}`, and `{password}`.

use crate::models::{EngineKind, SecretRole};

/// A secret name pattern and the role of the certificates it holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecretPattern {
    /// Glob, may contain `{cluster}`
    pub pattern: &'static str,
    /// Role recorded for matching secrets
    pub role: SecretRole,
}

const fn secret(pattern: &'static str, role: SecretRole) -> SecretPattern {
    SecretPattern { pattern, role }
}

/// Where the summary tool's login name comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserSource {
    /// A fixed account name
    Fixed(&'static str),
    /// A key inside the users secret
    SecretKey(&'static str),
}

/// External client that produces the per-instance summary report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SummaryTool {
    /// Executable name
    pub program: &'static str,
    /// Argument templates
    pub args: &'static [&'static str],
    /// Environment handed to the client; values are templates
    pub env: &'static [(&'static str, &'static str)],
    /// Secret holding the login, as a template
    pub users_secret: &'static str,
    /// Where the login name comes from
    pub user: UserSource,
    /// Key holding the password in the users secret
    pub password_key: &'static str,
}

/// Everything engine-specific the collector needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineProfile {
    /// Engine this profile describes
    pub kind: EngineKind,
    /// Fully qualified custom resource type, e.g. `perconaxtradbclusters.pxc.percona.com`
    pub custom_resource: &'static str,
    /// Label selector for the member pods, as a template
    pub pod_selector: &'static str,
    /// Container that runs the database
    pub container: &'static str,
    /// Directory inside the container holding state and log files
    pub data_dir: Option<&'static str>,
    /// File name globs collected from `data_dir`
    pub file_patterns: &'static [&'static str],
    /// Certificate secrets to inspect
    pub secret_patterns: &'static [SecretPattern],
    /// Keys inside certificate secrets that hold certificates
    pub cert_keys: &'static [&'static str],
    /// Database port inside the pod
    pub database_port: u16,
    /// Summary tool invocation
    pub summary: SummaryTool,
}

/// Namespaced resource types dumped once per namespace holding a target.
pub const NAMESPACE_RESOURCES: &[&str] = &[
    "pods",
    "statefulsets",
    "deployments",
    "services",
    "persistentvolumeclaims",
    "configmaps",
    "events",
];

const MYSQL_SUMMARY_ARGS: &[&str] = &["--host={host}", "--port={port}", "--user={user}"];
const MYSQL_SUMMARY_ENV: &[(&str, &str)] = &[("MYSQL_PWD", "{password}")];

const PG_SUMMARY_ARGS: &[&str] = &[
    "-h",
    "{host}",
    "-p",
    "{port}",
    "-U",
    "{user}",
    "-d",
    "postgres",
    "-X",
    "-P",
    "pager=off",
    "-c",
    "SELECT version();",
    "-c",
    "SELECT datname, pg_size_pretty(pg_database_size(datname)) AS size FROM pg_database ORDER BY datname;",
    "-c",
    "SELECT pid, usename, application_name, client_addr, state, sync_state FROM pg_stat_replication;",
    "-c",
    "SELECT pid, usename, datname, state, backend_start, wait_event_type FROM pg_stat_activity ORDER BY pid;",
    "-c",
    "SHOW ALL;",
];
const PG_SUMMARY_ENV: &[(&str, &str)] = &[("PGPASSWORD", "{password}"), ("PGCONNECT_TIMEOUT", "10")];

const PXC_FILES: &[&str] = &[
    "auto.cnf",
    "grastate.dat",
    "gvwstate.dat",
    "innobackup.backup.log",
    "innobackup.move.log",
    "innobackup.prepare.log",
    "mysqld-error.log",
    "mysqld.post.processing.log",
];

const MYSQL_CERT_KEYS: &[&str] = &["ca.crt", "tls.crt"];

static PROFILES: [EngineProfile; 5] = [
    EngineProfile {
        kind: EngineKind::Pxc,
        custom_resource: "perconaxtradbclusters.pxc.percona.com",
        pod_selector: "app.kubernetes.io/instance={cluster},app.kubernetes.io/component=pxc",
        container: "pxc",
        data_dir: Some("/var/lib/mysql"),
        file_patterns: PXC_FILES,
        secret_patterns: &[
            secret("{cluster}-ssl", SecretRole::Leaf),
            secret("{cluster}-ssl-internal", SecretRole::Internal),
            secret("{cluster}-ca-cert", SecretRole::Ca),
        ],
        cert_keys: MYSQL_CERT_KEYS,
        database_port: 3306,
        summary: SummaryTool {
            program: "pt-mysql-summary",
            args: MYSQL_SUMMARY_ARGS,
            env: MYSQL_SUMMARY_ENV,
            users_secret: "{cluster}-secrets",
            user: UserSource::Fixed("root"),
            password_key: "root",
        },
    },
    EngineProfile {
        kind: EngineKind::Ps,
        custom_resource: "perconaservermysqls.ps.percona.com",
        pod_selector: "app.kubernetes.io/instance={cluster},app.kubernetes.io/component=mysql",
        container: "mysql",
        data_dir: Some("/var/lib/mysql"),
        file_patterns: &["auto.cnf", "mysqld-error.log"],
        secret_patterns: &[
            secret("{cluster}-ssl", SecretRole::Leaf),
            secret("{cluster}-ca-cert", SecretRole::Ca),
        ],
        cert_keys: MYSQL_CERT_KEYS,
        database_port: 3306,
        summary: SummaryTool {
            program: "pt-mysql-summary",
            args: MYSQL_SUMMARY_ARGS,
            env: MYSQL_SUMMARY_ENV,
            users_secret: "{cluster}-secrets",
            user: UserSource::Fixed("root"),
            password_key: "root",
        },
    },
    EngineProfile {
        kind: EngineKind::Psmdb,
        custom_resource: "perconaservermongodbs.psmdb.percona.com",
        pod_selector: "app.kubernetes.io/instance={cluster},app.kubernetes.io/component=mongod",
        container: "mongod",
        data_dir: Some("/data/db"),
        file_patterns: &["WiredTiger", "WiredTiger.turtle"],
        secret_patterns: &[
            secret("{cluster}-ssl", SecretRole::Leaf),
            secret("{cluster}-ssl-internal", SecretRole::Internal),
            secret("{cluster}-ca-cert", SecretRole::Ca),
        ],
        cert_keys: MYSQL_CERT_KEYS,
        database_port: 27017,
        summary: SummaryTool {
            program: "pt-mongodb-summary",
            args: &[
                "--username={user}",
                "--password={password}",
                "--authenticationDatabase=admin",
                "{host}:{port}",
            ],
            env: &[],
            users_secret: "{cluster}-secrets",
            user: UserSource::SecretKey("MONGODB_DATABASE_ADMIN_USER"),
            password_key: "MONGODB_DATABASE_ADMIN_PASSWORD",
        },
    },
    EngineProfile {
        kind: EngineKind::PgV1,
        custom_resource: "perconapgclusters.pg.percona.com",
        pod_selector: "pg-cluster={cluster},pgo-pg-database=true",
        container: "database",
        data_dir: None,
        file_patterns: &[],
        secret_patterns: &[
            secret("{cluster}-ssl-ca", SecretRole::Ca),
            secret("{cluster}-ssl-keypair", SecretRole::Leaf),
            secret("{cluster}-pgbouncer-ssl-keypair", SecretRole::Leaf),
            secret("pgo.tls", SecretRole::Leaf),
        ],
        cert_keys: &["ca.crt", "tls.crt"],
        database_port: 5432,
        summary: SummaryTool {
            program: "psql",
            args: PG_SUMMARY_ARGS,
            env: PG_SUMMARY_ENV,
            users_secret: "{cluster}-postgres-secret",
            user: UserSource::SecretKey("username"),
            password_key: "password",
        },
    },
    EngineProfile {
        kind: EngineKind::PgV2,
        custom_resource: "perconapgclusters.pgv2.percona.com",
        pod_selector: "postgres-operator.crunchydata.com/cluster={cluster},postgres-operator.crunchydata.com/instance",
        container: "database",
        data_dir: None,
        file_patterns: &[],
        secret_patterns: &[
            secret("{cluster}-cluster-cert", SecretRole::Leaf),
            secret("pgo-root-cacert", SecretRole::Root),
        ],
        cert_keys: &["ca.crt", "tls.crt", "root.crt"],
        database_port: 5432,
        summary: SummaryTool {
            program: "psql",
            args: PG_SUMMARY_ARGS,
            env: PG_SUMMARY_ENV,
            users_secret: "{cluster}-pguser-{cluster}",
            user: UserSource::SecretKey("user"),
            password_key: "password",
        },
    },
];

/// Returns the profile for an engine; `EngineKind::None` has none.
pub fn profile(kind: EngineKind) -> Option<&'static EngineProfile> {
    PROFILES.iter().find(|p| p.kind == kind)
}

/// All profiles in detection order.
pub fn profiles() -> impl Iterator<Item = &'static EngineProfile> {
    EngineKind::DETECTION_ORDER
        .into_iter()
        .filter_map(profile)
}
