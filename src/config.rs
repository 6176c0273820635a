// ABOUTME: TOML configuration for the orchestrator and its migration pairs
// ABOUTME: Builds libpq connection strings and applies include/exclude object filters

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::context::{qualify, ContextOptions, NewMigration, ObjectSelection};

/// A libpq-style connection string. Display and Debug never show the password.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Dsn(String);

impl Dsn {
    pub fn new(raw: impl Into<String>) -> Self {
        Dsn(raw.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn redacted(&self) -> String {
        let raw = self.0.as_str();
        if let Some(rest) = raw
            .strip_prefix("postgresql://")
            .or_else(|| raw.strip_prefix("postgres://"))
        {
            let scheme = &raw[..raw.len() - rest.len()];
            return match (rest.find('@'), rest.find(':')) {
                (Some(at), Some(colon)) if colon < at => {
                    format!("{}{}:****{}", scheme, &rest[..colon], &rest[at..])
                }
                _ => raw.to_string(),
            };
        }
        redact_key_value(raw)
    }
}

fn redact_key_value(raw: &str) -> String {
    let Some(start) = raw.find("password=") else {
        return raw.to_string();
    };
    let value_start = start + "password=".len();
    let tail = &raw[value_start..];
    let value_len = if let Some(quoted) = tail.strip_prefix('\'') {
        let mut escaped = false;
        let mut end = quoted.len();
        for (i, c) in quoted.char_indices() {
            match c {
                '\\' if !escaped => escaped = true,
                '\'' if !escaped => {
                    end = i;
                    break;
                }
                _ => escaped = false,
            }
        }
        (end + 2).min(tail.len())
    } else {
        tail.find(' ').unwrap_or(tail.len())
    };
    format!("{}****{}", &raw[..value_start], &tail[value_len..])
}

impl fmt::Display for Dsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

impl fmt::Debug for Dsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Dsn({})", self.redacted())
    }
}

fn quote_value(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub name: String,
    #[serde(default)]
    pub pw: Option<String>,
}

/// One PostgreSQL instance taking part in a migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbConfig {
    pub host: String,
    /// Address the other side of the pair can reach this instance on.
    pub ip: String,
    pub db: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub root_user: User,
    pub owner_user: User,
    pub pglogical_user: User,
    #[serde(default)]
    pub other_users: Vec<User>,
    #[serde(default)]
    pub sslmode: Option<String>,
}

fn default_port() -> u16 {
    5432
}

impl DbConfig {
    fn dsn_for(&self, user: &User) -> Dsn {
        let mut parts = vec![
            format!("host={}", quote_value(&self.ip)),
            format!("port={}", self.port),
            format!("dbname={}", quote_value(&self.db)),
            format!("user={}", quote_value(&user.name)),
        ];
        if let Some(pw) = &user.pw {
            parts.push(format!("password={}", quote_value(pw)));
        }
        if let Some(mode) = &self.sslmode {
            parts.push(format!("sslmode={}", mode));
        }
        parts.push("application_name=pglogical-cutover".to_string());
        Dsn(parts.join(" "))
    }

    pub fn root_dsn(&self) -> Dsn {
        self.dsn_for(&self.root_user)
    }

    pub fn pglogical_dsn(&self) -> Dsn {
        self.dsn_for(&self.pglogical_user)
    }

    fn validate(&self, side: &str) -> Result<()> {
        for (field, value) in [("host", &self.host), ("ip", &self.ip), ("db", &self.db)] {
            if value.trim().is_empty() {
                bail!("{}.{} must not be empty", side, field);
            }
        }
        for (field, user) in [
            ("root_user", &self.root_user),
            ("owner_user", &self.owner_user),
            ("pglogical_user", &self.pglogical_user),
        ] {
            if user.name.trim().is_empty() {
                bail!("{}.{}.name must not be empty", side, field);
            }
            match &user.pw {
                Some(pw) if !pw.is_empty() => {}
                _ => bail!("{}.{} requires a password", side, field),
            }
        }
        Ok(())
    }
}

/// Include/exclude lists applied to discovered object names.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(default)]
    pub include: Option<Vec<String>>,
    #[serde(default)]
    pub exclude: Option<Vec<String>>,
}

impl FilterConfig {
    /// Keep names in `include` (when set), then drop names in `exclude`.
    /// Entries may be bare or schema-qualified; bare entries are qualified with `schema`.
    pub fn apply(&self, schema: &str, items: &[String]) -> Vec<String> {
        let normalize = |list: &Option<Vec<String>>| -> Option<HashSet<String>> {
            list.as_ref()
                .map(|names| names.iter().map(|n| qualify(schema, n)).collect())
        };
        let include = normalize(&self.include);
        let exclude = normalize(&self.exclude);

        let mut out: Vec<String> = items
            .iter()
            .map(|item| qualify(schema, item))
            .filter(|item| include.as_ref().map_or(true, |inc| inc.contains(item)))
            .filter(|item| exclude.as_ref().map_or(true, |exc| !exc.contains(item)))
            .collect();
        out.sort();
        out.dedup();
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}
fn default_initial_backoff_ms() -> u64 {
    200
}
fn default_max_backoff_ms() -> u64 {
    10_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_clean_polls_required")]
    pub clean_polls_required: u32,
    #[serde(default = "default_max_lag_bytes")]
    pub max_lag_bytes: u64,
    #[serde(default = "default_lag_freshness_secs")]
    pub lag_freshness_secs: u64,
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
    #[serde(default = "default_drain_poll_interval_ms")]
    pub drain_poll_interval_ms: u64,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_max_idle_per_endpoint")]
    pub max_idle_per_endpoint: usize,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_statement_timeout_secs")]
    pub statement_timeout_secs: u64,
    #[serde(default = "default_context_step_timeout_secs")]
    pub context_step_timeout_secs: u64,
    #[serde(default)]
    pub accept_invalid_certs: bool,
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_state_path() -> PathBuf {
    PathBuf::from("pglogical-cutover.db")
}
fn default_batch_size() -> usize {
    25
}
fn default_poll_interval_secs() -> u64 {
    10
}
fn default_clean_polls_required() -> u32 {
    3
}
fn default_max_lag_bytes() -> u64 {
    16 * 1024 * 1024
}
fn default_lag_freshness_secs() -> u64 {
    60
}
fn default_drain_timeout_secs() -> u64 {
    300
}
fn default_drain_poll_interval_ms() -> u64 {
    500
}
fn default_max_sessions() -> usize {
    16
}
fn default_max_idle_per_endpoint() -> usize {
    2
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_statement_timeout_secs() -> u64 {
    30
}
fn default_context_step_timeout_secs() -> u64 {
    600
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            state_path: default_state_path(),
            batch_size: default_batch_size(),
            poll_interval_secs: default_poll_interval_secs(),
            clean_polls_required: default_clean_polls_required(),
            max_lag_bytes: default_max_lag_bytes(),
            lag_freshness_secs: default_lag_freshness_secs(),
            drain_timeout_secs: default_drain_timeout_secs(),
            drain_poll_interval_ms: default_drain_poll_interval_ms(),
            max_sessions: default_max_sessions(),
            max_idle_per_endpoint: default_max_idle_per_endpoint(),
            connect_timeout_secs: default_connect_timeout_secs(),
            statement_timeout_secs: default_statement_timeout_secs(),
            context_step_timeout_secs: default_context_step_timeout_secs(),
            accept_invalid_certs: false,
            retry: RetryConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn drain_poll_interval(&self) -> Duration {
        Duration::from_millis(self.drain_poll_interval_ms)
    }

    pub fn lag_freshness(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lag_freshness_secs as i64)
    }

    pub fn context_step_timeout(&self) -> Duration {
        Duration::from_secs(self.context_step_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Base URL of the traffic router API. Without it the operator confirms the flip by hand.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_router_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_router_timeout_secs() -> u64 {
    30
}

/// A source->target database pair, identified by `{dc}/{db}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairConfig {
    pub db: String,
    pub dc: String,
    pub src: DbConfig,
    pub dst: DbConfig,
    #[serde(default = "default_schema_name")]
    pub schema_name: String,
    #[serde(default)]
    pub tables: Option<FilterConfig>,
    #[serde(default)]
    pub sequences: Option<FilterConfig>,
    #[serde(default)]
    pub table_list: Option<Vec<String>>,
    #[serde(default)]
    pub sequence_list: Option<Vec<String>>,
    #[serde(default)]
    pub frozen_roles: Option<Vec<String>>,
    #[serde(default)]
    pub copy_schema: bool,
    #[serde(default)]
    pub verify_checksums: bool,
}

fn default_schema_name() -> String {
    "public".to_string()
}

impl PairConfig {
    pub fn pair_id(&self) -> String {
        format!("{}/{}", self.dc, self.db)
    }

    fn selection(
        &self,
        explicit: &Option<Vec<String>>,
        filter: &Option<FilterConfig>,
    ) -> ObjectSelection {
        match explicit {
            Some(list) => ObjectSelection::Explicit(
                list.iter().map(|n| qualify(&self.schema_name, n)).collect(),
            ),
            None => ObjectSelection::Discover(filter.clone().unwrap_or_default()),
        }
    }

    pub fn to_new_migration(&self) -> NewMigration {
        let frozen_roles = self.frozen_roles.clone().unwrap_or_else(|| {
            std::iter::once(self.src.owner_user.name.clone())
                .chain(self.src.other_users.iter().map(|u| u.name.clone()))
                .collect()
        });
        NewMigration {
            pair_id: self.pair_id(),
            source_dsn: self.src.root_dsn(),
            target_dsn: self.dst.root_dsn(),
            provider_dsn: self.src.pglogical_dsn(),
            schema_name: self.schema_name.clone(),
            tables: self.selection(&self.table_list, &self.tables),
            sequences: self.selection(&self.sequence_list, &self.sequences),
            frozen_roles,
            options: ContextOptions {
                copy_schema: self.copy_schema,
                verify_checksums: self.verify_checksums,
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub pairs: Vec<PairConfig>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let config: Config = toml::from_str(raw).context("Failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let o = &self.orchestrator;
        if o.batch_size == 0 {
            bail!("orchestrator.batch_size must be at least 1");
        }
        if o.poll_interval_secs == 0 || o.drain_poll_interval_ms == 0 {
            bail!("poll intervals must be non-zero");
        }
        if o.clean_polls_required == 0 {
            bail!("orchestrator.clean_polls_required must be at least 1");
        }
        if o.max_sessions == 0 {
            bail!("orchestrator.max_sessions must be at least 1");
        }
        if o.retry.max_attempts == 0 {
            bail!("orchestrator.retry.max_attempts must be at least 1");
        }

        let mut seen = HashSet::new();
        for pair in &self.pairs {
            if pair.db.trim().is_empty() || pair.dc.trim().is_empty() {
                bail!("every pair needs non-empty db and dc");
            }
            if !seen.insert(pair.pair_id()) {
                bail!("duplicate pair {}", pair.pair_id());
            }
            pair.src
                .validate(&format!("{}.src", pair.pair_id()))?;
            pair.dst
                .validate(&format!("{}.dst", pair.pair_id()))?;
        }
        Ok(())
    }

    pub fn pair(&self, pair_id: &str) -> Option<&PairConfig> {
        self.pairs.iter().find(|p| p.pair_id() == pair_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[orchestrator]
batch_size = 2
poll_interval_secs = 5

[router]
url = "http://router.internal:8080"

[[pairs]]
db = "orders"
dc = "eu1"
schema_name = "public"
table_list = ["users", "billing.invoices"]

[pairs.src]
host = "src.db"
ip = "10.0.0.1"
db = "orders"
root_user = { name = "postgres", pw = "root'pw" }
owner_user = { name = "owner", pw = "o" }
pglogical_user = { name = "pglogical", pw = "p" }
other_users = [{ name = "reporting" }]

[pairs.dst]
host = "dst.db"
ip = "10.0.0.2"
db = "orders"
port = 6432
root_user = { name = "postgres", pw = "r" }
owner_user = { name = "owner", pw = "o" }
pglogical_user = { name = "pglogical", pw = "p" }
"#;

    #[test]
    fn test_parse_sample() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.orchestrator.batch_size, 2);
        assert_eq!(config.orchestrator.clean_polls_required, 3);
        assert_eq!(config.pairs.len(), 1);

        let pair = config.pair("eu1/orders").unwrap();
        let new = pair.to_new_migration();
        assert_eq!(new.pair_id, "eu1/orders");
        assert_eq!(
            new.tables,
            ObjectSelection::Explicit(vec![
                "public.users".to_string(),
                "billing.invoices".to_string()
            ])
        );
        assert_eq!(new.sequences, ObjectSelection::Discover(FilterConfig::default()));
        assert_eq!(new.frozen_roles, vec!["owner", "reporting"]);
        assert!(new.target_dsn.expose().contains("port=6432"));
        assert!(new.provider_dsn.expose().contains("user='pglogical'"));
    }

    #[test]
    fn test_missing_password_rejected() {
        let broken = SAMPLE.replace(r#"pglogical_user = { name = "pglogical", pw = "p" }"#, r#"pglogical_user = { name = "pglogical" }"#);
        let err = Config::parse(&broken).unwrap_err();
        assert!(format!("{:#}", err).contains("requires a password"));
    }

    #[test]
    fn test_dsn_redaction() {
        let config = Config::parse(SAMPLE).unwrap();
        let dsn = config.pairs[0].src.root_dsn();
        assert!(dsn.expose().contains(r"password='root\'pw'"));
        let shown = dsn.to_string();
        assert!(!shown.contains("root"), "{}", shown);
        assert!(shown.contains("password=****"));
        assert!(shown.contains("application_name"));

        let uri = Dsn::new("postgresql://app:secret@db:5432/orders");
        assert_eq!(uri.to_string(), "postgresql://app:****@db:5432/orders");
    }

    #[test]
    fn test_filter_include_then_exclude() {
        let items: Vec<String> = ["a", "b", "c", "public.d"].iter().map(|s| s.to_string()).collect();
        let filter = FilterConfig {
            include: Some(vec!["a".into(), "b".into(), "public.d".into()]),
            exclude: Some(vec!["public.b".into()]),
        };
        assert_eq!(filter.apply("public", &items), vec!["public.a", "public.d"]);

        let everything = FilterConfig::default();
        assert_eq!(everything.apply("public", &items).len(), 4);
    }
}
