use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Channel the watch connection listens on. Not user-configurable.
pub const WATCH_CHANNEL: &str = "postgraphile_watch";

/// Table read when `TAGS_TABLE` is not set.
pub const DEFAULT_TAGS_TABLE: &str = "smart_tags";

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_u16(profile: &str, key: &str, default: u16) -> u16 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u32(profile: &str, key: &str, default: u32) -> u32 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_bool(profile: &str, key: &str) -> bool {
    matches!(
        profiled_env_opt(profile, key).as_deref().map(str::to_ascii_lowercase).as_deref(),
        Some("1" | "true" | "yes" | "on")
    )
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub postgres: PostgresConfig,
    pub tags: TagsConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `TAGWATCH_PROFILE`. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("TAGWATCH_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            postgres: PostgresConfig::from_env_profiled(p),
            tags: TagsConfig::from_env_profiled(p),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Reject configurations the worker cannot start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.postgres.database_url().is_empty() {
            return Err(ConfigError::MissingDatabase);
        }
        validate_table_name(&self.tags.table)?;
        // Watch mode pins one pooled connection for LISTEN.
        let min_connections = if self.tags.watch { 2 } else { 1 };
        if self.postgres.max_connections < min_connections {
            return Err(ConfigError::InvalidValue {
                key: "PG_MAX_CONNECTIONS",
                value: self.postgres.max_connections.to_string(),
            });
        }
        Ok(())
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!(
            "  postgres:    host={}, db={}, pool={}",
            self.postgres.host,
            self.postgres.database,
            self.postgres.max_connections
        );
        tracing::info!(
            "  tags:        table={}, channel={}, watch={}, output={}",
            self.tags.table,
            self.tags.channel,
            self.tags.watch,
            self.tags
                .output
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "(none)".to_string())
        );
    }
}

/// Check that `name` is `ident` or `schema.ident`, where each part is a plain
/// SQL identifier. The name is interpolated into the fetch query, so nothing
/// else is accepted.
pub fn validate_table_name(name: &str) -> Result<(), ConfigError> {
    let parts: Vec<&str> = name.split('.').collect();
    let valid = (1..=2).contains(&parts.len()) && parts.iter().all(|part| is_identifier(part));
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidTableName(name.to_string()))
    }
}

fn is_identifier(part: &str) -> bool {
    let mut chars = part.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    part.len() <= 63 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

// ── PostgreSQL ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    /// Full URL; takes precedence over the individual parts.
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ssl_mode: String,
    pub max_connections: u32,
}

impl PostgresConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            url: profiled_env_opt(p, "PG_URL"),
            host: profiled_env_or(p, "PG_HOST", "localhost"),
            port: profiled_env_u16(p, "PG_PORT", 5432),
            database: profiled_env_or(p, "PG_DATABASE", "postgres"),
            username: profiled_env_opt(p, "PG_USERNAME"),
            password: profiled_env_opt(p, "PG_PASSWORD"),
            ssl_mode: profiled_env_or(p, "PG_SSL_MODE", "prefer"),
            max_connections: profiled_env_u32(p, "PG_MAX_CONNECTIONS", 4),
        }
    }

    pub fn connection_string(&self) -> String {
        let user = self.username.as_deref().unwrap_or("postgres");
        let pass = self.password.as_deref().unwrap_or("");
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode={}",
            user, pass, self.host, self.port, self.database, self.ssl_mode
        )
    }

    /// URL handed to the pool: `PG_URL` when set, else built from the parts.
    pub fn database_url(&self) -> String {
        match &self.url {
            Some(url) => url.clone(),
            None => self.connection_string(),
        }
    }

    /// Host/database pair used to identify the source in logs and errors.
    pub fn describe(&self) -> String {
        match &self.url {
            Some(url) => redact_url(url),
            None => format!("{}:{}/{}", self.host, self.port, self.database),
        }
    }
}

/// Strip credentials from a connection URL.
fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}{}", &url[..scheme_end + 3], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}

// ── Smart tags ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagsConfig {
    /// Table (optionally `schema.table`) holding the rule rows.
    pub table: String,
    /// Notification channel; always [`WATCH_CHANNEL`].
    pub channel: String,
    /// Enable watch mode at startup.
    pub watch: bool,
    /// Where the rendered tags document is written after each reload.
    pub output: Option<PathBuf>,
}

impl TagsConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            table: profiled_env_or(p, "TAGS_TABLE", DEFAULT_TAGS_TABLE),
            channel: WATCH_CHANNEL.to_string(),
            watch: profiled_env_bool(p, "TAGS_WATCH"),
            output: profiled_env_opt(p, "TAGS_OUTPUT").map(PathBuf::from),
        }
    }
}

impl Default for TagsConfig {
    fn default() -> Self {
        Self {
            table: DEFAULT_TAGS_TABLE.to_string(),
            channel: WATCH_CHANNEL.to_string(),
            watch: false,
            output: None,
        }
    }
}
