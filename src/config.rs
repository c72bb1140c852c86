use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::models::VerdictKind;

/// Application-level constants
pub const APP_NAME: &str = "Redactado";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Log filter used when `RUST_LOG` is not set.
pub fn default_log_filter() -> &'static str {
    if cfg!(debug_assertions) {
        "info,redactado_lib=debug"
    } else {
        "info"
    }
}

/// Get the application data directory
/// Platform data dir (e.g. ~/.local/share/Redactado), home as fallback.
pub fn app_data_dir() -> PathBuf {
    dirs::data_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

// ═══════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════

/// What to do when OCR cannot produce text for an attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailMode {
    /// Let it through as `Clean`, marked degraded.
    #[default]
    Open,
    /// Escalate for human review, marked degraded.
    Closed,
}

impl FailMode {
    pub fn degraded_kind(&self) -> VerdictKind {
        match self {
            FailMode::Open => VerdictKind::Clean,
            FailMode::Closed => VerdictKind::Escalate,
        }
    }
}

impl FromStr for FailMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "open" => Ok(FailMode::Open),
            "closed" => Ok(FailMode::Closed),
            _ => Err("expected open or closed".into()),
        }
    }
}

/// Storage engine behind the case repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseBackend {
    /// Pooled SQLite database file.
    Sqlite,
    /// Single-connection SQLite in memory (`DB_TYPE=sqlite`, `DB_PATH=:memory:`).
    SqliteMemory,
    /// Process-local maps.
    Memory,
}

/// Runtime configuration, read from the environment.
#[derive(Debug, Clone)]
pub struct ModerationConfig {
    pub db_backend: DatabaseBackend,
    pub db_path: PathBuf,
    pub db_name: String,
    pub db_pool_size: usize,
    pub db_acquire_timeout: Duration,

    pub ocr_pool_size: usize,
    pub ocr_queue_depth: usize,
    pub ocr_timeout: Duration,

    pub cache_capacity: usize,
    pub cache_ttl: Duration,

    pub ingest_concurrency: usize,
    pub persist_max_attempts: u32,

    pub dispatch_max_attempts: u32,
    pub dispatch_backoff_base: Duration,
    pub dispatch_backoff_max: Duration,
    pub dispatch_timeout: Duration,
    pub dispatch_workers: usize,
    pub webhook_url: Option<String>,
    pub escalation_webhook_url: Option<String>,

    pub fail_mode: FailMode,
    pub bind_addr: SocketAddr,
    pub shutdown_grace: Duration,
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            db_backend: DatabaseBackend::Sqlite,
            db_path: app_data_dir(),
            db_name: "redactado".into(),
            db_pool_size: 4,
            db_acquire_timeout: Duration::from_secs(2),
            ocr_pool_size: 2,
            ocr_queue_depth: 16,
            ocr_timeout: Duration::from_secs(10),
            cache_capacity: 10_000,
            cache_ttl: Duration::from_secs(3600),
            ingest_concurrency: 8,
            persist_max_attempts: 3,
            dispatch_max_attempts: 5,
            dispatch_backoff_base: Duration::from_millis(500),
            dispatch_backoff_max: Duration::from_secs(30),
            dispatch_timeout: Duration::from_secs(10),
            dispatch_workers: 2,
            webhook_url: None,
            escalation_webhook_url: None,
            fail_mode: FailMode::Open,
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl ModerationConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unset or blank keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut config = Self::default();

        if let Some(path) = get("DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        if let Some(name) = get("DB_NAME") {
            config.db_name = name;
        }
        let kind = get("DB_TYPE").unwrap_or_else(|| "sqlite".into());
        config.db_backend = match kind.to_ascii_lowercase().as_str() {
            "sqlite" if config.db_path.as_os_str() == ":memory:" => DatabaseBackend::SqliteMemory,
            "sqlite" => DatabaseBackend::Sqlite,
            "memory" => DatabaseBackend::Memory,
            "mariadb" | "mysql" | "h2" => {
                return Err(ConfigError::Invalid {
                    key: "DB_TYPE",
                    value: kind,
                    reason: "server engines are not supported, use sqlite or memory".into(),
                })
            }
            _ => {
                return Err(ConfigError::Invalid {
                    key: "DB_TYPE",
                    value: kind,
                    reason: "expected sqlite or memory".into(),
                })
            }
        };

        config.db_pool_size = parse_count(&get, "DB_POOL_SIZE", config.db_pool_size)?;
        config.db_acquire_timeout = parse_millis(&get, "DB_ACQUIRE_TIMEOUT_MS", config.db_acquire_timeout)?;
        config.ocr_pool_size = parse_count(&get, "OCR_POOL_SIZE", config.ocr_pool_size)?;
        config.ocr_queue_depth = parse_count(&get, "OCR_QUEUE_DEPTH", config.ocr_queue_depth)?;
        config.ocr_timeout = parse_millis(&get, "OCR_TIMEOUT_MS", config.ocr_timeout)?;
        config.cache_capacity = parse_count(&get, "CACHE_CAPACITY", config.cache_capacity)?;
        config.cache_ttl = match get("CACHE_TTL_SECS") {
            Some(v) => Duration::from_secs(parse_value("CACHE_TTL_SECS", v)?),
            None => config.cache_ttl,
        };
        config.ingest_concurrency = parse_count(&get, "INGEST_CONCURRENCY", config.ingest_concurrency)?;
        config.persist_max_attempts =
            parse_count(&get, "PERSIST_MAX_ATTEMPTS", config.persist_max_attempts as usize)? as u32;
        config.dispatch_max_attempts =
            parse_count(&get, "DISPATCH_MAX_ATTEMPTS", config.dispatch_max_attempts as usize)? as u32;
        config.dispatch_backoff_base =
            parse_millis(&get, "DISPATCH_BACKOFF_BASE_MS", config.dispatch_backoff_base)?;
        config.dispatch_backoff_max = parse_millis(&get, "DISPATCH_BACKOFF_MAX_MS", config.dispatch_backoff_max)?;
        config.dispatch_timeout = parse_millis(&get, "DISPATCH_TIMEOUT_MS", config.dispatch_timeout)?;
        config.dispatch_workers = parse_count(&get, "DISPATCH_WORKERS", config.dispatch_workers)?;

        config.webhook_url = get("WEBHOOK_URL").map(|v| validate_url("WEBHOOK_URL", v)).transpose()?;
        config.escalation_webhook_url = get("ESCALATION_WEBHOOK_URL")
            .map(|v| validate_url("ESCALATION_WEBHOOK_URL", v))
            .transpose()?;

        if let Some(mode) = get("FAIL_MODE") {
            config.fail_mode = mode.parse().map_err(|reason| ConfigError::Invalid {
                key: "FAIL_MODE",
                value: mode.clone(),
                reason,
            })?;
        }
        if let Some(addr) = get("BIND_ADDR") {
            config.bind_addr = parse_value("BIND_ADDR", addr)?;
        }
        config.shutdown_grace = match get("SHUTDOWN_GRACE_SECS") {
            Some(v) => Duration::from_secs(parse_value("SHUTDOWN_GRACE_SECS", v)?),
            None => config.shutdown_grace,
        };

        Ok(config)
    }

    /// SQLite database file for the `Sqlite` backend.
    pub fn database_file(&self) -> PathBuf {
        if self.db_name.ends_with(".db") {
            self.db_path.join(&self.db_name)
        } else {
            self.db_path.join(format!("{}.db", self.db_name))
        }
    }
}

fn parse_value<T: FromStr>(key: &'static str, value: String) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.parse::<T>().map_err(|e| ConfigError::Invalid {
        key,
        reason: e.to_string(),
        value,
    })
}

/// Positive integer setting.
fn parse_count<G>(get: &G, key: &'static str, default: usize) -> Result<usize, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(v) => {
            let n: usize = parse_value(key, v.clone())?;
            if n == 0 {
                return Err(ConfigError::Invalid {
                    key,
                    value: v,
                    reason: "must be at least 1".into(),
                });
            }
            Ok(n)
        }
        None => Ok(default),
    }
}

fn parse_millis<G>(get: &G, key: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(v) => Ok(Duration::from_millis(parse_value(key, v)?)),
        None => Ok(default),
    }
}

fn validate_url(key: &'static str, value: String) -> Result<String, ConfigError> {
    match reqwest::Url::parse(&value) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(value),
        Ok(url) => Err(ConfigError::Invalid {
            key,
            reason: format!("unsupported scheme {}", url.scheme()),
            value,
        }),
        Err(e) => Err(ConfigError::Invalid {
            key,
            reason: e.to_string(),
            value,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_environment_empty() {
        let config = ModerationConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.db_backend, DatabaseBackend::Sqlite);
        assert_eq!(config.fail_mode, FailMode::Open);
        assert!(config.db_pool_size < config.ingest_concurrency);
        assert!(config.webhook_url.is_none());
        assert!(config.database_file().ends_with("redactado.db"));
    }

    #[test]
    fn reads_all_overrides() {
        let config = ModerationConfig::from_lookup(lookup(&[
            ("DB_TYPE", "memory"),
            ("DB_POOL_SIZE", "3"),
            ("OCR_POOL_SIZE", "6"),
            ("OCR_TIMEOUT_MS", "1500"),
            ("CACHE_TTL_SECS", "30"),
            ("DISPATCH_MAX_ATTEMPTS", "7"),
            ("WEBHOOK_URL", "https://hooks.example.com/mod"),
            ("FAIL_MODE", "CLOSED"),
            ("BIND_ADDR", "0.0.0.0:9000"),
        ]))
        .unwrap();

        assert_eq!(config.db_backend, DatabaseBackend::Memory);
        assert_eq!(config.db_pool_size, 3);
        assert_eq!(config.ocr_pool_size, 6);
        assert_eq!(config.ocr_timeout, Duration::from_millis(1500));
        assert_eq!(config.cache_ttl, Duration::from_secs(30));
        assert_eq!(config.dispatch_max_attempts, 7);
        assert_eq!(config.fail_mode, FailMode::Closed);
        assert_eq!(config.bind_addr.port(), 9000);
    }

    #[test]
    fn sqlite_memory_path_selects_in_memory_sqlite() {
        let config =
            ModerationConfig::from_lookup(lookup(&[("DB_TYPE", "sqlite"), ("DB_PATH", ":memory:")])).unwrap();
        assert_eq!(config.db_backend, DatabaseBackend::SqliteMemory);
    }

    #[test]
    fn db_name_with_extension_kept() {
        let config =
            ModerationConfig::from_lookup(lookup(&[("DB_PATH", "/tmp/mod"), ("DB_NAME", "cases.db")])).unwrap();
        assert_eq!(config.database_file(), PathBuf::from("/tmp/mod/cases.db"));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let bad = [
            ("DB_TYPE", "postgres"),
            ("DB_POOL_SIZE", "0"),
            ("OCR_TIMEOUT_MS", "soon"),
            ("FAIL_MODE", "maybe"),
            ("WEBHOOK_URL", "ftp://hooks.example.com"),
            ("BIND_ADDR", "localhost"),
        ];
        for (key, value) in bad {
            let err = ModerationConfig::from_lookup(lookup(&[(key, value)])).unwrap_err();
            match err {
                ConfigError::Invalid { key: k, .. } => assert_eq!(k, key),
            }
        }
    }

    #[test]
    fn server_engines_are_refused_by_name() {
        for engine in ["mariadb", "MARIADB", "h2"] {
            let err = ModerationConfig::from_lookup(lookup(&[("DB_TYPE", engine)])).unwrap_err();
            assert!(err.to_string().contains("server engines are not supported"), "{err}");
        }
    }

    #[test]
    fn blank_values_keep_defaults() {
        let config = ModerationConfig::from_lookup(lookup(&[("OCR_POOL_SIZE", "  ")])).unwrap();
        assert_eq!(config.ocr_pool_size, 2);
    }

    #[test]
    fn fail_mode_maps_to_degraded_kind() {
        assert_eq!(FailMode::Open.degraded_kind(), VerdictKind::Clean);
        assert_eq!(FailMode::Closed.degraded_kind(), VerdictKind::Escalate);
    }

    #[test]
    fn app_data_dir_ends_with_app_name() {
        assert!(app_data_dir().ends_with(APP_NAME));
    }

    #[test]
    fn app_version_matches_cargo() {
        assert_eq!(APP_VERSION, "0.1.0");
    }
}
