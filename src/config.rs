use std::{net::SocketAddr, sync::Arc, time::Duration};

use clap::Parser;
use serde::Deserialize;

use crate::{
    postgres_storage::{PostgresOptions, PostgresStorage},
    sqlite_storage::SqliteStorage,
    storage::{InMemoryStorage, StorageBackend, StorageError},
    store::{LedgerPolicy, OverdraftPolicy},
};

#[derive(Parser, Debug)]
#[command(name = "simplebank", about = "SimpleBank - transactional ledger backend")]
pub struct CliArgs {
    /// Path to config file
    #[arg(short, long, default_value = "simplebank.toml")]
    pub config: String,

    /// Port to listen on (overrides config file)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Log level (overrides config file)
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Storage backend: memory, sqlite or postgres (overrides config file)
    #[arg(long)]
    pub storage: Option<StorageKind>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_server")]
    pub server: ServerConfig,

    #[serde(default = "default_logging")]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub ledger: LedgerConfig,

    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    Memory,
    Sqlite,
    Postgres,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageKind,

    /// SQLite database file
    #[serde(default = "default_sqlite_path")]
    pub path: String,

    /// PostgreSQL connection string
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// How long a transfer waits on another transfer's row lock.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LedgerConfig {
    #[serde(default)]
    pub overdraft: OverdraftPolicy,

    #[serde(default = "default_currencies")]
    pub currencies: Vec<String>,

    /// Deadline applied to every request's unit of work.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AuthConfig {
    /// When true, all API endpoints (except /health and /metrics) require authentication.
    #[serde(default)]
    pub enabled: bool,

    /// Static API keys. Each key has a name (for audit) and a role.
    #[serde(default)]
    pub api_keys: Vec<ApiKeyEntry>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiKeyEntry {
    pub name: String,
    pub key: String,
    #[serde(default = "default_role")]
    pub role: String,
}

fn default_role() -> String {
    "reader".to_string()
}

fn default_server() -> ServerConfig {
    ServerConfig {
        host: default_host(),
        port: default_port(),
    }
}

fn default_logging() -> LoggingConfig {
    LoggingConfig {
        level: default_log_level(),
        json: false,
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_sqlite_path() -> String {
    "simplebank.db".to_string()
}

fn default_pool_size() -> usize {
    10
}

fn default_lock_timeout_ms() -> u64 {
    5000
}

fn default_currencies() -> Vec<String> {
    LedgerPolicy::default().currencies
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            backend: StorageKind::default(),
            path: default_sqlite_path(),
            url: None,
            pool_size: default_pool_size(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        LedgerConfig {
            overdraft: OverdraftPolicy::default(),
            currencies: default_currencies(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: default_server(),
            logging: default_logging(),
            storage: StorageConfig::default(),
            ledger: LedgerConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl Config {
    pub fn load(cli: &CliArgs) -> Self {
        let mut config = match std::fs::read_to_string(&cli.config) {
            Ok(contents) => Self::parse(&contents).unwrap_or_else(|e| {
                eprintln!("Warning: Failed to parse config file: {}", e);
                Config::default()
            }),
            Err(e) => {
                eprintln!("Warning: Failed to read config file {}: {}; using defaults", cli.config, e);
                Config::default()
            }
        };

        // CLI overrides
        if let Some(port) = cli.port {
            config.server.port = port;
        }
        if let Some(ref level) = cli.log_level {
            config.logging.level = level.clone();
        }
        if let Some(backend) = cli.storage {
            config.storage.backend = backend;
        }

        config
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.server.host, self.server.port).parse()
    }
}

impl StorageConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn open(&self) -> Result<Arc<dyn StorageBackend>, StorageError> {
        let backend: Arc<dyn StorageBackend> = match self.backend {
            StorageKind::Memory => Arc::new(InMemoryStorage::with_lock_timeout(self.lock_timeout())),
            StorageKind::Sqlite => Arc::new(SqliteStorage::new(&self.path)?),
            StorageKind::Postgres => {
                let url = self
                    .url
                    .as_deref()
                    .ok_or_else(|| StorageError::Other("storage.url is required for postgres".to_string()))?;
                Arc::new(PostgresStorage::with_options(
                    url,
                    PostgresOptions {
                        pool_size: self.pool_size,
                        lock_timeout: self.lock_timeout(),
                        ..PostgresOptions::default()
                    },
                )?)
            }
        };
        Ok(backend)
    }
}

impl LedgerConfig {
    pub fn policy(&self) -> LedgerPolicy {
        LedgerPolicy {
            overdraft: self.overdraft,
            currencies: self.currencies.clone(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.storage.backend, StorageKind::Memory);
        assert_eq!(config.ledger.overdraft, OverdraftPolicy::Allow);
        assert_eq!(config.ledger.currencies, vec!["USD", "EUR", "CAD"]);
        assert!(!config.auth.enabled);
    }

    #[test]
    fn test_full_config() {
        let config = Config::parse(
            r#"
            [server]
            port = 9000

            [logging]
            level = "debug"
            json = true

            [storage]
            backend = "sqlite"
            path = "/tmp/bank.db"
            lock_timeout_ms = 250

            [ledger]
            overdraft = "reject"
            currencies = ["USD"]

            [auth]
            enabled = true
            api_keys = [{ name = "ops", key = "secret", role = "writer" }]
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 9000);
        assert!(config.logging.json);
        assert_eq!(config.storage.backend, StorageKind::Sqlite);
        assert_eq!(config.storage.lock_timeout(), Duration::from_millis(250));
        assert_eq!(config.ledger.policy().overdraft, OverdraftPolicy::Reject);
        assert_eq!(config.auth.api_keys[0].role, "writer");
    }

    #[test]
    fn test_missing_config_file_uses_defaults_with_overrides() {
        let cli = CliArgs {
            config: "/nonexistent/simplebank.toml".to_string(),
            port: Some(9100),
            log_level: None,
            storage: Some(StorageKind::Sqlite),
        };
        let config = Config::load(&cli);
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.storage.backend, StorageKind::Sqlite);
        assert_eq!(config.ledger.request_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_postgres_requires_url() {
        let storage = StorageConfig {
            backend: StorageKind::Postgres,
            ..StorageConfig::default()
        };
        assert!(storage.open().is_err());
    }
}
