// Configuration for the analysis sandbox
//
// Configuration is loaded in order of precedence:
// 1. Environment variables (highest priority)
// 2. Config file (./config.yml, or --config <path>)
// 3. Built-in defaults for the selected environment (lowest priority)
//
// ENVIRONMENT=development short-circuits the file entirely and uses the
// development profile, matching how the sandbox is run during connector
// development.

use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Where a connector's results are delivered.
///
/// `sink.kind` in the config file selects one of these arms; the dispatcher
/// matches exhaustively on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    /// Append-only report stream.
    Feed,
    /// Alerting channel. Reserved: dispatch to a watchlist is a no-op.
    Watchlist,
}

/// A configured result sink for one connector.
#[derive(Debug, Clone, Deserialize)]
pub struct SinkSpec {
    pub kind: SinkKind,
    /// Identifier of the feed or watchlist at the sink service.
    pub id: String,
}

/// Unified Binary Store connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UbsConfig {
    /// Base URL of the UBS/backend API.
    pub url: String,
    /// Organization key, part of every API path.
    pub org_key: String,
    /// API credentials, sent as `X-Auth-Token: <secret>/<id>`.
    pub api_id: String,
    pub api_secret: String,
    /// Requested lifetime of the time-limited download URLs, in seconds.
    pub expiration_seconds: u64,
}

impl Default for UbsConfig {
    fn default() -> Self {
        Self {
            url: "https://defense.conferdeploy.net".to_string(),
            org_key: String::new(),
            api_id: String::new(),
            api_secret: String::new(),
            expiration_seconds: 3600,
        }
    }
}

/// Application configuration
///
/// Immutable for the lifetime of the process; every component receives a
/// clone (or reads through the shared engine).
#[derive(Debug, Clone)]
pub struct Config {
    /// "production" or "development"
    pub environment: String,

    /// Log level: trace, debug, info, warn, error (RUST_LOG overrides)
    pub loglevel: String,

    /// Path to the SQLite database (a `sqlite://` prefix is tolerated)
    pub database_url: String,

    /// Redis connection URL for the binary cache
    pub redis_url: String,

    /// Address the HTTP front-end binds to
    pub http_host: String,
    pub http_port: u16,

    /// Per-binary analysis/download timeout in seconds (None = no timeout)
    pub binary_timeout: Option<u64>,

    /// How many times a 404ing download URL is retried before giving up
    pub binary_fetch_max_retry: u32,

    /// Batch window: number of results per dispatch chunk
    pub feed_size: usize,

    /// Directories scanned for per-connector `<name>/config.yml` files
    pub connector_dirs: Vec<PathBuf>,

    /// Worker tasks per queue
    pub workers_per_queue: usize,

    /// Unified Binary Store settings
    pub ubs: UbsConfig,

    /// connector_name -> sink; connectors without an entry are drained
    /// but never dispatched
    pub sinks: HashMap<String, SinkSpec>,
}

/// Config file structure (everything optional; missing fields fall back to
/// the environment profile's defaults)
#[derive(Debug, Deserialize, Default)]
struct FileConfig {
    environment: Option<String>,
    loglevel: Option<String>,
    database_url: Option<String>,
    redis_url: Option<String>,
    http_host: Option<String>,
    http_port: Option<u16>,
    binary_timeout: Option<u64>,
    binary_fetch_max_retry: Option<u32>,
    feed_size: Option<usize>,
    connector_dirs: Option<Vec<PathBuf>>,
    workers_per_queue: Option<usize>,

    #[serde(default)]
    ubs: Option<UbsConfig>,

    /// Optional `sinks:` mapping of connector name to sink spec
    #[serde(default)]
    sinks: HashMap<String, SinkSpec>,
}

impl Config {
    pub fn is_development(&self) -> bool {
        self.environment == "development"
    }

    /// Socket address the front-end listens on.
    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        let host = if self.http_host == "localhost" {
            "127.0.0.1"
        } else {
            &self.http_host
        };
        Ok(format!("{}:{}", host, self.http_port).parse()?)
    }

    /// Per-binary timeout as a Duration, if configured.
    pub fn binary_timeout(&self) -> Option<std::time::Duration> {
        self.binary_timeout.map(std::time::Duration::from_secs)
    }

    /// SQLite path with any `sqlite://` URL prefix stripped.
    pub fn database_path(&self) -> PathBuf {
        let path = self
            .database_url
            .strip_prefix("sqlite://")
            .unwrap_or(&self.database_url);
        PathBuf::from(path)
    }

    /// The development profile: debug logging, throwaway database, no
    /// download timeout, connectors out of the working tree.
    pub fn development() -> Self {
        Self {
            environment: "development".to_string(),
            loglevel: "debug".to_string(),
            database_url: "/tmp/binsandbox.db".to_string(),
            binary_timeout: None,
            connector_dirs: vec![
                PathBuf::from("/usr/share/binsandbox/connectors"),
                PathBuf::from("./connectors"),
            ],
            ..Self::production()
        }
    }

    /// The production profile (also the fallback for unknown environments).
    pub fn production() -> Self {
        Self {
            environment: "production".to_string(),
            loglevel: "info".to_string(),
            database_url: "/usr/share/binsandbox/sandbox.db".to_string(),
            redis_url: "redis://localhost:6379/0".to_string(),
            http_host: "127.0.0.1".to_string(),
            http_port: 5000,
            binary_timeout: Some(60),
            binary_fetch_max_retry: 3,
            feed_size: 10,
            connector_dirs: vec![PathBuf::from("/usr/share/binsandbox/connectors")],
            workers_per_queue: 2,
            ubs: UbsConfig::default(),
            sinks: HashMap::new(),
        }
    }

    /// Load file config if it exists
    fn load_file_config(path: &Path) -> FileConfig {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_yaml::from_str(&contents).unwrap_or_else(|e| {
                eprintln!("Warning: Failed to parse {}: {}", path.display(), e);
                FileConfig::default()
            }),
            Err(_) => {
                // File doesn't exist, use profile defaults
                FileConfig::default()
            }
        }
    }

    /// Load configuration: env vars -> file -> profile defaults
    pub fn load(config_path: Option<&Path>) -> Self {
        // ENVIRONMENT=development skips the file and uses the dev profile
        // wholesale; env var overrides below still apply on top.
        let env_name = std::env::var("ENVIRONMENT").ok();
        let file = if env_name.as_deref() == Some("development") {
            FileConfig::default()
        } else {
            Self::load_file_config(config_path.unwrap_or(Path::new("config.yml")))
        };

        // Profile: env > file > production. Anything other than
        // "development" means production defaults.
        let environment = env_name
            .or(file.environment.clone())
            .unwrap_or_else(|| "production".to_string());
        let base = if environment == "development" {
            Self::development()
        } else {
            Self::production()
        };

        let loglevel = std::env::var("LOGLEVEL")
            .ok()
            .or(file.loglevel)
            .unwrap_or(base.loglevel);

        let database_url = std::env::var("DATABASE_URL")
            .ok()
            .or(file.database_url)
            .unwrap_or(base.database_url);

        let redis_url = std::env::var("REDIS_URL")
            .ok()
            .or(file.redis_url)
            .unwrap_or(base.redis_url);

        let http_host = std::env::var("HTTP_HOST")
            .ok()
            .or(file.http_host)
            .unwrap_or(base.http_host);

        let http_port = std::env::var("HTTP_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .or(file.http_port)
            .unwrap_or(base.http_port);

        Self {
            environment,
            loglevel,
            database_url,
            redis_url,
            http_host,
            http_port,
            binary_timeout: file.binary_timeout.or(base.binary_timeout),
            binary_fetch_max_retry: file
                .binary_fetch_max_retry
                .unwrap_or(base.binary_fetch_max_retry),
            feed_size: file.feed_size.unwrap_or(base.feed_size),
            connector_dirs: file.connector_dirs.unwrap_or(base.connector_dirs),
            workers_per_queue: file.workers_per_queue.unwrap_or(base.workers_per_queue),
            ubs: file.ubs.unwrap_or(base.ubs),
            sinks: file.sinks,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::production()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_production_defaults() {
        let config = Config::production();
        assert!(!config.is_development());
        assert_eq!(config.feed_size, 10);
        assert_eq!(config.binary_fetch_max_retry, 3);
        assert_eq!(config.binary_timeout, Some(60));
    }

    #[test]
    fn test_development_profile() {
        let config = Config::development();
        assert!(config.is_development());
        assert_eq!(config.loglevel, "debug");
        // Development disables the download timeout for slow local backends
        assert_eq!(config.binary_timeout, None);
        assert_eq!(config.binary_timeout(), None);
    }

    #[test]
    fn test_database_path_strips_url_prefix() {
        let mut config = Config::production();
        config.database_url = "sqlite:///tmp/x.db".to_string();
        assert_eq!(config.database_path(), PathBuf::from("/tmp/x.db"));

        config.database_url = "/tmp/y.db".to_string();
        assert_eq!(config.database_path(), PathBuf::from("/tmp/y.db"));
    }

    #[test]
    fn test_bind_addr_resolves_localhost() {
        let mut config = Config::production();
        config.http_host = "localhost".to_string();
        config.http_port = 5000;
        assert_eq!(
            config.bind_addr().unwrap(),
            "127.0.0.1:5000".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_file_config_parses_sinks() {
        let yaml = r#"
environment: production
feed_size: 3
sinks:
  yara:
    kind: feed
    id: "FEED_ID"
  nullscan:
    kind: watchlist
    id: "WL_ID"
"#;
        let file: FileConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(file.feed_size, Some(3));
        assert_eq!(file.sinks.len(), 2);
        assert_eq!(file.sinks["yara"].kind, SinkKind::Feed);
        assert_eq!(file.sinks["nullscan"].kind, SinkKind::Watchlist);
    }

    #[test]
    fn test_missing_file_uses_profile_defaults() {
        let file = Config::load_file_config(Path::new("/nonexistent/config.yml"));
        assert!(file.environment.is_none());
        assert!(file.sinks.is_empty());
    }
}
