//! Configuration for Outreach

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix for environment variable overrides, e.g. `OUTREACH__DISPATCHER__BATCH_SIZE=100`
pub const ENV_PREFIX: &str = "OUTREACH";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Dispatcher tunables
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// Messaging gateway configuration
    #[serde(default)]
    pub gateway: GatewayConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database backend: "postgres" or "memory"
    #[serde(default = "default_db_backend")]
    pub backend: String,

    /// Database URL (for postgres)
    pub url: Option<String>,

    /// Maximum connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Apply embedded migrations on startup
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: default_db_backend(),
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            run_migrations: default_run_migrations(),
        }
    }
}

fn default_db_backend() -> String {
    "postgres".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_run_migrations() -> bool {
    true
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// API port
    #[serde(default = "default_api_port")]
    pub port: u16,

    /// Enable Swagger UI
    #[serde(default = "default_enable_swagger")]
    pub enable_swagger: bool,

    /// Bearer token required by the dispatch trigger; unset leaves it open
    pub trigger_token: Option<String>,

    /// CORS allowed origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: default_api_port(),
            enable_swagger: default_enable_swagger(),
            trigger_token: None,
            cors_origins: Vec::new(),
        }
    }
}

fn default_api_port() -> u16 {
    8080
}

fn default_enable_swagger() -> bool {
    true
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

/// Dispatcher configuration
///
/// These values exist to keep the gateway under its throughput ceiling;
/// none of them change what gets sent, only how fast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Run the periodic dispatch worker inside the server process
    #[serde(default = "default_dispatcher_enabled")]
    pub enabled: bool,

    /// Seconds between worker invocations
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// New recipients processed per campaign per invocation
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Retries sent per sub-batch
    #[serde(default = "default_retry_batch_size")]
    pub retry_batch_size: usize,

    /// Minimum spacing between two gateway sends, in milliseconds
    #[serde(default = "default_send_interval_ms")]
    pub send_interval_ms: u64,

    /// Age an active campaign must reach before its first send
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,

    /// Processing guards older than this are treated as abandoned
    #[serde(default = "default_guard_lease_secs")]
    pub guard_lease_secs: u64,

    /// Upper bound for a single gateway call
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            enabled: default_dispatcher_enabled(),
            interval_secs: default_interval_secs(),
            batch_size: default_batch_size(),
            retry_batch_size: default_retry_batch_size(),
            send_interval_ms: default_send_interval_ms(),
            grace_period_secs: default_grace_period_secs(),
            guard_lease_secs: default_guard_lease_secs(),
            send_timeout_secs: default_send_timeout_secs(),
        }
    }
}

impl DispatcherConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn send_interval(&self) -> Duration {
        Duration::from_millis(self.send_interval_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }
}

fn default_dispatcher_enabled() -> bool {
    true
}

fn default_interval_secs() -> u64 {
    60
}

fn default_batch_size() -> usize {
    50
}

fn default_retry_batch_size() -> usize {
    10
}

fn default_send_interval_ms() -> u64 {
    1000
}

fn default_grace_period_secs() -> u64 {
    120
}

fn default_guard_lease_secs() -> u64 {
    900
}

fn default_send_timeout_secs() -> u64 {
    30
}

/// Messaging gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Base URL of the gateway API
    #[serde(default = "default_gateway_url")]
    pub base_url: String,

    /// API version path segment
    #[serde(default = "default_gateway_api_version")]
    pub api_version: String,

    /// Access token sent as a bearer credential
    pub access_token: Option<String>,

    /// HTTP request timeout in seconds
    #[serde(default = "default_gateway_timeout")]
    pub timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: default_gateway_url(),
            api_version: default_gateway_api_version(),
            access_token: None,
            timeout_secs: default_gateway_timeout(),
        }
    }
}

fn default_gateway_url() -> String {
    "https://graph.facebook.com".to_string()
}

fn default_gateway_api_version() -> String {
    "v19.0".to_string()
}

fn default_gateway_timeout() -> u64 {
    20
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> crate::Result<Self> {
        toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load configuration from the first config file found, then apply
    /// `OUTREACH__SECTION__KEY` environment overrides on top.
    pub fn load() -> crate::Result<Self> {
        let paths = [
            PathBuf::from("./config.toml"),
            PathBuf::from("/etc/outreach/config.toml"),
        ];

        let mut builder = config::Config::builder();

        if let Some(path) = paths.iter().find(|p| p.exists()) {
            tracing::debug!("Loading configuration from {}", path.display());
            builder = builder.add_source(
                config::File::from(path.as_path()).format(config::FileFormat::Toml),
            );
        }

        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize::<Config>())
            .map_err(|e| crate::Error::Config(format!("Failed to load config: {}", e)))
    }
}
