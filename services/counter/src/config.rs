use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the visitor counter service
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Remote store configuration
    #[serde(default)]
    pub remote: RemoteConfig,
    /// Local store configuration
    #[serde(default)]
    pub local: LocalConfig,
    /// Identity anonymization configuration
    #[serde(default)]
    pub identity: IdentityConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    /// Start the Prometheus exporter
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

/// Remote store connection. Both fields must be set to select it.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    /// REST endpoint URL
    pub url: Option<String>,
    /// Bearer access token
    pub token: Option<String>,
    /// Per-call timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

/// Local store configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LocalConfig {
    /// Directory holding `counts.json`
    pub data_dir: Option<PathBuf>,
    /// Keep counts in memory only
    #[serde(default)]
    pub in_memory: bool,
}

/// Identity anonymization configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IdentityConfig {
    /// HMAC secret; absent or empty stores raw user ids
    pub secret: Option<String>,
}

/// HTTP API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins (empty = any)
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Token required by admin routes; absent disables them
    pub admin_token: Option<String>,
}

// Default value functions
fn default_service_name() -> String {
    "visitor-counter".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    3000
}

/// Environment variables of earlier deployments, mapped onto config keys
const LEGACY_ENV: &[(&str, &str)] = &[
    ("UPSTASH_REDIS_REST_URL", "remote.url"),
    ("UPSTASH_REDIS_REST_TOKEN", "remote.token"),
    ("VISITOR_HMAC_SECRET", "identity.secret"),
    ("ADMIN_TOKEN", "api.admin_token"),
];

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let mut builder = config::Config::builder()
            // Add config file if present
            .add_source(config::File::with_name("config/counter").required(false))
            .add_source(config::File::with_name("/etc/visitor-counter/counter").required(false))
            // Override with environment variables
            // COUNTER__REMOTE__URL -> remote.url
            .add_source(
                config::Environment::with_prefix("COUNTER")
                    .separator("__")
                    .try_parsing(true),
            );

        for (var, key) in LEGACY_ENV {
            builder = builder.set_override_option(*key, std::env::var(var).ok())?;
        }

        Self::from_builder(builder)
    }

    /// Deserialize from a prepared builder
    pub fn from_builder(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> anyhow::Result<Self> {
        let config = builder.build()?;
        config.try_deserialize().map_err(Into::into)
    }

    /// Remote credentials when both URL and token are non-empty
    pub fn remote_credentials(&self) -> Option<(&str, &str)> {
        let url = self.remote.url.as_deref().filter(|u| !u.is_empty())?;
        let token = self.remote.token.as_deref().filter(|t| !t.is_empty())?;
        Some((url, token))
    }

    /// Per-call backend timeout as Duration
    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.remote.timeout_ms)
    }

    /// Directory for the local store
    pub fn data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.local.data_dir {
            return dir.clone();
        }
        if is_serverless() {
            // Only /tmp is writable there
            PathBuf::from("/tmp/visitor-count-data")
        } else {
            PathBuf::from("data")
        }
    }
}

fn is_serverless() -> bool {
    std::env::var_os("VERCEL").is_some() || std::env::var_os("AWS_LAMBDA_FUNCTION_NAME").is_some()
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
            metrics_enabled: default_true(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: None,
            token: None,
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: default_true(),
            cors_origins: Vec::new(),
            admin_token: None,
        }
    }
}
