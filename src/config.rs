//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::{net::IpAddr, path::PathBuf};

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub federation: FederationConfig,
    pub limits: LimitsConfig,
    pub cache: CacheConfig,
    pub delivery: DeliveryConfig,
    pub storage: StorageConfig,
    pub account: AccountConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain (e.g., "social.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://social.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }

    /// Canonical actor URL for a local account.
    pub fn actor_url(&self, nickname: &str) -> String {
        format!("{}/users/{}", self.base_url(), nickname)
    }

    /// Key id advertised in local actor documents.
    pub fn key_id(&self, nickname: &str) -> String {
        format!("{}#main-key", self.actor_url(nickname))
    }
}

/// Federation policy configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Domains to federate with. Empty or containing "*" federates with all.
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    /// Require signatures on inbound GET requests as well as POST deliveries.
    #[serde(default)]
    pub secure_mode: bool,
    /// Maximum accepted inbound activity body size in bytes.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_max_body_bytes() -> usize {
    5000
}

/// Rate limiting and inbound throttle configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Daily received-post ceiling per remote domain.
    #[serde(default = "default_daily_ceiling")]
    pub received_per_domain_daily: u32,
    /// Daily received-post ceiling per remote account.
    #[serde(default = "default_daily_ceiling")]
    pub received_per_account_daily: u32,
    /// Inbound request throttle (one in-flight per method, minimum spacing).
    #[serde(default)]
    pub inbound_throttle: ThrottleConfig,
}

fn default_daily_ceiling() -> u32 {
    8640
}

/// Inbound request throttle configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ThrottleConfig {
    /// Enable the throttle on federation routes.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Minimum spacing between accepted requests of the same method.
    #[serde(default = "default_min_interval_secs")]
    pub min_interval_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_min_interval_secs() -> u64 {
    10
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_interval_secs: default_min_interval_secs(),
        }
    }
}

/// Cache configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Actor cache entry lifetime in seconds (default: 2 days).
    #[serde(default = "default_actor_ttl_secs")]
    pub actor_ttl_secs: u64,
    /// Negative webfinger cache lifetime in seconds.
    #[serde(default = "default_webfinger_negative_ttl_secs")]
    pub webfinger_negative_ttl_secs: u64,
    /// Timeout for avatar existence probes in seconds.
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    /// Interval between expiry sweeps in seconds.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_actor_ttl_secs() -> u64 {
    2 * 24 * 3600
}

fn default_webfinger_negative_ttl_secs() -> u64 {
    300
}

fn default_probe_timeout_secs() -> u64 {
    2
}

fn default_sweep_interval_secs() -> u64 {
    3600
}

/// Outbound delivery configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Maximum concurrent outbound deliveries.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Maximum delivery attempts per destination.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base retry backoff in seconds (doubles per attempt).
    #[serde(default = "default_base_backoff_secs")]
    pub base_backoff_secs: u64,
    /// Give up on a destination after this many seconds of retrying.
    #[serde(default = "default_retry_window_secs")]
    pub retry_window_secs: u64,
    /// Per-request timeout for outbound HTTP in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_max_concurrent() -> usize {
    10
}

fn default_max_attempts() -> u32 {
    8
}

fn default_base_backoff_secs() -> u64 {
    30
}

fn default_retry_window_secs() -> u64 {
    1800
}

fn default_request_timeout_secs() -> u64 {
    30
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root directory for the object store.
    pub base_dir: PathBuf,
}

/// Primary local account configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    /// Account nickname (default: "admin")
    #[serde(default = "default_account_nickname")]
    pub nickname: String,
    /// Display name shown in the actor document
    #[serde(default = "default_account_display_name")]
    pub display_name: String,
    /// Require manual approval of incoming follow requests
    #[serde(default)]
    pub manual_approval: bool,
}

fn default_account_nickname() -> String {
    "admin".to_string()
}

fn default_account_display_name() -> String {
    "Admin".to_string()
}

/// Admin API configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AdminConfig {
    /// Bearer token for the admin router. Admin routes are disabled when unset.
    pub token: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (DRIFTWOOD_*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            // Start with default values
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.protocol", "http")?
            .set_default("federation.secure_mode", false)?
            .set_default("federation.max_body_bytes", 5000)?
            .set_default("limits.received_per_domain_daily", 8640)?
            .set_default("limits.received_per_account_daily", 8640)?
            .set_default("limits.inbound_throttle.enabled", true)?
            .set_default("limits.inbound_throttle.min_interval_secs", 10)?
            .set_default("cache.actor_ttl_secs", 172_800)?
            .set_default("cache.webfinger_negative_ttl_secs", 300)?
            .set_default("cache.probe_timeout_secs", 2)?
            .set_default("cache.sweep_interval_secs", 3600)?
            .set_default("delivery.max_concurrent", 10)?
            .set_default("delivery.max_attempts", 8)?
            .set_default("delivery.base_backoff_secs", 30)?
            .set_default("delivery.retry_window_secs", 1800)?
            .set_default("delivery.request_timeout_secs", 30)?
            .set_default("storage.base_dir", "data")?
            .set_default("account.nickname", "admin")?
            .set_default("account.display_name", "Admin")?
            .set_default("account.manual_approval", false)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            // Load from config/default.toml if it exists
            .add_source(File::with_name("config/default").required(false))
            // Load from config/local.toml if it exists (overrides default)
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables (DRIFTWOOD_*)
            .add_source(
                Environment::with_prefix("DRIFTWOOD")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    fn validate(&self) -> Result<(), crate::error::AppError> {
        if !self.server.protocol.eq_ignore_ascii_case("http")
            && !self.server.protocol.eq_ignore_ascii_case("https")
        {
            return Err(crate::error::AppError::Config(format!(
                "server.protocol must be http or https, got {}",
                self.server.protocol
            )));
        }

        if !self.server.protocol.eq_ignore_ascii_case("https")
            && !is_local_server_domain(&self.server.domain)
        {
            return Err(crate::error::AppError::Config(
                "server.protocol must be https for non-local server domains".to_string(),
            ));
        }

        if self.federation.max_body_bytes == 0 {
            return Err(crate::error::AppError::Config(
                "federation.max_body_bytes must be greater than 0".to_string(),
            ));
        }

        if self.delivery.max_concurrent == 0 {
            return Err(crate::error::AppError::Config(
                "delivery.max_concurrent must be greater than 0".to_string(),
            ));
        }

        if self.cache.actor_ttl_secs == 0 {
            return Err(crate::error::AppError::Config(
                "cache.actor_ttl_secs must be greater than 0".to_string(),
            ));
        }

        if self.account.nickname.trim().is_empty() {
            return Err(crate::error::AppError::Config(
                "account.nickname must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}

fn normalized_server_host(domain: &str) -> String {
    let trimmed = domain.trim();
    let parsed_host = url::Url::parse(&format!("http://{trimmed}"))
        .ok()
        .and_then(|url| url.host_str().map(|host| host.to_string()));
    let host = parsed_host.unwrap_or_else(|| trimmed.to_string());
    host.trim_end_matches('.').to_ascii_lowercase()
}

fn is_local_server_domain(domain: &str) -> bool {
    let host = normalized_server_host(domain);
    if host == "localhost" || host.ends_with(".localhost") {
        return true;
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback() || ip.is_unspecified();
    }

    false
}
