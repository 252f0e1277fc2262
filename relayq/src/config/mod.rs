//! Configuration management.
//!
//! Configuration is loaded from multiple sources with clear precedence:
//!
//! 1. Well-known environment variables (`REDIS_HOST`, `MASTER_API_KEY`, …)
//! 2. `RELAYQ_`-prefixed environment variables (`__` separates sections,
//!    e.g. `RELAYQ_REDIS__HOST=cache.internal`)
//! 3. `./config.toml`
//! 4. Hardcoded defaults
//!
//! # Example configuration
//!
//! ```toml
//! # config.toml
//! [service]
//! port = 3000
//!
//! [redis]
//! host = "127.0.0.1"
//! port = 6379
//!
//! [auth]
//! enabled = true
//!
//! [rate_limit]
//! window_ms = 60000
//! max_requests = 120
//! ```

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

/// HTTP service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    /// Port the control plane listens on.
    pub port: u16,

    /// Reserved for a metrics listener; parsed for compatibility, unused.
    pub metrics_port: u16,

    /// Bounded grace period for draining in-flight deliveries on shutdown.
    pub shutdown_grace_secs: u64,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            port: 3000,
            metrics_port: 9090,
            shutdown_grace_secs: 15,
        }
    }
}

/// Backing-store connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisSettings {
    /// Redis host.
    pub host: String,

    /// Redis port. Port 6380 implies a managed TLS endpoint.
    pub port: u16,

    /// Optional password.
    pub password: Option<String>,

    /// Logical database index.
    pub db: u8,

    /// Force TLS regardless of port.
    pub tls: bool,

    /// Relax certificate validation on TLS connections (operator choice
    /// for managed instances with private CAs).
    pub insecure_tls: bool,

    /// Connection pool size.
    pub pool_size: usize,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            password: None,
            db: 0,
            tls: false,
            insecure_tls: false,
            pool_size: 16,
        }
    }
}

impl RedisSettings {
    /// Whether the configured endpoint negotiates TLS.
    #[must_use]
    pub const fn uses_tls(&self) -> bool {
        self.tls || self.port == 6380
    }

    /// Build the connection URL for the redis client.
    #[must_use]
    pub fn url(&self) -> String {
        let scheme = if self.uses_tls() { "rediss" } else { "redis" };
        let auth = self
            .password
            .as_ref()
            .map(|p| format!(":{p}@"))
            .unwrap_or_default();
        let insecure = if self.uses_tls() && self.insecure_tls {
            "#insecure"
        } else {
            ""
        };
        format!(
            "{scheme}://{auth}{}:{}/{}{insecure}",
            self.host, self.port, self.db
        )
    }
}

/// Authentication settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    /// When false, every request authenticates as the `default` application.
    pub enabled: bool,

    /// Master api key granting global admin capability. Master auth is
    /// disabled while unset.
    pub master_api_key: Option<String>,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            master_api_key: None,
        }
    }
}

/// Rate limiting settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    /// Enable the rate limiting middleware.
    pub enabled: bool,

    /// Window length in milliseconds.
    pub window_ms: u64,

    /// Maximum requests per key per window.
    pub max_requests: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            window_ms: 60_000,
            max_requests: 120,
        }
    }
}

/// Job retention settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionSettings {
    /// Seconds a completed job is kept before the store purges it.
    pub completed_secs: u64,

    /// Seconds a failed job is kept before the store purges it.
    pub failed_secs: u64,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            completed_secs: 3_600,
            failed_secs: 86_400,
        }
    }
}

/// Outbound delivery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliverySettings {
    /// Timeout for per-job webhook requests, seconds.
    pub job_webhook_timeout_secs: u64,

    /// Timeout for application webhook requests, seconds.
    pub app_webhook_timeout_secs: u64,

    /// Timeout for subscription deliveries, seconds.
    pub subscription_timeout_secs: u64,

    /// Backoff ceiling for webhook retries, seconds.
    pub max_backoff_secs: u64,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            job_webhook_timeout_secs: 5,
            app_webhook_timeout_secs: 30,
            subscription_timeout_secs: 30,
            max_backoff_secs: 60,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Emit JSON log lines instead of the human-readable format.
    pub json: bool,

    /// Default tracing filter when `RUST_LOG` is unset.
    pub filter: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            json: false,
            filter: "relayq=info,tower_http=info".to_string(),
        }
    }
}

/// Complete service configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP service settings.
    pub service: ServiceSettings,
    /// Backing-store settings.
    pub redis: RedisSettings,
    /// Authentication settings.
    pub auth: AuthSettings,
    /// Rate limiting settings.
    pub rate_limit: RateLimitSettings,
    /// Retention settings.
    pub retention: RetentionSettings,
    /// Outbound delivery settings.
    pub delivery: DeliverySettings,
    /// Logging settings.
    pub logging: LoggingSettings,
}

impl Config {
    /// Load configuration from `config.toml`, `RELAYQ_*` variables and the
    /// well-known environment variable names.
    ///
    /// # Errors
    ///
    /// Returns an error when a configuration source fails to parse.
    pub fn load() -> anyhow::Result<Self> {
        let mut config: Self = Figment::new()
            .merge(Toml::file("config.toml"))
            .merge(Env::prefixed("RELAYQ_").split("__").lowercase(true))
            .extract()?;

        config.apply_env_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Apply the documented standalone environment variable names.
    ///
    /// Kept separate from the figment pipeline so the mapping is explicit
    /// and testable without mutating process state.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("REDIS_HOST") {
            self.redis.host = host;
        }
        if let Some(port) = lookup("REDIS_PORT").and_then(|v| v.parse().ok()) {
            self.redis.port = port;
        }
        if let Some(password) = lookup("REDIS_PASSWORD") {
            self.redis.password = Some(password);
        }
        if let Some(db) = lookup("REDIS_DB").and_then(|v| v.parse().ok()) {
            self.redis.db = db;
        }
        if let Some(key) = lookup("MASTER_API_KEY") {
            self.auth.master_api_key = Some(key);
        }
        if let Some(enabled) = lookup("ENABLE_API_KEY_AUTH") {
            self.auth.enabled = !matches!(
                enabled.trim().to_ascii_lowercase().as_str(),
                "false" | "0" | "no" | "off"
            );
        }
        if let Some(port) = lookup("PORT").and_then(|v| v.parse().ok()) {
            self.service.port = port;
        }
        if let Some(port) = lookup("METRICS_PORT").and_then(|v| v.parse().ok()) {
            self.service.metrics_port = port;
        }
        if let Some(window) = lookup("RATE_LIMIT_WINDOW_MS").and_then(|v| v.parse().ok()) {
            self.rate_limit.window_ms = window;
        }
        if let Some(max) = lookup("RATE_LIMIT_MAX_REQUESTS").and_then(|v| v.parse().ok()) {
            self.rate_limit.max_requests = max;
        }
        if let Some(secs) = lookup("COMPLETED_JOB_RETENTION_SECONDS").and_then(|v| v.parse().ok())
        {
            self.retention.completed_secs = secs;
        }
        if let Some(secs) = lookup("FAILED_JOB_RETENTION_SECONDS").and_then(|v| v.parse().ok()) {
            self.retention.failed_secs = secs;
        }
    }
}
