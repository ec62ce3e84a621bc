use crate::cache::CacheBackendKind;
use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError, ValidationErrors};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_CART_TTL_SECS: u64 = 7 * 24 * 3600;
const DEFAULT_CART_VIEW_TTL_SECS: u64 = 300;
const DEFAULT_PENDING_TTL_SECS: u64 = 2 * 3600;
const DEFAULT_COMPLETED_TTL_SECS: u64 = 24 * 3600;

/// Cache configuration
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct CacheConfig {
    /// Which backend to use: "redis" or "in-memory"
    #[serde(default = "default_cache_backend")]
    pub backend: CacheBackendKind,

    /// Attempts per cache operation, including the first
    #[serde(default = "default_retry_attempts")]
    #[validate(range(min = 1, max = 10))]
    pub retry_attempts: u32,

    /// Fixed delay between attempts
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Lifetime of a user's cart keys
    #[serde(default = "default_cart_ttl_secs")]
    #[validate(range(min = 1))]
    pub cart_ttl_secs: u64,

    /// Lifetime of the computed cart summary
    #[serde(default = "default_cart_view_ttl_secs")]
    #[validate(range(min = 1))]
    pub cart_view_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: default_cache_backend(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            cart_ttl_secs: DEFAULT_CART_TTL_SECS,
            cart_view_ttl_secs: DEFAULT_CART_VIEW_TTL_SECS,
        }
    }
}

impl CacheConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn cart_ttl(&self) -> Duration {
        Duration::from_secs(self.cart_ttl_secs)
    }

    pub fn cart_view_ttl(&self) -> Duration {
        Duration::from_secs(self.cart_view_ttl_secs)
    }
}

/// PayPal, currency conversion and order lifetime settings
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct PaymentConfig {
    #[serde(default = "default_paypal_base_url")]
    #[validate(url)]
    pub paypal_base_url: String,

    #[serde(default)]
    pub paypal_client_id: Option<String>,

    #[serde(default)]
    pub paypal_client_secret: Option<String>,

    /// When set, webhook deliveries are verified against this id
    #[serde(default)]
    pub paypal_webhook_id: Option<String>,

    /// Merchant account receiving funds
    #[serde(default)]
    pub payee_email: Option<String>,

    /// Currency course prices are stored in
    #[serde(default = "default_local_currency")]
    #[validate(length(equal = 3))]
    pub local_currency: String,

    /// Currency orders are created in at the gateway
    #[serde(default = "default_settlement_currency")]
    #[validate(length(equal = 3))]
    pub settlement_currency: String,

    #[serde(default = "default_fx_api_url")]
    #[validate(url)]
    pub fx_api_url: String,

    /// Rate applied when the FX API cannot be reached
    #[serde(default = "default_fx_fallback_rate")]
    #[validate(custom = "validate_positive_rate")]
    pub fx_fallback_rate: Decimal,

    #[serde(default = "default_pending_ttl_secs")]
    #[validate(range(min = 1))]
    pub pending_ttl_secs: u64,

    #[serde(default = "default_completed_ttl_secs")]
    #[validate(range(min = 1))]
    pub completed_ttl_secs: u64,

    /// Lifetime of the durable snapshot used for recovery
    #[serde(default = "default_completed_ttl_secs")]
    #[validate(range(min = 1))]
    pub snapshot_ttl_secs: u64,

    #[serde(default = "default_http_timeout_secs")]
    #[validate(range(min = 1, max = 120))]
    pub http_timeout_secs: u64,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            paypal_base_url: default_paypal_base_url(),
            paypal_client_id: None,
            paypal_client_secret: None,
            paypal_webhook_id: None,
            payee_email: None,
            local_currency: default_local_currency(),
            settlement_currency: default_settlement_currency(),
            fx_api_url: default_fx_api_url(),
            fx_fallback_rate: default_fx_fallback_rate(),
            pending_ttl_secs: DEFAULT_PENDING_TTL_SECS,
            completed_ttl_secs: DEFAULT_COMPLETED_TTL_SECS,
            snapshot_ttl_secs: DEFAULT_COMPLETED_TTL_SECS,
            http_timeout_secs: default_http_timeout_secs(),
        }
    }
}

impl PaymentConfig {
    pub fn pending_ttl(&self) -> Duration {
        Duration::from_secs(self.pending_ttl_secs)
    }

    pub fn completed_ttl(&self) -> Duration {
        Duration::from_secs(self.completed_ttl_secs)
    }

    pub fn snapshot_ttl(&self) -> Duration {
        Duration::from_secs(self.snapshot_ttl_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

/// Application configuration
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct AppConfig {
    /// Database connection URL
    #[validate(length(min = 1))]
    pub database_url: String,

    /// Redis connection URL
    #[validate(length(min = 1))]
    pub redis_url: String,

    /// Server host address
    #[validate(length(min = 1))]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    #[validate(range(min = 1, max = 65535))]
    pub port: u16,

    /// Environment (development, staging, production)
    #[validate(length(min = 1))]
    pub environment: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Emit logs as JSON
    #[serde(default)]
    pub log_json: bool,

    /// Run migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    #[serde(default = "default_event_channel_capacity")]
    #[validate(range(min = 1))]
    pub event_channel_capacity: usize,

    /// Permissive CORS outside development
    #[serde(default)]
    pub cors_allow_any_origin: bool,

    #[serde(default)]
    #[validate]
    pub cache: CacheConfig,

    #[serde(default)]
    #[validate]
    pub payment: PaymentConfig,
}

impl AppConfig {
    /// Creates a configuration with defaults for everything but the connection strings
    pub fn new(database_url: String, redis_url: String, environment: String) -> Self {
        Self {
            database_url,
            redis_url,
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            event_channel_capacity: default_event_channel_capacity(),
            cors_allow_any_origin: false,
            cache: CacheConfig::default(),
            payment: PaymentConfig::default(),
        }
    }

    /// Checks if running in development environment
    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    /// Whether we should fall back to permissive CORS
    pub fn should_allow_permissive_cors(&self) -> bool {
        self.is_development() || self.cors_allow_any_origin
    }

    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        let has_id = self.payment.paypal_client_id.is_some();
        let has_secret = self.payment.paypal_client_secret.is_some();
        if has_id != has_secret {
            let mut err = ValidationError::new("paypal_credentials_incomplete");
            err.message = Some(
                "Set both APP__PAYMENT__PAYPAL_CLIENT_ID and APP__PAYMENT__PAYPAL_CLIENT_SECRET, or neither"
                    .into(),
            );
            errors.add("payment", err);
        }

        if errors.errors().is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_event_channel_capacity() -> usize {
    1024
}

fn default_cache_backend() -> CacheBackendKind {
    CacheBackendKind::Redis
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_cart_ttl_secs() -> u64 {
    DEFAULT_CART_TTL_SECS
}

fn default_cart_view_ttl_secs() -> u64 {
    DEFAULT_CART_VIEW_TTL_SECS
}

fn default_paypal_base_url() -> String {
    "https://api-m.sandbox.paypal.com".to_string()
}

fn default_local_currency() -> String {
    "VND".to_string()
}

fn default_settlement_currency() -> String {
    "USD".to_string()
}

fn default_fx_api_url() -> String {
    "https://api.exchangerate.host/convert".to_string()
}

fn default_fx_fallback_rate() -> Decimal {
    // roughly 1 USD = 25,000 VND
    Decimal::new(4, 5)
}

fn default_pending_ttl_secs() -> u64 {
    DEFAULT_PENDING_TTL_SECS
}

fn default_completed_ttl_secs() -> u64 {
    DEFAULT_COMPLETED_TTL_SECS
}

fn default_http_timeout_secs() -> u64 {
    30
}

/// Validates log level values
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

fn validate_positive_rate(rate: &Decimal) -> Result<(), ValidationError> {
    if rate.is_sign_positive() && !rate.is_zero() {
        Ok(())
    } else {
        let mut err = ValidationError::new("fx_fallback_rate");
        err.message = Some("fx_fallback_rate must be greater than 0".into());
        Err(err)
    }
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::fmt;

    let default_directive = format!("course_market={},tower_http=debug", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt().with_env_filter(filter_directive).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter_directive).try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    let config = Config::builder()
        .set_default("database_url", "sqlite://course_market.db?mode=rwc")?
        .set_default("redis_url", "redis://localhost:6379")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", DEFAULT_PORT as i64)?
        .set_default("environment", run_env.as_str())?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}
