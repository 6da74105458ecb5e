use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use uuid::Uuid;
use validator::{Validate, ValidationError, ValidationErrors};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_RESERVATION_WINDOW_SECS: u64 = 15 * 60;
const DEFAULT_REAPER_INTERVAL_SECS: u64 = 60;
const DEFAULT_REAPER_BATCH_SIZE: u64 = 100;
const DEFAULT_QUEUE_INTERVAL_SECS: u64 = 5;
const DEFAULT_QUEUE_BATCH_SIZE: u64 = 50;
const DEFAULT_MIN_WITHDRAWAL_AMOUNT: i64 = 100_000;
const DEFAULT_WITHDRAWAL_REVIEW_DAYS: u64 = 7;
const DEV_PAYMENT_HASH_SECRET: &str = "keymart-development-hash-secret";

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB timeouts (seconds)
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// How long claimed units and wallet holds stay reserved awaiting payment.
    /// Both expire together.
    #[serde(default = "default_reservation_window_secs")]
    #[validate(range(min = 1))]
    pub reservation_window_secs: u64,

    /// Expiry reaper sweep interval
    #[serde(default = "default_reaper_interval_secs")]
    #[validate(range(min = 1))]
    pub reaper_interval_secs: u64,

    /// Max orders aborted per reaper sweep
    #[serde(default = "default_reaper_batch_size")]
    #[validate(range(min = 1))]
    pub reaper_batch_size: u64,

    /// Payment queue polling interval
    #[serde(default = "default_queue_interval_secs")]
    #[validate(range(min = 1))]
    pub payment_queue_interval_secs: u64,

    #[serde(default = "default_queue_batch_size")]
    #[validate(range(min = 1))]
    pub payment_queue_batch_size: u64,

    /// Shared secret for verifying payment provider callbacks
    #[serde(default = "default_payment_hash_secret")]
    #[validate(length(min = 16))]
    pub payment_hash_secret: String,

    /// Platform commission in percent, used when no product specific rate exists
    #[serde(default = "default_commission_rate")]
    #[validate(custom = "validate_commission_rate")]
    pub default_commission_rate: Decimal,

    /// Wallet owner credited with commission on settlement
    #[serde(default = "default_platform_user_id")]
    pub platform_user_id: Uuid,

    /// Whether refunded units go back on sale
    #[serde(default)]
    pub allow_resale_after_refund: bool,

    /// Smallest amount a seller may ask to withdraw
    #[serde(default = "default_min_withdrawal_amount")]
    #[validate(custom = "validate_min_withdrawal_amount")]
    pub min_withdrawal_amount: Decimal,

    /// Days an operator has to review a withdrawal before its hold lapses
    #[serde(default = "default_withdrawal_review_days")]
    #[validate(range(min = 1))]
    pub withdrawal_review_days: u64,

    /// Event channel capacity for async event processing
    #[serde(default = "default_event_channel_capacity")]
    #[validate(custom = "validate_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

impl AppConfig {
    /// Creates a new configuration with defaults for every tunable
    pub fn new(database_url: String, host: String, port: u16, environment: String) -> Self {
        Self {
            database_url,
            host,
            port,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            reservation_window_secs: default_reservation_window_secs(),
            reaper_interval_secs: default_reaper_interval_secs(),
            reaper_batch_size: default_reaper_batch_size(),
            payment_queue_interval_secs: default_queue_interval_secs(),
            payment_queue_batch_size: default_queue_batch_size(),
            payment_hash_secret: default_payment_hash_secret(),
            default_commission_rate: default_commission_rate(),
            platform_user_id: default_platform_user_id(),
            allow_resale_after_refund: false,
            min_withdrawal_amount: default_min_withdrawal_amount(),
            withdrawal_review_days: default_withdrawal_review_days(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }

    /// Gets database URL reference
    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
            || self.environment.eq_ignore_ascii_case("test")
    }

    /// Gets log level reference
    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn reservation_window(&self) -> Duration {
        Duration::from_secs(self.reservation_window_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    pub fn payment_queue_interval(&self) -> Duration {
        Duration::from_secs(self.payment_queue_interval_secs)
    }

    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if !self.is_development() && self.payment_hash_secret == DEV_PAYMENT_HASH_SECRET {
            let mut err = ValidationError::new("payment_hash_secret_default_dev");
            err.message = Some(
                "The bundled development hash secret must not be used outside development. Set APP__PAYMENT_HASH_SECRET."
                    .into(),
            );
            errors.add("payment_hash_secret", err);
        }

        if self.db_min_connections > self.db_max_connections {
            let mut err = ValidationError::new("db_min_connections");
            err.message = Some("db_min_connections must not exceed db_max_connections".into());
            errors.add("db_min_connections", err);
        }

        if errors.errors().is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

/// Default value functions
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_db_max_connections() -> u32 {
    10
}
fn default_db_min_connections() -> u32 {
    1
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_idle_timeout_secs() -> u64 {
    600
}
fn default_db_acquire_timeout_secs() -> u64 {
    8
}

fn default_reservation_window_secs() -> u64 {
    DEFAULT_RESERVATION_WINDOW_SECS
}

fn default_reaper_interval_secs() -> u64 {
    DEFAULT_REAPER_INTERVAL_SECS
}

fn default_reaper_batch_size() -> u64 {
    DEFAULT_REAPER_BATCH_SIZE
}

fn default_queue_interval_secs() -> u64 {
    DEFAULT_QUEUE_INTERVAL_SECS
}

fn default_queue_batch_size() -> u64 {
    DEFAULT_QUEUE_BATCH_SIZE
}

fn default_payment_hash_secret() -> String {
    DEV_PAYMENT_HASH_SECRET.to_string()
}

fn default_commission_rate() -> Decimal {
    Decimal::from(5)
}

fn default_platform_user_id() -> Uuid {
    Uuid::nil()
}

fn default_min_withdrawal_amount() -> Decimal {
    Decimal::from(DEFAULT_MIN_WITHDRAWAL_AMOUNT)
}

fn default_withdrawal_review_days() -> u64 {
    DEFAULT_WITHDRAWAL_REVIEW_DAYS
}

fn default_event_channel_capacity() -> usize {
    1024
}

fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    match level.to_ascii_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => {
            let mut err = ValidationError::new("log_level");
            err.message = Some("log_level must be one of trace, debug, info, warn, error".into());
            Err(err)
        }
    }
}

fn validate_commission_rate(rate: &Decimal) -> Result<(), ValidationError> {
    if rate.is_sign_negative() || *rate > Decimal::from(100) {
        let mut err = ValidationError::new("default_commission_rate");
        err.message = Some("default_commission_rate must be a percentage between 0 and 100".into());
        return Err(err);
    }
    Ok(())
}

fn validate_min_withdrawal_amount(amount: &Decimal) -> Result<(), ValidationError> {
    if *amount <= Decimal::ZERO {
        let mut err = ValidationError::new("min_withdrawal_amount");
        err.message = Some("min_withdrawal_amount must be positive".into());
        return Err(err);
    }
    Ok(())
}

fn validate_event_channel_capacity(capacity: usize) -> Result<(), ValidationError> {
    if capacity == 0 {
        let mut err = ValidationError::new("event_channel_capacity");
        err.message = Some("event_channel_capacity must be greater than 0".into());
        return Err(err);
    }
    Ok(())
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("keymart_settlement={},tower_http=debug", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .json()
            .try_init();
    } else {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .try_init();
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
    load_config_from(Path::new(CONFIG_DIR))
}

pub fn load_config_from(config_dir: &Path) -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !config_dir.exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            config_dir.display()
        );
    }

    let dir = config_dir.display();
    let config = Config::builder()
        .set_default("database_url", "sqlite://keymart.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", DEFAULT_PORT as i64)?
        .set_default("environment", run_env.clone())?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{}/default", dir)).required(false))
        .add_source(File::with_name(&format!("{}/{}", dir, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration security validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}
