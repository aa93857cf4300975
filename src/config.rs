use chrono::{FixedOffset, NaiveTime};
use config::{Config, ConfigError, Environment, File};
use rust_decimal::prelude::FromPrimitive;
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
const CONFIG_DIR: &str = "config";
const DEFAULT_DATABASE_URL: &str = "sqlite://order_ledger.db?mode=rwc";
const DEFAULT_BUSINESS_UTC_OFFSET_HOURS: i32 = 7;
const DEFAULT_RUN_AT: &str = "00:05";

/// How a sale is compensated when an applied order is edited or deleted.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReversalPolicy {
    /// Post the reversal against the original business date (open books).
    #[default]
    RestoreOriginalDay,
    /// Once the original day has rolled over, return the goods as incoming
    /// stock dated today and leave the historical snapshot untouched.
    ReturnAsIncomingWhenClosed,
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct AppConfig {
    /// Database connection URL
    #[validate(length(min = 1))]
    pub database_url: String,

    /// Application environment
    #[validate(length(min = 1))]
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
    #[validate(range(min = 1))]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB pool: connect timeout (seconds)
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,

    /// DB pool: idle timeout (seconds)
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,

    /// DB pool: acquire timeout (seconds)
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Fixed UTC offset of the business timezone, in hours
    #[serde(default = "default_business_utc_offset_hours")]
    #[validate(custom = "validate_utc_offset")]
    pub business_utc_offset_hours: i32,

    #[serde(default = "default_order_number_prefix")]
    #[validate(custom = "validate_number_prefix")]
    pub order_number_prefix: String,

    #[serde(default = "default_invoice_number_prefix")]
    #[validate(custom = "validate_number_prefix")]
    pub invoice_number_prefix: String,

    /// Tax rate applied when an order request does not carry one
    #[serde(default = "default_tax_rate")]
    #[validate(custom = "validate_tax_rate")]
    pub default_tax_rate: f64,

    /// Allow deleting orders whose business date is strictly in the past
    #[serde(default)]
    pub allow_past_order_deletion: bool,

    #[serde(default)]
    pub reversal_policy: ReversalPolicy,

    /// Local business time (HH:MM) of the daily reconciliation sweep
    #[serde(default = "default_reconciliation_run_at")]
    #[validate(custom = "validate_run_at")]
    pub reconciliation_run_at: String,

    /// Orders reconciled concurrently within one sweep
    #[serde(default = "default_reconciliation_concurrency")]
    #[validate(range(min = 1, max = 64))]
    pub reconciliation_concurrency: usize,

    /// Capacity of the domain event channel
    #[serde(default = "default_event_channel_capacity")]
    #[validate(custom = "validate_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

impl AppConfig {
    /// Builds a configuration with every optional key at its default.
    pub fn new(database_url: String, environment: String) -> Self {
        Self {
            database_url,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            business_utc_offset_hours: default_business_utc_offset_hours(),
            order_number_prefix: default_order_number_prefix(),
            invoice_number_prefix: default_invoice_number_prefix(),
            default_tax_rate: default_tax_rate(),
            allow_past_order_deletion: false,
            reversal_policy: ReversalPolicy::default(),
            reconciliation_run_at: default_reconciliation_run_at(),
            reconciliation_concurrency: default_reconciliation_concurrency(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }

    /// Gets log level reference
    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    /// The business timezone as a fixed offset.
    pub fn business_offset(&self) -> Result<FixedOffset, AppConfigError> {
        FixedOffset::east_opt(self.business_utc_offset_hours * 3600).ok_or_else(|| {
            AppConfigError::Invalid(format!(
                "business_utc_offset_hours out of range: {}",
                self.business_utc_offset_hours
            ))
        })
    }

    /// Parsed local time of the daily sweep.
    pub fn reconciliation_time(&self) -> Result<NaiveTime, AppConfigError> {
        parse_run_at(&self.reconciliation_run_at).ok_or_else(|| {
            AppConfigError::Invalid(format!(
                "reconciliation_run_at must be HH:MM, got '{}'",
                self.reconciliation_run_at
            ))
        })
    }

    /// Default tax rate as a decimal, rounded to four places.
    pub fn default_tax_rate_decimal(&self) -> Decimal {
        Decimal::from_f64(self.default_tax_rate)
            .map(|rate| rate.round_dp(4))
            .unwrap_or_default()
    }

    pub fn db_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.db_connect_timeout_secs)
    }

    pub fn db_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.db_idle_timeout_secs)
    }

    pub fn db_acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.db_acquire_timeout_secs)
    }

    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if self.db_min_connections > self.db_max_connections {
            let mut err = ValidationError::new("db_min_connections");
            err.message = Some("db_min_connections must not exceed db_max_connections".into());
            errors.add("db_min_connections", err);
        }

        if self.order_number_prefix == self.invoice_number_prefix {
            let mut err = ValidationError::new("invoice_number_prefix");
            err.message = Some("order and invoice prefixes must differ".into());
            errors.add("invoice_number_prefix", err);
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

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Default value functions
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
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

fn default_business_utc_offset_hours() -> i32 {
    DEFAULT_BUSINESS_UTC_OFFSET_HOURS
}

fn default_order_number_prefix() -> String {
    "ORD".to_string()
}

fn default_invoice_number_prefix() -> String {
    "INV".to_string()
}

fn default_tax_rate() -> f64 {
    0.11
}

fn default_reconciliation_run_at() -> String {
    DEFAULT_RUN_AT.to_string()
}

fn default_reconciliation_concurrency() -> usize {
    4
}

fn default_event_channel_capacity() -> usize {
    1024
}

fn parse_run_at(value: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M").ok()
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

// Prefixes end up inside identifiers matched with LIKE, so keep them plain.
fn validate_number_prefix(prefix: &str) -> Result<(), ValidationError> {
    if prefix.is_empty() || !prefix.chars().all(|c| c.is_ascii_alphanumeric()) {
        let mut err = ValidationError::new("number_prefix");
        err.message = Some("Prefixes must be non-empty ASCII alphanumerics".into());
        return Err(err);
    }
    Ok(())
}

fn validate_utc_offset(hours: i32) -> Result<(), ValidationError> {
    if !(-12..=14).contains(&hours) {
        let mut err = ValidationError::new("business_utc_offset_hours");
        err.message = Some("business_utc_offset_hours must be between -12 and 14".into());
        return Err(err);
    }
    Ok(())
}

fn validate_tax_rate(rate: f64) -> Result<(), ValidationError> {
    if !rate.is_finite() || rate < 0.0 || rate > 1.0 {
        let mut err = ValidationError::new("default_tax_rate");
        err.message = Some("default_tax_rate must be a finite value between 0.0 and 1.0".into());
        return Err(err);
    }
    Ok(())
}

fn validate_run_at(value: &str) -> Result<(), ValidationError> {
    if parse_run_at(value).is_none() {
        let mut err = ValidationError::new("reconciliation_run_at");
        err.message = Some("reconciliation_run_at must be a 24h time formatted HH:MM".into());
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

    let default_directive = format!("order_ledger={},sea_orm=warn", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    let filter = EnvFilter::new(filter_directive);
    if json {
        let _ = fmt().with_env_filter(filter).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter).try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Default config (config/default.toml)
/// 2. Environment-specific config (config/{env}.toml)
/// 3. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    // Support both RUN_ENV and APP_ENV for selecting config profile
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
        .set_default("database_url", DEFAULT_DATABASE_URL)?
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

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        AppConfig::new("sqlite::memory:".into(), "test".into())
    }

    #[test]
    fn defaults_validate() {
        let cfg = base_config();
        assert!(cfg.validate().is_ok());
        assert!(cfg.validate_additional_constraints().is_ok());
        assert_eq!(cfg.reversal_policy, ReversalPolicy::RestoreOriginalDay);
        assert!(!cfg.allow_past_order_deletion);
    }

    #[test]
    fn business_offset_is_seven_hours_by_default() {
        let offset = base_config().business_offset().unwrap();
        assert_eq!(offset.local_minus_utc(), 7 * 3600);
    }

    #[test]
    fn tax_rate_converts_to_decimal() {
        assert_eq!(
            base_config().default_tax_rate_decimal(),
            Decimal::new(11, 2)
        );
    }

    #[test]
    fn run_at_parses() {
        let cfg = base_config();
        assert_eq!(
            cfg.reconciliation_time().unwrap(),
            NaiveTime::from_hms_opt(0, 5, 0).unwrap()
        );
    }

    #[test]
    fn bad_run_at_is_rejected() {
        let mut cfg = base_config();
        cfg.reconciliation_run_at = "25:99".into();
        assert!(cfg.validate().is_err());
        assert!(cfg.reconciliation_time().is_err());
    }

    #[test]
    fn out_of_range_tax_rate_is_rejected() {
        let mut cfg = base_config();
        cfg.default_tax_rate = 1.5;
        let errors = cfg.validate().unwrap_err();
        assert!(errors.field_errors().contains_key("default_tax_rate"));
    }

    #[test]
    fn offset_and_channel_capacity_are_range_checked() {
        let mut cfg = base_config();
        cfg.business_utc_offset_hours = 15;
        cfg.event_channel_capacity = 0;
        let errors = cfg.validate().unwrap_err();
        let fields = errors.field_errors();
        assert!(fields.contains_key("business_utc_offset_hours"));
        assert!(fields.contains_key("event_channel_capacity"));

        cfg.business_utc_offset_hours = -12;
        cfg.event_channel_capacity = 1;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn prefixes_must_differ() {
        let mut cfg = base_config();
        cfg.invoice_number_prefix = "ORD".into();
        assert!(cfg.validate_additional_constraints().is_err());
    }

    #[test]
    fn prefixes_must_be_alphanumeric() {
        let mut cfg = base_config();
        cfg.order_number_prefix = "OR%".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn reversal_policy_deserializes_from_snake_case() {
        let policy: ReversalPolicy =
            serde_json::from_str("\"return_as_incoming_when_closed\"").unwrap();
        assert_eq!(policy, ReversalPolicy::ReturnAsIncomingWhenClosed);
    }
}
