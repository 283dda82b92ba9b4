//! Runtime configuration for the pipeline service.
//!
//! Settings cover rule generation (default engine, model, sample size),
//! the text-generation gateway, the rule cache, the worker pool, ledger
//! ordering policy, and optional external collaborators.

use std::time::Duration;

use thiserror::Error;

use crate::ledger::LedgerOptions;
use crate::llm::RetryConfig;
use crate::rules::generator::DEFAULT_CLASSIFIER_THRESHOLD;
use crate::rules::{RuleCacheConfig, DEFAULT_SAMPLE_SIZE};
use crate::scheduler::WorkerPoolConfig;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration for the pipeline service.
#[derive(Debug, Clone)]
pub struct ForgeConfig {
    // Rule generation
    /// Engine used when a request names none or an unknown one.
    pub default_engine: String,
    /// Model passed to the text-generation service; `None` uses the client default.
    pub model: Option<String>,
    /// Leading rows draft rules are tested against.
    pub sample_size: usize,
    /// Minimum classifier score for a rule category to be materialized.
    pub classifier_threshold: f64,

    // Text-generation gateway
    pub llm_timeout: Duration,
    pub llm_max_retries: u32,

    // Rule cache
    pub rule_cache_capacity: usize,
    pub rule_cache_ttl: Duration,

    // Execution
    /// Background workers for step execution.
    pub workers: usize,
    /// Reject starting a step before earlier steps are settled.
    pub enforce_step_order: bool,
    /// Create a `business_rules` step for every run.
    pub include_business_rules_step: bool,

    // Collaborators
    /// Advisory quality scoring service; the local profile evaluator is used when unset.
    pub evaluator_url: Option<String>,
    /// PostgreSQL connection URL; in-memory stores are used when unset.
    pub database_url: Option<String>,
}

impl Default for ForgeConfig {
    fn default() -> Self {
        Self {
            default_engine: "statistical".to_string(),
            model: None,
            sample_size: DEFAULT_SAMPLE_SIZE,
            classifier_threshold: DEFAULT_CLASSIFIER_THRESHOLD,

            llm_timeout: Duration::from_secs(30),
            llm_max_retries: 2,

            rule_cache_capacity: 256,
            rule_cache_ttl: Duration::from_secs(300),

            workers: 4,
            enforce_step_order: false,
            include_business_rules_step: false,

            evaluator_url: None,
            database_url: None,
        }
    }
}

impl ForgeConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `RULEFORGE_DEFAULT_ENGINE`: Default generator engine (default: statistical)
    /// - `RULEFORGE_MODEL`: Model for generation and repair calls
    /// - `RULEFORGE_SAMPLE_SIZE`: Rows used to test drafts (default: 1000)
    /// - `RULEFORGE_CLASSIFIER_THRESHOLD`: Classifier score cutoff (default: 0.7)
    /// - `RULEFORGE_LLM_TIMEOUT_SECS`: Per-call timeout (default: 30)
    /// - `RULEFORGE_LLM_MAX_RETRIES`: Retries per call (default: 2)
    /// - `RULEFORGE_RULE_CACHE_CAPACITY`: Cached datasets (default: 256)
    /// - `RULEFORGE_RULE_CACHE_TTL_SECS`: Cache entry lifetime (default: 300)
    /// - `RULEFORGE_WORKERS`: Background step workers (default: 4)
    /// - `RULEFORGE_ENFORCE_STEP_ORDER`: Strict step ordering (default: false)
    /// - `RULEFORGE_INCLUDE_BUSINESS_RULES_STEP`: Add a business_rules step (default: false)
    /// - `RULEFORGE_EVALUATOR_URL`: Quality evaluator endpoint
    /// - `DATABASE_URL`: PostgreSQL connection URL
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value or the
    /// resulting configuration fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        // Rule generation
        if let Ok(val) = std::env::var("RULEFORGE_DEFAULT_ENGINE") {
            config.default_engine = val;
        }

        if let Ok(val) = std::env::var("RULEFORGE_MODEL") {
            config.model = non_empty(val);
        }

        if let Ok(val) = std::env::var("RULEFORGE_SAMPLE_SIZE") {
            config.sample_size = parse_env_value(&val, "RULEFORGE_SAMPLE_SIZE")?;
        }

        if let Ok(val) = std::env::var("RULEFORGE_CLASSIFIER_THRESHOLD") {
            config.classifier_threshold = parse_env_value(&val, "RULEFORGE_CLASSIFIER_THRESHOLD")?;
        }

        // Gateway
        if let Ok(val) = std::env::var("RULEFORGE_LLM_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "RULEFORGE_LLM_TIMEOUT_SECS")?;
            config.llm_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("RULEFORGE_LLM_MAX_RETRIES") {
            config.llm_max_retries = parse_env_value(&val, "RULEFORGE_LLM_MAX_RETRIES")?;
        }

        // Rule cache
        if let Ok(val) = std::env::var("RULEFORGE_RULE_CACHE_CAPACITY") {
            config.rule_cache_capacity = parse_env_value(&val, "RULEFORGE_RULE_CACHE_CAPACITY")?;
        }

        if let Ok(val) = std::env::var("RULEFORGE_RULE_CACHE_TTL_SECS") {
            let secs: u64 = parse_env_value(&val, "RULEFORGE_RULE_CACHE_TTL_SECS")?;
            config.rule_cache_ttl = Duration::from_secs(secs);
        }

        // Execution
        if let Ok(val) = std::env::var("RULEFORGE_WORKERS") {
            config.workers = parse_env_value(&val, "RULEFORGE_WORKERS")?;
        }

        if let Ok(val) = std::env::var("RULEFORGE_ENFORCE_STEP_ORDER") {
            config.enforce_step_order = parse_env_bool(&val, "RULEFORGE_ENFORCE_STEP_ORDER")?;
        }

        if let Ok(val) = std::env::var("RULEFORGE_INCLUDE_BUSINESS_RULES_STEP") {
            config.include_business_rules_step =
                parse_env_bool(&val, "RULEFORGE_INCLUDE_BUSINESS_RULES_STEP")?;
        }

        // Collaborators
        if let Ok(val) = std::env::var("RULEFORGE_EVALUATOR_URL") {
            config.evaluator_url = non_empty(val);
        }

        if let Ok(val) = std::env::var("DATABASE_URL") {
            config.database_url = non_empty(val);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_engine.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "default_engine cannot be empty".to_string(),
            ));
        }

        if self.sample_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "sample_size must be greater than 0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.classifier_threshold) {
            return Err(ConfigError::ValidationFailed(
                "classifier_threshold must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.llm_timeout.as_secs() == 0 {
            return Err(ConfigError::ValidationFailed(
                "llm_timeout must be greater than 0".to_string(),
            ));
        }

        if self.rule_cache_capacity == 0 {
            return Err(ConfigError::ValidationFailed(
                "rule_cache_capacity must be greater than 0".to_string(),
            ));
        }

        if self.workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "workers must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn ledger_options(&self) -> LedgerOptions {
        LedgerOptions {
            enforce_step_order: self.enforce_step_order,
            include_business_rules_step: self.include_business_rules_step,
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new(self.llm_max_retries)
    }

    pub fn cache_config(&self) -> RuleCacheConfig {
        RuleCacheConfig::new(self.rule_cache_capacity, self.rule_cache_ttl)
    }

    pub fn pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig::new(self.workers)
    }

    /// Builder method to set the default engine.
    pub fn with_default_engine(mut self, engine: impl Into<String>) -> Self {
        self.default_engine = engine.into();
        self
    }

    /// Builder method to set the model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Builder method to set the draft test sample size.
    pub fn with_sample_size(mut self, size: usize) -> Self {
        self.sample_size = size;
        self
    }

    pub fn with_classifier_threshold(mut self, threshold: f64) -> Self {
        self.classifier_threshold = threshold;
        self
    }

    pub fn with_llm_timeout(mut self, timeout: Duration) -> Self {
        self.llm_timeout = timeout;
        self
    }

    pub fn with_llm_max_retries(mut self, retries: u32) -> Self {
        self.llm_max_retries = retries;
        self
    }

    pub fn with_rule_cache(mut self, capacity: usize, ttl: Duration) -> Self {
        self.rule_cache_capacity = capacity;
        self.rule_cache_ttl = ttl;
        self
    }

    /// Builder method to set the number of background workers.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_enforce_step_order(mut self, enforce: bool) -> Self {
        self.enforce_step_order = enforce;
        self
    }

    pub fn with_business_rules_step(mut self, include: bool) -> Self {
        self.include_business_rules_step = include;
        self
    }

    pub fn with_evaluator_url(mut self, url: impl Into<String>) -> Self {
        self.evaluator_url = Some(url.into());
        self
    }

    /// Builder method to set database URL.
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ForgeConfig::default();
        assert_eq!(config.default_engine, "statistical");
        assert_eq!(config.sample_size, 1000);
        assert_eq!(config.llm_timeout, Duration::from_secs(30));
        assert_eq!(config.llm_max_retries, 2);
        assert_eq!(config.rule_cache_capacity, 256);
        assert_eq!(config.rule_cache_ttl, Duration::from_secs(300));
        assert_eq!(config.workers, 4);
        assert!(!config.enforce_step_order);
        assert!(!config.include_business_rules_step);
        assert!((config.classifier_threshold - 0.7).abs() < f64::EPSILON);
        assert!(config.evaluator_url.is_none());
        assert!(config.database_url.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = ForgeConfig::new()
            .with_default_engine("ai")
            .with_model("gpt-4o-mini")
            .with_sample_size(50)
            .with_workers(2)
            .with_enforce_step_order(true)
            .with_business_rules_step(true)
            .with_rule_cache(8, Duration::from_secs(5))
            .with_database_url("postgres://test/db");

        assert_eq!(config.default_engine, "ai");
        assert_eq!(config.model.as_deref(), Some("gpt-4o-mini"));
        assert_eq!(config.sample_size, 50);
        assert_eq!(config.pool_config().num_workers, 2);
        let options = config.ledger_options();
        assert!(options.enforce_step_order);
        assert!(options.include_business_rules_step);
        assert_eq!(config.cache_config().capacity, 8);
        assert_eq!(config.database_url.as_deref(), Some("postgres://test/db"));
    }

    #[test]
    fn test_validation_zero_sample_size() {
        let err = ForgeConfig::default().with_sample_size(0).validate().unwrap_err();
        assert!(err.to_string().contains("sample_size"));
    }

    #[test]
    fn test_validation_zero_workers() {
        let err = ForgeConfig::default().with_workers(0).validate().unwrap_err();
        assert!(err.to_string().contains("workers"));
    }

    #[test]
    fn test_validation_zero_cache_capacity() {
        let err = ForgeConfig::default()
            .with_rule_cache(0, Duration::from_secs(1))
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("rule_cache_capacity"));
    }

    #[test]
    fn test_validation_threshold_range() {
        let err = ForgeConfig::default()
            .with_classifier_threshold(1.5)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("classifier_threshold"));
    }

    #[test]
    fn test_parse_env_bool() {
        assert!(parse_env_bool("true", "test").unwrap());
        assert!(parse_env_bool("1", "test").unwrap());
        assert!(parse_env_bool("YES", "test").unwrap());
        assert!(!parse_env_bool("off", "test").unwrap());
        assert!(parse_env_bool("maybe", "test").is_err());
    }

    #[test]
    fn test_parse_env_value_reports_key() {
        let err = parse_env_value::<usize>("ten", "RULEFORGE_WORKERS").unwrap_err();
        assert!(err.to_string().contains("RULEFORGE_WORKERS"));
        assert_eq!(parse_env_value::<usize>(" 12 ", "K").unwrap(), 12);
    }
}
