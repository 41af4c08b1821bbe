//! Configuration validation module.
//!
//! Provides comprehensive validation for all configuration values,
//! failing fast on invalid configuration rather than at runtime.

use crate::AppConfig;
use redka_jobs::{BatcherConfig, DelayConfig, RedisConfig, WorkerConfig};
use std::fmt;
use url::Url;

/// Configuration validation error variants.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValidationError {
    /// URL format is invalid.
    InvalidUrl { url_type: String, message: String },
    /// Pool size exceeds maximum allowed.
    PoolSizeTooLarge { value: usize, maximum: usize },
    /// Pool cannot serve every blocked dequeue plus other commands.
    PoolTooSmall { pool_size: usize, parallel: usize },
    /// Key prefix is empty.
    EmptyKeyPrefix,
    /// Interval or timeout value must be positive.
    NonPositiveInterval { name: String, value: u64 },
    /// Worker parallelism must be at least one.
    ZeroParallel,
    /// Live jobs would be reclaimed between two heartbeats.
    StaleBeforeHeartbeat {
        heartbeat_interval_ms: u64,
        stale_after_ms: u64,
    },
    /// A configured batch is incomplete.
    InvalidBatch { index: usize, message: String },
    /// Log level is invalid.
    InvalidLogLevel { value: String },
    /// Log format is invalid.
    InvalidLogFormat { value: String },
}

impl fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidUrl { url_type, message } => {
                write!(f, "Invalid {} URL: {}", url_type, message)
            }
            Self::PoolSizeTooLarge { value, maximum } => {
                write!(
                    f,
                    "Pool size {} exceeds maximum allowed ({})",
                    value, maximum
                )
            }
            Self::PoolTooSmall { pool_size, parallel } => {
                write!(
                    f,
                    "Pool size {} must exceed worker parallelism {}",
                    pool_size, parallel
                )
            }
            Self::EmptyKeyPrefix => write!(f, "Redis key prefix must not be empty"),
            Self::NonPositiveInterval { name, value } => {
                write!(f, "Interval '{}' must be positive, got {}", name, value)
            }
            Self::ZeroParallel => write!(f, "Worker parallelism must be at least 1"),
            Self::StaleBeforeHeartbeat {
                heartbeat_interval_ms,
                stale_after_ms,
            } => {
                write!(
                    f,
                    "delay.stale_after_ms ({}) must be at least twice worker.heartbeat_interval_ms ({})",
                    stale_after_ms, heartbeat_interval_ms
                )
            }
            Self::InvalidBatch { index, message } => {
                write!(f, "Invalid batch #{}: {}", index, message)
            }
            Self::InvalidLogLevel { value } => {
                write!(
                    f,
                    "Invalid log level: '{}' (valid: trace, debug, info, warn, error)",
                    value
                )
            }
            Self::InvalidLogFormat { value } => {
                write!(f, "Invalid log format: '{}' (valid: json, pretty)", value)
            }
        }
    }
}

impl std::error::Error for ConfigValidationError {}

/// Result of configuration validation containing all errors found.
#[derive(Debug)]
pub struct ValidationResult {
    errors: Vec<ConfigValidationError>,
}

impl ValidationResult {
    fn new() -> Self {
        Self { errors: Vec::new() }
    }

    fn add_error(&mut self, error: ConfigValidationError) {
        self.errors.push(error);
    }

    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &[ConfigValidationError] {
        &self.errors
    }

    /// Converts to Result, returning Err with all errors if any exist.
    pub fn into_result(self) -> Result<(), Vec<ConfigValidationError>> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self.errors)
        }
    }
}

/// Configuration validator.
pub struct ConfigValidator;

impl ConfigValidator {
    /// Maximum connection pool size.
    const MAX_POOL_SIZE: usize = 1000;
    /// Valid log levels.
    const VALID_LOG_LEVELS: &'static [&'static str] = &["trace", "debug", "info", "warn", "error"];
    /// Valid log formats.
    const VALID_LOG_FORMATS: &'static [&'static str] = &["json", "pretty"];

    /// Validates the entire application configuration.
    ///
    /// Returns Ok(()) if valid, or Err with all validation errors found.
    pub fn validate(config: &AppConfig) -> Result<(), Vec<ConfigValidationError>> {
        let mut result = ValidationResult::new();

        Self::validate_redis(&config.jobs.redis, &config.jobs.worker, &mut result);
        Self::validate_worker(&config.jobs.worker, &mut result);
        Self::validate_delay(&config.jobs.delay, &mut result);
        Self::validate_heartbeat(&config.jobs.worker, &config.jobs.delay, &mut result);
        Self::validate_batcher(&config.jobs.batcher, &mut result);
        Self::validate_batches(config, &mut result);
        Self::validate_observability(config, &mut result);

        result.into_result()
    }

    fn validate_redis(config: &RedisConfig, worker: &WorkerConfig, result: &mut ValidationResult) {
        match Url::parse(&config.url) {
            Ok(url) if matches!(url.scheme(), "redis" | "rediss") => {}
            Ok(_) => result.add_error(ConfigValidationError::InvalidUrl {
                url_type: "redis".to_string(),
                message: "URL must start with redis:// or rediss://".to_string(),
            }),
            Err(e) => result.add_error(ConfigValidationError::InvalidUrl {
                url_type: "redis".to_string(),
                message: e.to_string(),
            }),
        }

        if config.pool_size > Self::MAX_POOL_SIZE {
            result.add_error(ConfigValidationError::PoolSizeTooLarge {
                value: config.pool_size,
                maximum: Self::MAX_POOL_SIZE,
            });
        }

        // Each polling slot holds a connection while blocked in a dequeue.
        if config.pool_size <= worker.parallel {
            result.add_error(ConfigValidationError::PoolTooSmall {
                pool_size: config.pool_size,
                parallel: worker.parallel,
            });
        }

        if config.key_prefix.is_empty() {
            result.add_error(ConfigValidationError::EmptyKeyPrefix);
        }
    }

    fn validate_worker(config: &WorkerConfig, result: &mut ValidationResult) {
        if config.parallel == 0 {
            result.add_error(ConfigValidationError::ZeroParallel);
        }
        Self::positive("worker.heartbeat_interval_ms", config.heartbeat_interval_ms, result);
        Self::positive("worker.dequeue_timeout_ms", config.dequeue_timeout_ms, result);
        if let Some(timeout) = config.timeout_ms {
            Self::positive("worker.timeout_ms", timeout, result);
        }
    }

    fn validate_delay(config: &DelayConfig, result: &mut ValidationResult) {
        Self::positive("delay.poll_interval_ms", config.poll_interval_ms, result);
        Self::positive("delay.stale_after_ms", config.stale_after_ms, result);
    }

    fn validate_heartbeat(worker: &WorkerConfig, delay: &DelayConfig, result: &mut ValidationResult) {
        if worker.heartbeat_interval_ms == 0 || delay.stale_after_ms == 0 {
            return;
        }
        if delay.stale_after_ms < worker.heartbeat_interval_ms.saturating_mul(2) {
            result.add_error(ConfigValidationError::StaleBeforeHeartbeat {
                heartbeat_interval_ms: worker.heartbeat_interval_ms,
                stale_after_ms: delay.stale_after_ms,
            });
        }
    }

    fn validate_batcher(config: &BatcherConfig, result: &mut ValidationResult) {
        Self::positive("batcher.poll_interval_ms", config.poll_interval_ms, result);
    }

    fn validate_batches(config: &AppConfig, result: &mut ValidationResult) {
        for (index, batch) in config.jobs.batches.iter().enumerate() {
            if let Err(e) = batch.validate() {
                result.add_error(ConfigValidationError::InvalidBatch {
                    index,
                    message: e.to_string(),
                });
            }
        }
    }

    fn validate_observability(config: &AppConfig, result: &mut ValidationResult) {
        let level = config.observability.log_level.to_lowercase();
        if !Self::VALID_LOG_LEVELS.contains(&level.as_str()) {
            result.add_error(ConfigValidationError::InvalidLogLevel {
                value: config.observability.log_level.clone(),
            });
        }

        let format = config.observability.log_format.to_lowercase();
        if !Self::VALID_LOG_FORMATS.contains(&format.as_str()) {
            result.add_error(ConfigValidationError::InvalidLogFormat {
                value: config.observability.log_format.clone(),
            });
        }
    }

    fn positive(name: &str, value: u64, result: &mut ValidationResult) {
        if value == 0 {
            result.add_error(ConfigValidationError::NonPositiveInterval {
                name: name.to_string(),
                value,
            });
        }
    }
}

/// Formats validation errors for display.
pub fn format_validation_errors(errors: &[ConfigValidationError]) -> String {
    let mut output = String::from("Configuration validation failed:\n");
    for (i, error) in errors.iter().enumerate() {
        output.push_str(&format!("  {}. {}\n", i + 1, error));
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use redka_jobs::BatchConfig;

    #[test]
    fn test_valid_config_passes() {
        let config = AppConfig::default();
        assert!(ConfigValidator::validate(&config).is_ok());
    }

    #[test]
    fn test_invalid_redis_url() {
        let mut config = AppConfig::default();
        config.jobs.redis.url = "http://localhost:6379".to_string();

        let errors = ConfigValidator::validate(&config).unwrap_err();
        assert!(errors.iter().any(|e| matches!(
            e,
            ConfigValidationError::InvalidUrl { url_type, .. } if url_type == "redis"
        )));
    }

    #[test]
    fn test_pool_must_exceed_parallelism() {
        let mut config = AppConfig::default();
        config.jobs.redis.pool_size = 4;
        config.jobs.worker.parallel = 4;

        let errors = ConfigValidator::validate(&config).unwrap_err();
        assert!(errors.contains(&ConfigValidationError::PoolTooSmall {
            pool_size: 4,
            parallel: 4,
        }));
    }

    #[test]
    fn test_zero_intervals() {
        let mut config = AppConfig::default();
        config.jobs.delay.poll_interval_ms = 0;
        config.jobs.worker.timeout_ms = Some(0);

        let errors = ConfigValidator::validate(&config).unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| matches!(
            e,
            ConfigValidationError::NonPositiveInterval { .. }
        )));
    }

    #[test]
    fn test_stale_threshold_must_cover_two_heartbeats() {
        let mut config = AppConfig::default();
        config.jobs.worker.heartbeat_interval_ms = 1000;
        config.jobs.delay.stale_after_ms = 300;

        let errors = ConfigValidator::validate(&config).unwrap_err();
        assert_eq!(
            errors,
            vec![ConfigValidationError::StaleBeforeHeartbeat {
                heartbeat_interval_ms: 1000,
                stale_after_ms: 300,
            }]
        );

        config.jobs.delay.stale_after_ms = 1500;
        assert!(ConfigValidator::validate(&config).is_err());

        config.jobs.delay.stale_after_ms = 2000;
        assert!(ConfigValidator::validate(&config).is_ok());
    }

    #[test]
    fn test_incomplete_batch() {
        let mut config = AppConfig::default();
        config
            .jobs
            .batches
            .push(BatchConfig::new("clicks", "click", "", "clicks", 10));

        let errors = ConfigValidator::validate(&config).unwrap_err();
        assert!(matches!(
            &errors[0],
            ConfigValidationError::InvalidBatch { index: 0, message } if message.contains("target_queue")
        ));
    }

    #[test]
    fn test_invalid_log_settings() {
        let mut config = AppConfig::default();
        config.observability.log_level = "verbose".to_string();
        config.observability.log_format = "xml".to_string();

        let errors = ConfigValidator::validate(&config).unwrap_err();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_format_validation_errors() {
        let errors = vec![
            ConfigValidationError::EmptyKeyPrefix,
            ConfigValidationError::ZeroParallel,
        ];

        let output = format_validation_errors(&errors);
        assert!(output.contains("1. Redis key prefix must not be empty"));
        assert!(output.contains("2. Worker parallelism"));
    }
}
