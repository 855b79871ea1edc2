use std::time::Duration;

use core_config::{ConfigError, Environment, FromEnv, env_or_default, env_parse_or};
use resilience::{CircuitBreakerConfig, RetryConfig};

use crate::embedding::DEFAULT_EMBEDDING_MODEL;
use crate::models::BulkSyncOptions;
use crate::schema::DEFAULT_DIMENSION;

/// Settings for the sync subsystem
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Environment name used in index keys and resource names
    pub environment: String,
    pub embedding_model: String,
    pub dimension: u32,
    pub schema_version: u32,
    pub circuit_failure_threshold: u32,
    pub circuit_reset_timeout: Duration,
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub batch_size: usize,
    pub concurrency: usize,
    /// Zero disables the embedding cache
    pub embedding_cache_ttl: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            environment: Environment::Development.short_name().to_string(),
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            dimension: DEFAULT_DIMENSION,
            schema_version: 1,
            circuit_failure_threshold: 5,
            circuit_reset_timeout: Duration::from_millis(60_000),
            max_attempts: 3,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 10_000,
            batch_size: 50,
            concurrency: 1,
            embedding_cache_ttl: Duration::from_secs(3600),
        }
    }
}

impl SyncConfig {
    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::new()
            .with_failure_threshold(self.circuit_failure_threshold)
            .with_reset_timeout(self.circuit_reset_timeout)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new()
            .with_max_attempts(self.max_attempts)
            .with_initial_delay(self.retry_base_delay_ms)
            .with_max_delay(self.retry_max_delay_ms)
    }

    pub fn bulk_options(&self, force: bool) -> BulkSyncOptions {
        BulkSyncOptions {
            force,
            batch_size: self.batch_size,
            concurrency: self.concurrency,
            ..Default::default()
        }
    }
}

impl FromEnv for SyncConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let environment = env_or_default(
            "VECTOR_ENVIRONMENT",
            Environment::from_env().short_name(),
        );

        let config = Self {
            environment,
            embedding_model: env_or_default("EMBEDDING_MODEL", DEFAULT_EMBEDDING_MODEL),
            dimension: env_parse_or("VECTOR_DIMENSION", defaults.dimension)?,
            schema_version: env_parse_or("VECTOR_SCHEMA_VERSION", defaults.schema_version)?,
            circuit_failure_threshold: env_parse_or(
                "CIRCUIT_FAILURE_THRESHOLD",
                defaults.circuit_failure_threshold,
            )?,
            circuit_reset_timeout: Duration::from_millis(env_parse_or(
                "CIRCUIT_RESET_TIMEOUT_MS",
                60_000u64,
            )?),
            max_attempts: env_parse_or("SYNC_MAX_ATTEMPTS", defaults.max_attempts)?,
            retry_base_delay_ms: env_parse_or(
                "SYNC_RETRY_BASE_DELAY_MS",
                defaults.retry_base_delay_ms,
            )?,
            retry_max_delay_ms: env_parse_or("SYNC_RETRY_MAX_DELAY_MS", defaults.retry_max_delay_ms)?,
            batch_size: env_parse_or("SYNC_BATCH_SIZE", defaults.batch_size)?,
            concurrency: env_parse_or("SYNC_CONCURRENCY", defaults.concurrency)?,
            embedding_cache_ttl: Duration::from_secs(env_parse_or(
                "EMBEDDING_CACHE_TTL_SECS",
                3600u64,
            )?),
        };

        if config.dimension == 0 {
            return Err(ConfigError::ParseError {
                key: "VECTOR_DIMENSION".to_string(),
                details: "must be greater than zero".to_string(),
            });
        }
        if config.batch_size == 0 {
            return Err(ConfigError::ParseError {
                key: "SYNC_BATCH_SIZE".to_string(),
                details: "must be greater than zero".to_string(),
            });
        }

        Ok(config)
    }
}
