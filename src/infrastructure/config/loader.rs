use std::path::Path;

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use crate::domain::models::config::Config;

/// Configuration error types
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Invalid confidence_threshold: {0}. Must be in (0, 1]")]
    InvalidConfidenceThreshold(f32),

    #[error("Invalid token_budget: must be at least 1")]
    ZeroTokenBudget,

    #[error("Invalid chars_per_token: must be at least 1")]
    ZeroCharsPerToken,

    #[error("Invalid relevance_floor: {0}. Must be in [0, 1]")]
    InvalidRelevanceFloor(f32),

    #[error("Invalid max_attempts: {0}. Must be at least 1")]
    InvalidMaxAttempts(u32),

    #[error(
        "Invalid backoff configuration: initial_backoff_ms ({0}) must be less than max_backoff_ms ({1})"
    )]
    InvalidBackoff(u64, u64),

    #[error("Invalid multiplier: {multiplier} must exceed 1 + jitter_ratio ({jitter_ratio}) for delays to grow")]
    NonIncreasingBackoff { multiplier: f64, jitter_ratio: f64 },

    #[error("Invalid jitter_ratio: {0}. Must be in [0, 1)")]
    InvalidJitter(f64),

    #[error("Invalid fix_loop.max_iterations: must be at least 1")]
    ZeroFixIterations,

    #[error("Invalid streaming.queue_capacity: must be at least 1")]
    ZeroQueueCapacity,

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Invalid log rotation: {0}. Must be one of: daily, hourly, never")]
    InvalidRotation(String),
}

/// Configuration loader with hierarchical merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration for the current directory
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (Serialized)
    /// 2. .conductor/config.yaml (project config)
    /// 3. .conductor/local.yaml (local overrides, optional)
    /// 4. Environment variables (CONDUCTOR_* prefix, `__` for nesting)
    pub fn load() -> Result<Config> {
        Self::load_in(Path::new("."))
    }

    /// Load configuration for a project rooted at `root`
    pub fn load_in(root: &Path) -> Result<Config> {
        let config: Config = Self::figment(root)
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file, defaults underneath
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .with_context(|| format!("Failed to load config from {}", path.as_ref().display()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    fn figment(root: &Path) -> Figment {
        let dir = root.join(".conductor");
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(dir.join("config.yaml")))
            .merge(Yaml::file(dir.join("local.yaml")))
            .merge(Env::prefixed("CONDUCTOR_").split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        let threshold = config.intent.confidence_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(ConfigError::InvalidConfidenceThreshold(threshold));
        }

        if config.context.token_budget == 0 {
            return Err(ConfigError::ZeroTokenBudget);
        }
        if config.context.chars_per_token == 0 {
            return Err(ConfigError::ZeroCharsPerToken);
        }
        let floor = config.context.relevance_floor;
        if !(0.0..=1.0).contains(&floor) {
            return Err(ConfigError::InvalidRelevanceFloor(floor));
        }

        let retry = &config.retry;
        if retry.max_attempts == 0 {
            return Err(ConfigError::InvalidMaxAttempts(retry.max_attempts));
        }
        if retry.initial_backoff_ms >= retry.max_backoff_ms {
            return Err(ConfigError::InvalidBackoff(
                retry.initial_backoff_ms,
                retry.max_backoff_ms,
            ));
        }
        if !(0.0..1.0).contains(&retry.jitter_ratio) {
            return Err(ConfigError::InvalidJitter(retry.jitter_ratio));
        }
        // Worst-case jitter on attempt n must stay below the base delay of n+1.
        if retry.multiplier <= 1.0 + retry.jitter_ratio {
            return Err(ConfigError::NonIncreasingBackoff {
                multiplier: retry.multiplier,
                jitter_ratio: retry.jitter_ratio,
            });
        }

        if config.fix_loop.max_iterations == 0 {
            return Err(ConfigError::ZeroFixIterations);
        }
        if config.streaming.queue_capacity == 0 {
            return Err(ConfigError::ZeroQueueCapacity);
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }

        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        let valid_rotations = ["daily", "hourly", "never"];
        if !valid_rotations.contains(&config.logging.rotation.as_str()) {
            return Err(ConfigError::InvalidRotation(config.logging.rotation.clone()));
        }

        Ok(())
    }
}
