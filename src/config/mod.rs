//! Configuration loading for the Broadcaster service.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `BROADCASTER_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, net::SocketAddr, path::PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use crate::backoff::BackoffPolicy;

/// Application configuration derived from `BROADCASTER_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_api_bind_addr")]
    pub api_bind_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,
    /// Outbound channel credential for the single-account deployment mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_token: Option<String>,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub backoff: BackoffConfig,
}

/// Scheduler-specific configuration parameters.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct SchedulerConfig {
    /// Seconds between scheduler passes. Must stay at or below minute
    /// resolution so delivery windows are honored promptly.
    ///
    /// Environment variable: `BROADCASTER_SCHEDULER_TICK_INTERVAL_SECONDS`
    #[serde(default = "default_scheduler_tick_interval_seconds")]
    #[schema(example = 60)]
    pub tick_interval_seconds: u64,
}

/// Dispatcher configuration covering task claiming and send pacing.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct DispatchConfig {
    /// Milliseconds between dispatcher ticks
    #[serde(default = "default_dispatch_tick_ms")]
    #[schema(example = 5000)]
    pub tick_ms: u64,

    /// Maximum number of broadcasts executed concurrently
    #[serde(default = "default_dispatch_concurrency")]
    #[schema(example = 4)]
    pub concurrency: usize,

    /// Maximum number of run tasks claimed per tick
    #[serde(default = "default_dispatch_claim_batch")]
    #[schema(example = 16)]
    pub claim_batch: usize,

    /// Contacts processed between checkpoint writes
    #[serde(default = "default_checkpoint_interval")]
    #[schema(example = 10)]
    pub checkpoint_interval: usize,

    /// Fixed base of the inter-message delay in milliseconds
    #[serde(default = "default_message_delay_ms")]
    #[schema(example = 1000)]
    pub message_delay_ms: u64,

    /// Upper bound of the uniform jitter added to the inter-message delay
    #[serde(default = "default_message_delay_jitter_ms")]
    #[schema(example = 2000)]
    pub message_delay_jitter_ms: u64,

    /// Global cap on sends per minute across all broadcasts
    #[serde(default = "default_max_sends_per_minute")]
    #[schema(example = 60)]
    pub max_sends_per_minute: u32,
}

/// Retry policy for a single contact's send attempt sequence.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct BackoffConfig {
    /// Additional attempts after the first try (default: 3)
    ///
    /// Environment variable: `BROADCASTER_BACKOFF_MAX_RETRIES`
    #[serde(default = "default_backoff_max_retries")]
    #[schema(example = 3)]
    pub max_retries: u32,

    /// Base retry interval in seconds; attempt n sleeps base * 2^n
    ///
    /// Environment variable: `BROADCASTER_BACKOFF_BASE_SECONDS`
    #[serde(default = "default_backoff_base_seconds")]
    #[schema(example = 1)]
    pub base_seconds: u64,

    /// Upper bound for any single retry delay
    ///
    /// Environment variable: `BROADCASTER_BACKOFF_MAX_SECONDS`
    #[serde(default = "default_backoff_max_seconds")]
    #[schema(example = 60)]
    pub max_seconds: u64,
}

impl BackoffConfig {
    /// Convert into the engine's pure retry policy.
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: self.max_retries,
            base_seconds: self.base_seconds,
            max_seconds: self.max_seconds,
        }
    }

    /// Validate backoff configuration bounds
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_seconds > self.max_seconds {
            return Err(ConfigError::InvalidBackoffBounds {
                base: self.base_seconds,
                max: self.max_seconds,
            });
        }
        if self.max_retries > 10 {
            return Err(ConfigError::InvalidBackoffRetries {
                value: self.max_retries,
            });
        }
        Ok(())
    }
}

impl SchedulerConfig {
    /// Validate scheduler configuration bounds
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval_seconds < 10 || self.tick_interval_seconds > 300 {
            return Err(ConfigError::InvalidSchedulerTickInterval {
                value: self.tick_interval_seconds,
            });
        }
        Ok(())
    }
}

impl DispatchConfig {
    /// Validate dispatcher configuration bounds
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 || self.concurrency > 64 {
            return Err(ConfigError::InvalidDispatchConcurrency {
                value: self.concurrency,
            });
        }
        if self.checkpoint_interval == 0 {
            return Err(ConfigError::InvalidCheckpointInterval {
                value: self.checkpoint_interval,
            });
        }
        if self.max_sends_per_minute == 0 {
            return Err(ConfigError::InvalidSendRate {
                value: self.max_sends_per_minute,
            });
        }
        Ok(())
    }

    /// Minimum gap between two sends under the global rate cap.
    pub fn min_send_gap(&self) -> std::time::Duration {
        std::time::Duration::from_millis(60_000 / self.max_sends_per_minute.max(1) as u64)
    }
}

impl AppConfig {
    /// Returns the configured bind address as a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.api_bind_addr.parse()
    }

    /// Returns a redacted JSON representation (secrets are redacted).
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        if config.channel_token.is_some() {
            config.channel_token = Some("[REDACTED]".to_string());
        }
        serde_json::to_string_pretty(&config)
    }

    /// Validates the configuration, returning an error if any section is out of bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scheduler.validate()?;
        self.dispatch.validate()?;
        self.backoff.validate()?;
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            api_bind_addr: default_api_bind_addr(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            database_url: default_database_url(),
            db_max_connections: default_db_max_connections(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            channel_token: None,
            scheduler: SchedulerConfig::default(),
            dispatch: DispatchConfig::default(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_seconds: default_scheduler_tick_interval_seconds(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_dispatch_tick_ms(),
            concurrency: default_dispatch_concurrency(),
            claim_batch: default_dispatch_claim_batch(),
            checkpoint_interval: default_checkpoint_interval(),
            message_delay_ms: default_message_delay_ms(),
            message_delay_jitter_ms: default_message_delay_jitter_ms(),
            max_sends_per_minute: default_max_sends_per_minute(),
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_retries: default_backoff_max_retries(),
            base_seconds: default_backoff_base_seconds(),
            max_seconds: default_backoff_max_seconds(),
        }
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_api_bind_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_database_url() -> String {
    "postgres://localhost:5432/broadcaster".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_acquire_timeout_ms() -> u64 {
    5000
}

fn default_scheduler_tick_interval_seconds() -> u64 {
    60
}

fn default_dispatch_tick_ms() -> u64 {
    5000
}

fn default_dispatch_concurrency() -> usize {
    4
}

fn default_dispatch_claim_batch() -> usize {
    16
}

fn default_checkpoint_interval() -> usize {
    10
}

fn default_message_delay_ms() -> u64 {
    1000
}

fn default_message_delay_jitter_ms() -> u64 {
    2000
}

fn default_max_sends_per_minute() -> u32 {
    60
}

fn default_backoff_max_retries() -> u32 {
    3
}

fn default_backoff_base_seconds() -> u64 {
    1
}

fn default_backoff_max_seconds() -> u64 {
    60
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("invalid api bind address '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error("scheduler tick interval must be between 10 and 300 seconds, got {value}")]
    InvalidSchedulerTickInterval { value: u64 },
    #[error("dispatch concurrency must be between 1 and 64, got {value}")]
    InvalidDispatchConcurrency { value: usize },
    #[error("checkpoint interval must be at least 1, got {value}")]
    InvalidCheckpointInterval { value: usize },
    #[error("max sends per minute must be positive, got {value}")]
    InvalidSendRate { value: u32 },
    #[error("backoff base seconds ({base}) cannot be greater than max seconds ({max})")]
    InvalidBackoffBounds { base: u64, max: u64 },
    #[error("backoff max retries must not exceed 10, got {value}")]
    InvalidBackoffRetries { value: u32 },
}

/// Loads configuration using layered `.env` files and `BROADCASTER_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads configuration: `.env`, then `.env.<profile>`, then process
    /// environment variables, with later layers winning.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        // Overlay process environment last so it wins.
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix("BROADCASTER_") {
                layered.insert(stripped.to_string(), value);
            }
        }

        let profile = layered
            .remove("PROFILE")
            .filter(|v| !v.is_empty())
            .unwrap_or(profile_hint);

        let take_string = |layered: &mut BTreeMap<String, String>, key: &str| {
            layered.remove(key).filter(|v| !v.is_empty())
        };

        let api_bind_addr =
            take_string(&mut layered, "API_BIND_ADDR").unwrap_or_else(default_api_bind_addr);
        let log_level = take_string(&mut layered, "LOG_LEVEL").unwrap_or_else(default_log_level);
        let log_format = take_string(&mut layered, "LOG_FORMAT").unwrap_or_else(default_log_format);
        let database_url =
            take_string(&mut layered, "DATABASE_URL").unwrap_or_else(default_database_url);
        let channel_token = take_string(&mut layered, "CHANNEL_TOKEN");

        let db_max_connections = layered
            .remove("DB_MAX_CONNECTIONS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_db_max_connections);
        let db_acquire_timeout_ms = layered
            .remove("DB_ACQUIRE_TIMEOUT_MS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_db_acquire_timeout_ms);

        let scheduler = SchedulerConfig {
            tick_interval_seconds: layered
                .remove("SCHEDULER_TICK_INTERVAL_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_scheduler_tick_interval_seconds),
        };

        let dispatch = DispatchConfig {
            tick_ms: layered
                .remove("DISPATCH_TICK_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_dispatch_tick_ms),
            concurrency: layered
                .remove("DISPATCH_CONCURRENCY")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_dispatch_concurrency),
            claim_batch: layered
                .remove("DISPATCH_CLAIM_BATCH")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_dispatch_claim_batch),
            checkpoint_interval: layered
                .remove("DISPATCH_CHECKPOINT_INTERVAL")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_checkpoint_interval),
            message_delay_ms: layered
                .remove("DISPATCH_MESSAGE_DELAY_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_message_delay_ms),
            message_delay_jitter_ms: layered
                .remove("DISPATCH_MESSAGE_DELAY_JITTER_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_message_delay_jitter_ms),
            max_sends_per_minute: layered
                .remove("DISPATCH_MAX_SENDS_PER_MINUTE")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_max_sends_per_minute),
        };

        let backoff = BackoffConfig {
            max_retries: layered
                .remove("BACKOFF_MAX_RETRIES")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_backoff_max_retries),
            base_seconds: layered
                .remove("BACKOFF_BASE_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_backoff_base_seconds),
            max_seconds: layered
                .remove("BACKOFF_MAX_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_backoff_max_seconds),
        };

        let config = AppConfig {
            profile,
            api_bind_addr,
            log_level,
            log_format,
            database_url,
            db_max_connections,
            db_acquire_timeout_ms,
            channel_token,
            scheduler,
            dispatch,
            backoff,
        };

        config.validate()?;

        if let Err(source) = config.api_bind_addr.parse::<SocketAddr>() {
            return Err(ConfigError::InvalidBindAddr {
                value: config.api_bind_addr.clone(),
                source,
            });
        }

        Ok(config)
    }

    /// Read `.env` and `.env.<profile>` from the base directory. Missing
    /// files are fine; unreadable ones are errors.
    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut layered = BTreeMap::new();

        let profile_hint = env::var("BROADCASTER_PROFILE")
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_profile);

        for file_name in [".env".to_string(), format!(".env.{}", profile_hint)] {
            let path = self.base_dir.join(&file_name);
            match dotenvy::from_path_iter(&path) {
                Ok(entries) => {
                    for entry in entries {
                        let (key, value) = entry.map_err(|source| ConfigError::EnvFile {
                            path: path.clone(),
                            source,
                        })?;
                        if let Some(stripped) = key.strip_prefix("BROADCASTER_") {
                            layered.insert(stripped.to_string(), value);
                        }
                    }
                }
                Err(dotenvy::Error::Io(ref io_err))
                    if io_err.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => return Err(ConfigError::EnvFile { path, source }),
            }
        }

        Ok((layered, profile_hint))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduler.tick_interval_seconds, 60);
        assert_eq!(config.dispatch.checkpoint_interval, 10);
        assert_eq!(config.backoff.max_retries, 3);
    }

    #[test]
    fn scheduler_tick_bounds() {
        let config = SchedulerConfig {
            tick_interval_seconds: 5,
        };
        assert!(config.validate().is_err());

        let config = SchedulerConfig {
            tick_interval_seconds: 301,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn backoff_bounds() {
        let config = BackoffConfig {
            max_retries: 3,
            base_seconds: 120,
            max_seconds: 60,
        };
        assert!(config.validate().is_err());

        let config = BackoffConfig {
            max_retries: 11,
            base_seconds: 1,
            max_seconds: 60,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn dispatch_bounds_and_send_gap() {
        let mut config = DispatchConfig::default();
        config.max_sends_per_minute = 120;
        assert_eq!(config.min_send_gap(), std::time::Duration::from_millis(500));

        config.concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn backoff_policy_conversion() {
        let config = BackoffConfig::default();
        let policy = config.policy();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.base_seconds, 1);
    }

    #[test]
    fn redacted_json_hides_channel_token() {
        let mut config = AppConfig::default();
        config.channel_token = Some("super-secret".to_string());
        let json = config.redacted_json().expect("serializes");
        assert!(!json.contains("super-secret"));
        assert!(json.contains("[REDACTED]"));
    }
}
