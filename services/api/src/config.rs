//! services/api/src/config.rs
//!
//! Defines the application's configuration structure and loading logic.
//!
//! All configuration is loaded from environment variables at startup. The `.env`
//! file is used for local development.

use std::net::SocketAddr;
use std::time::Duration;
use study_state_core::StateConfig;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for the environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    /// When absent the service keeps its durable state in process memory.
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub log_level: Level,
    pub inactivity_timeout_secs: u64,
    pub rolling_window_secs: u64,
    pub buffer_eviction_throttle_secs: u64,
    pub context_cache_ttl_secs: u64,
    pub lecture_buffer_idle_secs: u64,
    pub janitor_interval_secs: u64,
    pub shutdown_grace_secs: u64,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// It will look for a `.env` file in the current directory for development,
    /// but this is skipped in test environments to ensure tests are hermetic.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination.
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        // --- Load Server and Database Settings ---
        let bind_address_str =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
        let bind_address = bind_address_str.parse::<SocketAddr>().map_err(|e| {
            ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string())
        })?;

        let database_url = std::env::var("DATABASE_URL")
            .ok()
            .filter(|url| !url.trim().is_empty());
        let db_max_connections = u32::try_from(env_number("DB_MAX_CONNECTIONS", 5)?)
            .map_err(|e| ConfigError::InvalidValue("DB_MAX_CONNECTIONS".to_string(), e.to_string()))?;

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        // --- Load State Tuning ---
        Ok(Self {
            bind_address,
            database_url,
            db_max_connections,
            log_level,
            inactivity_timeout_secs: env_number("STUDY_INACTIVITY_TIMEOUT_SECS", 300)?,
            rolling_window_secs: env_number("ROLLING_WINDOW_SECS", 60)?,
            buffer_eviction_throttle_secs: env_number("BUFFER_EVICTION_THROTTLE_SECS", 10)?,
            context_cache_ttl_secs: env_number("CONTEXT_CACHE_TTL_SECS", 3600)?,
            lecture_buffer_idle_secs: env_number("LECTURE_BUFFER_IDLE_SECS", 1800)?,
            janitor_interval_secs: env_number("JANITOR_INTERVAL_SECS", 60)?,
            shutdown_grace_secs: env_number("SHUTDOWN_GRACE_SECS", 10)?,
        })
    }

    /// The core's view of the tuning knobs.
    pub fn state_config(&self) -> StateConfig {
        StateConfig {
            inactivity_timeout: seconds(self.inactivity_timeout_secs),
            rolling_window: seconds(self.rolling_window_secs),
            eviction_throttle: seconds(self.buffer_eviction_throttle_secs),
            context_cache_ttl: seconds(self.context_cache_ttl_secs),
            lecture_buffer_idle: seconds(self.lecture_buffer_idle_secs),
            janitor_interval: Duration::from_secs(self.janitor_interval_secs),
            ..StateConfig::default()
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Upper bound for every numeric setting, ten years in seconds. Timestamps shifted by it
/// stay well inside chrono's representable range.
const MAX_SETTING: u64 = 10 * 365 * 24 * 60 * 60;

fn seconds(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_SETTING) as i64)
}

fn env_number(name: &str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => parse_positive(name, &raw),
        Err(_) => Ok(default),
    }
}

fn parse_positive(name: &str, raw: &str) -> Result<u64, ConfigError> {
    match raw.trim().parse::<u64>() {
        Ok(0) => Err(ConfigError::InvalidValue(
            name.to_string(),
            "must be greater than zero".to_string(),
        )),
        Ok(value) if value > MAX_SETTING => Err(ConfigError::InvalidValue(
            name.to_string(),
            format!("must be at most {}", MAX_SETTING),
        )),
        Ok(value) => Ok(value),
        Err(e) => Err(ConfigError::InvalidValue(name.to_string(), e.to_string())),
    }
}
