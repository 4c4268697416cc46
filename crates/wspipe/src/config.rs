//! Connection and admission timing configuration.
//!
//! Loading flow:
//! 1. Start with compiled [`WsConfig::default()`]
//! 2. If a JSON file is given and exists, its keys replace the defaults
//! 3. Apply `WSPIPE_*` environment variable overrides (highest priority)
//! 4. Validate

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::ConfigError;

/// Timing, size, and capacity policy for clients and the manager.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WsConfig {
    /// Time allowed to write a frame to the peer, in milliseconds.
    pub write_wait_ms: u64,
    /// Time allowed to read the next pong from the peer, in milliseconds.
    pub pong_wait_ms: u64,
    /// Maximum inbound message size in bytes.
    pub max_message_size: usize,
    /// How long `process` waits for client setup, in milliseconds.
    pub admission_timeout_ms: u64,
    /// Expected concurrent connections; sizes the registry and dead-signal channel.
    pub registry_capacity: usize,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            write_wait_ms: 15_000,
            pong_wait_ms: 10_000,
            max_message_size: 512,
            admission_timeout_ms: 5_000,
            registry_capacity: 100,
        }
    }
}

impl WsConfig {
    /// Write deadline window.
    pub fn write_wait(&self) -> Duration {
        Duration::from_millis(self.write_wait_ms)
    }

    /// Read deadline window, refreshed on every pong.
    pub fn pong_wait(&self) -> Duration {
        Duration::from_millis(self.pong_wait_ms)
    }

    /// Ping period: nine tenths of the pong wait, so a ping always lands
    /// before the peer's read deadline.
    pub fn ping_period(&self) -> Duration {
        self.pong_wait() * 9 / 10
    }

    /// Admission timeout for `Manager::process`.
    pub fn admission_timeout(&self) -> Duration {
        Duration::from_millis(self.admission_timeout_ms)
    }

    /// Reject values that would make the supervisor spin or never admit.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.write_wait_ms == 0 {
            return Err(ConfigError::InvalidValue("write_wait_ms must be > 0".into()));
        }
        if self.pong_wait_ms < 10 {
            return Err(ConfigError::InvalidValue("pong_wait_ms must be >= 10".into()));
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::InvalidValue("max_message_size must be > 0".into()));
        }
        if self.admission_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue("admission_timeout_ms must be > 0".into()));
        }
        if self.registry_capacity == 0 {
            return Err(ConfigError::InvalidValue("registry_capacity must be > 0".into()));
        }
        Ok(())
    }
}

/// Load configuration from an optional JSON file plus process environment.
///
/// A missing file yields defaults; an unreadable or malformed file is an error.
pub fn load_config(path: Option<&Path>) -> Result<WsConfig, ConfigError> {
    load_config_with(path, |key| std::env::var(key).ok())
}

/// Like [`load_config`], with an injectable environment lookup.
pub fn load_config_with(
    path: Option<&Path>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<WsConfig, ConfigError> {
    let mut config = match path {
        Some(path) if path.exists() => {
            debug!(?path, "loading config from file");
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str::<WsConfig>(&content)?
        }
        Some(path) => {
            debug!(?path, "config file not found, using defaults");
            WsConfig::default()
        }
        None => WsConfig::default(),
    };

    apply_env_overrides(&mut config, env);
    config.validate()?;
    Ok(config)
}

/// Apply `WSPIPE_*` overrides. Unparseable or out-of-range values are ignored.
pub fn apply_env_overrides(config: &mut WsConfig, env: impl Fn(&str) -> Option<String>) {
    if let Some(v) = read_u64(&env, "WSPIPE_WRITE_WAIT_MS", 1, 3_600_000) {
        config.write_wait_ms = v;
    }
    if let Some(v) = read_u64(&env, "WSPIPE_PONG_WAIT_MS", 10, 3_600_000) {
        config.pong_wait_ms = v;
    }
    if let Some(v) = read_u64(&env, "WSPIPE_MAX_MESSAGE_SIZE", 1, 64 * 1024 * 1024) {
        config.max_message_size = usize::try_from(v).unwrap_or(config.max_message_size);
    }
    if let Some(v) = read_u64(&env, "WSPIPE_ADMISSION_TIMEOUT_MS", 1, 600_000) {
        config.admission_timeout_ms = v;
    }
    if let Some(v) = read_u64(&env, "WSPIPE_REGISTRY_CAPACITY", 1, 1_000_000) {
        config.registry_capacity = usize::try_from(v).unwrap_or(config.registry_capacity);
    }
}

fn read_u64(env: &impl Fn(&str) -> Option<String>, key: &str, min: u64, max: u64) -> Option<u64> {
    let raw = env(key)?;
    match raw.trim().parse::<u64>() {
        Ok(v) if (min..=max).contains(&v) => Some(v),
        _ => {
            debug!(key, value = %raw, "ignoring invalid env override");
            None
        }
    }
}
