//! Configuration management for hiddenwire
//!
//! Defaults for every knob, optional TOML file loading, and
//! `HIDDENWIRE_<SECTION>_<KEY>` environment overrides.

use humantime_serde::re::humantime;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt::Display;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

mod error;

pub use error::ConfigError;

use crate::core_auth::AuthStrategy;
use crate::core_channel::DEFAULT_MAX_FRAME_LEN;
use crate::logging::LogLevel;

const ENV_PREFIX: &str = "HIDDENWIRE";

/// Main configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub network: NetworkConfig,
    pub channel: ChannelConfig,
    pub auth: AuthConfig,
    pub ttl: TtlConfig,
    pub dispatch: DispatchConfig,
    pub logging: LoggingConfig,
}

/// Proxy and hidden-service endpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Local SOCKS proxy of the anonymity daemon
    pub proxy_address: SocketAddr,

    /// Where the hidden service forwards inbound connections
    pub listen_address: SocketAddr,

    /// Virtual port dialled on remote identifiers
    pub hidden_service_port: u16,

    /// Upper bound for connect + proxy handshake + authentication
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

/// Multiplexer and framing limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Largest accepted frame payload in bytes
    pub max_frame_len: u32,

    pub read_buffer_size: usize,

    /// Longest a single poll may block
    #[serde(with = "humantime_serde")]
    pub poll_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub strategy: AuthStrategy,

    /// Accepted distance between a handshake timestamp and the local clock
    #[serde(with = "humantime_serde")]
    pub max_clock_skew: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TtlConfig {
    #[serde(with = "humantime_serde")]
    pub tick: Duration,

    /// Idle time after which a peer's channel is closed
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub workers: usize,

    /// Delay before a declined send is offered again
    #[serde(with = "humantime_serde")]
    pub retry_interval: Duration,

    /// Send timeout used when the caller gives none
    #[serde(with = "humantime_serde")]
    pub default_timeout: Duration,

    /// Minimum spacing between dial attempts to one peer after a failure
    #[serde(with = "humantime_serde")]
    pub reconnect_delay: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    pub json_format: bool,
    pub with_timestamp: bool,
    pub with_target: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            proxy_address: SocketAddr::from(([127, 0, 0, 1], 9050)),
            listen_address: SocketAddr::from(([127, 0, 0, 1], 9878)),
            hidden_service_port: 9878,
            connect_timeout: Duration::from_secs(60),
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            read_buffer_size: 16 * 1024,
            poll_timeout: Duration::from_secs(1),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self { strategy: AuthStrategy::PublicKey, max_clock_skew: Duration::from_secs(60) }
    }
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self { tick: Duration::from_secs(1), idle_timeout: Duration::from_secs(300) }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            retry_interval: Duration::from_millis(250),
            default_timeout: Duration::from_secs(60),
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), json_format: false, with_timestamp: true, with_target: true }
    }
}

/// Overwrite `target` with the parsed value of `HIDDENWIRE_<key>`, if set
fn env_override<T>(key: &str, target: &mut T) -> Result<(), ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    let name = format!("{ENV_PREFIX}_{key}");
    if let Ok(raw) = env::var(&name) {
        *target = raw
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue { key: name, message: e.to_string() })?;
    }
    Ok(())
}

fn env_duration(key: &str, target: &mut Duration) -> Result<(), ConfigError> {
    let name = format!("{ENV_PREFIX}_{key}");
    if let Ok(raw) = env::var(&name) {
        *target = humantime::parse_duration(&raw)
            .map_err(|e| ConfigError::InvalidValue { key: name, message: e.to_string() })?;
    }
    Ok(())
}

impl Config {
    /// Load configuration from environment variables on top of the defaults
    ///
    /// Variables follow the pattern `HIDDENWIRE_<SECTION>_<KEY>`, e.g.
    /// `HIDDENWIRE_NETWORK_PROXY_ADDRESS=127.0.0.1:9150` or
    /// `HIDDENWIRE_TTL_IDLE_TIMEOUT=10m`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        env_override("NETWORK_PROXY_ADDRESS", &mut config.network.proxy_address)?;
        env_override("NETWORK_LISTEN_ADDRESS", &mut config.network.listen_address)?;
        env_override("NETWORK_HIDDEN_SERVICE_PORT", &mut config.network.hidden_service_port)?;
        env_duration("NETWORK_CONNECT_TIMEOUT", &mut config.network.connect_timeout)?;

        env_override("CHANNEL_MAX_FRAME_LEN", &mut config.channel.max_frame_len)?;
        env_override("CHANNEL_READ_BUFFER_SIZE", &mut config.channel.read_buffer_size)?;
        env_duration("CHANNEL_POLL_TIMEOUT", &mut config.channel.poll_timeout)?;

        env_override("AUTH_STRATEGY", &mut config.auth.strategy)?;
        env_duration("AUTH_MAX_CLOCK_SKEW", &mut config.auth.max_clock_skew)?;

        env_duration("TTL_TICK", &mut config.ttl.tick)?;
        env_duration("TTL_IDLE_TIMEOUT", &mut config.ttl.idle_timeout)?;

        env_override("DISPATCH_WORKERS", &mut config.dispatch.workers)?;
        env_duration("DISPATCH_RETRY_INTERVAL", &mut config.dispatch.retry_interval)?;
        env_duration("DISPATCH_DEFAULT_TIMEOUT", &mut config.dispatch.default_timeout)?;
        env_duration("DISPATCH_RECONNECT_DELAY", &mut config.dispatch.reconnect_delay)?;

        env_override("LOG_LEVEL", &mut config.logging.level)?;
        env_override("LOG_JSON", &mut config.logging.json_format)?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file; missing keys keep their defaults
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::FileReadError(e.to_string()))?;

        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel.max_frame_len == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_frame_len must be greater than 0".to_string(),
            ));
        }

        if self.channel.read_buffer_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "read_buffer_size must be greater than 0".to_string(),
            ));
        }

        if self.dispatch.workers == 0 {
            return Err(ConfigError::ValidationFailed("workers must be greater than 0".to_string()));
        }

        if self.ttl.tick.is_zero() {
            return Err(ConfigError::ValidationFailed("ttl tick must be non-zero".to_string()));
        }

        if self.ttl.tick > self.ttl.idle_timeout {
            return Err(ConfigError::ValidationFailed(format!(
                "ttl tick ({:?}) exceeds idle timeout ({:?})",
                self.ttl.tick, self.ttl.idle_timeout
            )));
        }

        if self.logging.level.parse::<LogLevel>().is_err() {
            return Err(ConfigError::ValidationFailed(format!(
                "Invalid log level: {}",
                self.logging.level
            )));
        }

        Ok(())
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: impl AsRef<std::path::Path>) -> Result<(), ConfigError> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, contents).map_err(|e| ConfigError::FileWriteError(e.to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.network.proxy_address.port(), 9050);
        assert_eq!(config.channel.max_frame_len, 1024 * 1024);
        assert_eq!(config.auth.strategy, AuthStrategy::PublicKey);
        assert_eq!(config.auth.max_clock_skew, Duration::from_secs(60));
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.channel.max_frame_len = 0;
        assert!(config.validate().is_err());

        config = Config::default();
        config.dispatch.workers = 0;
        assert!(config.validate().is_err());

        config = Config::default();
        config.ttl.tick = Duration::from_secs(600);
        assert!(config.validate().is_err());

        config = Config::default();
        config.ttl.tick = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_log_level_validation() {
        let mut config = Config::default();

        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());

        config.logging.level = "DEBUG".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hiddenwire.toml");

        let mut config = Config::default();
        config.auth.strategy = AuthStrategy::Dummy;
        config.ttl.idle_timeout = Duration::from_secs(90);
        config.save_to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.toml");
        std::fs::write(&path, "[dispatch]\nworkers = 8\nretry_interval = \"100ms\"\n").unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.dispatch.workers, 8);
        assert_eq!(loaded.dispatch.retry_interval, Duration::from_millis(100));
        assert_eq!(loaded.network, NetworkConfig::default());
    }

    #[test]
    fn test_unparseable_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "[dispatch\nworkers = ").unwrap();
        assert!(matches!(Config::from_file(&path), Err(ConfigError::ParseError(_))));
        assert!(matches!(
            Config::from_file(dir.path().join("missing.toml")),
            Err(ConfigError::FileReadError(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        env::set_var("HIDDENWIRE_DISPATCH_WORKERS", "2");
        env::set_var("HIDDENWIRE_TTL_IDLE_TIMEOUT", "2m");
        env::set_var("HIDDENWIRE_AUTH_STRATEGY", "dummy");
        let config = Config::from_env();
        env::remove_var("HIDDENWIRE_DISPATCH_WORKERS");
        env::remove_var("HIDDENWIRE_TTL_IDLE_TIMEOUT");
        env::remove_var("HIDDENWIRE_AUTH_STRATEGY");

        let config = config.unwrap();
        assert_eq!(config.dispatch.workers, 2);
        assert_eq!(config.ttl.idle_timeout, Duration::from_secs(120));
        assert_eq!(config.auth.strategy, AuthStrategy::Dummy);
    }
}
