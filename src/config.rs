//! Layered configuration.
//!
//! Sources are merged in order, later ones winning:
//!
//! 1. Built-in defaults ([`Config::default`])
//! 2. A TOML file (`readthru.toml` in the working directory unless another
//!    path is given; a missing file is skipped)
//! 3. Environment variables prefixed `READTHRU__`, with `__` separating
//!    nested keys, e.g. `READTHRU__STORE__PORT=6380`
//!
//! ```toml
//! [store]
//! host = "cache.internal"
//! port = 6379
//! timeout_ms = 500
//! done_retention_secs = 86400
//!
//! [cache]
//! default_ttl_secs = 30
//!
//! [queue]
//! name = "mail"
//! max_attempts = 5
//! ```

use std::path::Path;
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::background::QueueConfig;
use crate::cache::{CacheConfig, CacheConfigError};

pub const DEFAULT_CONFIG_FILE: &str = "readthru.toml";
pub const ENV_PREFIX: &str = "READTHRU__";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("invalid configuration: {field} {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },

    #[error(transparent)]
    Cache(#[from] CacheConfigError),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Load(Box::new(err))
    }
}

/// Connection settings for the shared store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub host: String,
    pub port: u16,
    /// Bound on each store call, in milliseconds.
    pub timeout_ms: u64,
    /// How long finished (`Done`) job records are kept. Zero keeps them
    /// forever. Dead-lettered records are always kept.
    pub done_retention_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 6379,
            timeout_ms: 2_000,
            done_retention_secs: 24 * 60 * 60,
        }
    }
}

impl StoreConfig {
    pub fn url(&self) -> String {
        format!("redis://{}:{}", self.host, self.port)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn done_retention(&self) -> Duration {
        Duration::from_secs(self.done_retention_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// TTL for mounts that don't set their own.
    pub default_ttl_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            default_ttl_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub name: String,
    pub max_attempts: u32,
    pub poll_interval_ms: u64,
    pub concurrency: usize,
    pub handler_timeout_secs: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        let defaults = QueueConfig::default();
        Self {
            name: defaults.name,
            max_attempts: defaults.max_attempts,
            poll_interval_ms: defaults.poll_interval.as_millis() as u64,
            concurrency: defaults.concurrency,
            handler_timeout_secs: defaults.handler_timeout.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub cache: CacheSettings,
    pub queue: QueueSettings,
}

impl Config {
    /// Loads from defaults, `readthru.toml` and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_figment(Self::figment(Path::new(DEFAULT_CONFIG_FILE)))
    }

    /// Like [`Config::load`] with an explicit TOML file.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_figment(Self::figment(path.as_ref()))
    }

    /// The provider stack, exposed so callers can merge their own sources.
    pub fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: Config = figment.extract()?;
        config.validate()?;
        tracing::debug!(
            store = %config.store.url(),
            queue = %config.queue.name,
            default_ttl_secs = config.cache.default_ttl_secs,
            "configuration loaded"
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, reason| Err(ConfigError::Invalid { field, reason });

        if self.store.host.is_empty() {
            return invalid("store.host", "cannot be empty");
        }
        if self.store.timeout_ms == 0 {
            return invalid("store.timeout_ms", "must be greater than 0");
        }
        if self.cache.default_ttl_secs == 0 {
            return invalid("cache.default_ttl_secs", "must be greater than 0");
        }
        if self.queue.name.is_empty() {
            return invalid("queue.name", "cannot be empty");
        }
        if self.queue.max_attempts == 0 {
            return invalid("queue.max_attempts", "must be greater than 0");
        }
        if self.queue.poll_interval_ms == 0 {
            return invalid("queue.poll_interval_ms", "must be greater than 0");
        }
        if self.queue.concurrency == 0 {
            return invalid("queue.concurrency", "must be greater than 0");
        }
        if self.queue.handler_timeout_secs == 0 {
            return invalid("queue.handler_timeout_secs", "must be greater than 0");
        }
        Ok(())
    }

    /// Cache settings for a mount using the default TTL.
    pub fn cache_config(&self) -> Result<CacheConfig, ConfigError> {
        let config = CacheConfig::from_secs(self.cache.default_ttl_secs)?;
        Ok(config.store_timeout(self.store.timeout()))
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            name: self.queue.name.clone(),
            max_attempts: self.queue.max_attempts,
            poll_interval: Duration::from_millis(self.queue.poll_interval_ms),
            concurrency: self.queue.concurrency,
            handler_timeout: Duration::from_secs(self.queue.handler_timeout_secs),
            store_timeout: self.store.timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.store.url(), "redis://127.0.0.1:6379");
        assert_eq!(config.queue_config(), QueueConfig {
            name: "default".to_owned(),
            ..QueueConfig::default()
        });
        assert_eq!(config.cache_config().unwrap().ttl(), Duration::from_secs(30));
    }

    #[test]
    fn file_then_env_override_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "readthru.toml",
                r#"
                    [store]
                    host = "cache.internal"
                    port = 6380

                    [queue]
                    name = "mail"
                    max_attempts = 5
                "#,
            )?;
            jail.set_env("READTHRU__STORE__PORT", "6381");
            jail.set_env("READTHRU__CACHE__DEFAULT_TTL_SECS", "120");

            let config = Config::load().expect("config loads");
            assert_eq!(config.store.url(), "redis://cache.internal:6381");
            assert_eq!(config.cache.default_ttl_secs, 120);

            let queue = config.queue_config();
            assert_eq!(queue.name, "mail");
            assert_eq!(queue.max_attempts, 5);
            assert_eq!(queue.concurrency, 1);
            assert_eq!(queue.store_timeout, Duration::from_secs(2));
            Ok(())
        });
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        Jail::expect_with(|_| {
            assert_eq!(Config::load().expect("config loads"), Config::default());
            Ok(())
        });
    }

    #[test]
    fn zero_ttl_is_rejected() {
        Jail::expect_with(|jail| {
            jail.set_env("READTHRU__CACHE__DEFAULT_TTL_SECS", "0");
            let err = Config::load().unwrap_err();
            assert!(matches!(
                err,
                ConfigError::Invalid { field: "cache.default_ttl_secs", .. }
            ));
            Ok(())
        });
    }

    #[test]
    fn zero_attempts_and_concurrency_are_rejected() {
        let mut config = Config::default();
        config.queue.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.queue.concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file("readthru.toml", "[queue]\npoll_interval_ms = 0\n")?;
            let err = Config::load().unwrap_err();
            assert!(matches!(
                err,
                ConfigError::Invalid { field: "queue.poll_interval_ms", .. }
            ));
            Ok(())
        });

        let mut config = Config::default();
        config.queue.poll_interval_ms = 1;
        config.validate().unwrap();
    }

    #[test]
    fn done_retention_can_be_disabled() {
        Jail::expect_with(|jail| {
            jail.set_env("READTHRU__STORE__DONE_RETENTION_SECS", "0");
            let config = Config::load().expect("config loads");
            assert_eq!(config.store.done_retention(), Duration::ZERO);
            Ok(())
        });
        assert_eq!(Config::default().store.done_retention(), Duration::from_secs(86_400));
    }

    #[test]
    fn malformed_values_fail_to_load() {
        Jail::expect_with(|jail| {
            jail.set_env("READTHRU__STORE__PORT", "not-a-port");
            assert!(matches!(Config::load(), Err(ConfigError::Load(_))));
            Ok(())
        });
    }
}
