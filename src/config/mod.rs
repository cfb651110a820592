//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod messaging;

pub use messaging::{AmqpConfig, MessagingConfig, MessagingType, QueueNames};

use serde::Deserialize;

use crate::publisher::DEFAULT_CHUNK_SIZE;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "motobus.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "MOTOBUS_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "MOTOBUS";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "MOTOBUS_LOG";

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Broker and queue configuration.
    pub messaging: MessagingConfig,
    /// Retry budgets.
    pub retry: RetryConfig,
    /// Publisher settings.
    pub publisher: PublisherConfig,
}

/// Retry budgets for the primary and poison paths.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Primary-path failures before a message is moved to the poison queue.
    pub max_attempts: u32,
    /// Delayed poison-path retries before a message is dropped.
    pub max_poison_retries: u32,
    /// Backoff unit in milliseconds; poison retry `n` waits `2^n` units.
    pub backoff_unit_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_poison_retries: 3,
            backoff_unit_ms: 1000,
        }
    }
}

/// Publisher settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Fragment size of chunked transfers, in bytes.
    pub chunk_size: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `motobus.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, Box<dyn std::error::Error>> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        Ok(config)
    }

    /// In-process configuration with millisecond backoff, for tests.
    pub fn for_test() -> Self {
        let mut config = Self::default();
        config.messaging.messaging_type = MessagingType::Channel;
        config.retry.backoff_unit_ms = 5;
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    fn yaml_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.messaging.messaging_type, MessagingType::Amqp);
        assert_eq!(config.messaging.amqp.url, "amqp://localhost:5672");
        assert_eq!(config.messaging.prefetch, 1);
        assert_eq!(config.messaging.queues.events, "rider-info");
        assert_eq!(config.messaging.queues.chunks, "image-stream");
        assert_eq!(config.messaging.queues.poison, "rider-info-poison");
        assert!(config.messaging.queues.plates.is_none());
        assert_eq!(config.messaging.delay_queue_prefix, "retry-poison");
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.max_poison_retries, 3);
        assert_eq!(config.retry.backoff_unit_ms, 1000);
        assert_eq!(config.publisher.chunk_size, 4096);
    }

    #[test]
    fn test_config_for_test() {
        let config = Config::for_test();
        assert_eq!(config.messaging.messaging_type, MessagingType::Channel);
        assert_eq!(config.retry.backoff_unit_ms, 5);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = "messaging:\n  type: channel\n  queues:\n    events: riders\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.messaging.messaging_type, MessagingType::Channel);
        assert_eq!(config.messaging.queues.events, "riders");
        assert_eq!(config.messaging.queues.poison, "rider-info-poison");
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    #[serial]
    fn test_load_from_path() {
        let file = yaml_file(
            "messaging:\n  amqp:\n    url: amqp://rabbit:5672\n  queues:\n    plates: licence-plate-update\nretry:\n  max_attempts: 5\n",
        );

        let config = Config::load(file.path().to_str()).unwrap();
        assert_eq!(config.messaging.amqp.url, "amqp://rabbit:5672");
        assert_eq!(
            config.messaging.queues.plates.as_deref(),
            Some("licence-plate-update")
        );
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.max_poison_retries, 3);
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let file = yaml_file("retry:\n  max_attempts: 5\n");
        std::env::set_var("MOTOBUS__RETRY__MAX_ATTEMPTS", "7");
        std::env::set_var("MOTOBUS__MESSAGING__PREFETCH", "4");

        let result = Config::load(file.path().to_str());

        std::env::remove_var("MOTOBUS__RETRY__MAX_ATTEMPTS");
        std::env::remove_var("MOTOBUS__MESSAGING__PREFETCH");

        let config = result.unwrap();
        assert_eq!(config.retry.max_attempts, 7);
        assert_eq!(config.messaging.prefetch, 4);
    }

    #[test]
    #[serial]
    fn test_missing_explicit_file_is_an_error() {
        assert!(Config::load(Some("/nonexistent/motobus.yaml")).is_err());
    }
}
