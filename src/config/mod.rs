//! Application configuration.
//!
//! A single [`Config`] struct is loaded once at startup from YAML files and
//! environment variables, then passed by reference to the publisher,
//! subscriber and provisioner.

use std::time::Duration;

use serde::Deserialize;

use crate::bus::PollSettings;

/// Default config file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";

/// Environment variable naming an extra config file.
pub const CONFIG_ENV_VAR: &str = "FLOWFORWARD_CONFIG";

/// Environment variable prefix for configuration overrides
/// (`FLOWFORWARD__BROKER__REGION=eu-west-1`).
pub const CONFIG_ENV_PREFIX: &str = "FLOWFORWARD";

/// Environment variable for the tracing filter.
pub const LOG_ENV_VAR: &str = "FLOWFORWARD_LOG";

/// Broker bounds on a single receive call.
pub const MAX_RECEIVE_BATCH: i32 = 10;
pub const MAX_WAIT_TIME_SECS: i32 = 20;

/// Four days, in seconds.
pub const DEFAULT_MESSAGE_RETENTION_SECS: i32 = 345_600;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Broker connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// AWS region.
    pub region: String,
    /// Account id used to build deterministic topic and queue ARNs.
    pub account_id: String,
    /// Custom endpoint (LocalStack).
    pub endpoint_url: Option<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            account_id: "000000000000".to_string(),
            endpoint_url: None,
        }
    }
}

/// Publisher settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Topic events are published to.
    pub topic_name: String,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            topic_name: "auth-events".to_string(),
        }
    }
}

/// Subscriber settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SubscriberConfig {
    /// Queue this service consumes from.
    pub queue_name: String,
    /// Topics the queue is subscribed to.
    pub topics: Vec<String>,
    pub max_messages: i32,
    pub wait_time_secs: i32,
    pub visibility_timeout_secs: i32,
    /// Idle delay between empty or failed polls.
    pub poll_interval_ms: u64,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            queue_name: "accounts-events".to_string(),
            topics: vec!["auth-events".to_string()],
            max_messages: MAX_RECEIVE_BATCH,
            wait_time_secs: MAX_WAIT_TIME_SECS,
            visibility_timeout_secs: 60,
            poll_interval_ms: 1000,
        }
    }
}

impl SubscriberConfig {
    /// Poll settings clamped to what the broker accepts.
    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            max_messages: self.max_messages.clamp(1, MAX_RECEIVE_BATCH),
            wait_time_secs: self.wait_time_secs.clamp(0, MAX_WAIT_TIME_SECS),
            visibility_timeout_secs: self.visibility_timeout_secs.max(0),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }
}

/// Queue creation settings for idempotent provisioning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    pub message_retention_secs: i32,
    pub visibility_timeout_secs: i32,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            message_retention_secs: DEFAULT_MESSAGE_RETENTION_SECS,
            visibility_timeout_secs: 60,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Name stamped as `source` on published events.
    pub service_name: String,
    pub broker: BrokerConfig,
    pub publisher: PublisherConfig,
    pub subscriber: SubscriberConfig,
    pub provisioning: ProvisioningConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: crate::event::UNKNOWN_SOURCE.to_string(),
            broker: BrokerConfig::default(),
            publisher: PublisherConfig::default(),
            subscriber: SubscriberConfig::default(),
            provisioning: ProvisioningConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration.
    ///
    /// Sources, later overriding earlier:
    /// 1. `config.yaml` in the working directory (optional)
    /// 2. `path`, when given
    /// 3. the file named by `FLOWFORWARD_CONFIG`, when set
    /// 4. `FLOWFORWARD__SECTION__KEY` environment variables
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
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
                    .list_separator(",")
                    .with_list_parse_key("subscriber.topics")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.publisher.topic_name.trim().is_empty() {
            return Err(ConfigError::Invalid("publisher.topic_name is empty".to_string()));
        }
        if self.subscriber.queue_name.trim().is_empty() {
            return Err(ConfigError::Invalid("subscriber.queue_name is empty".to_string()));
        }
        Ok(())
    }

    /// Defaults with a service name, for tests and embedded use.
    pub fn for_service(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Self::default()
        }
    }
}
