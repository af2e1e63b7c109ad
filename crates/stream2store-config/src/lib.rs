// stream2store-config - Layered configuration for the pipeline
//
// Sources, lowest priority first:
// 1. Built-in defaults
// 2. TOML file (STREAM2STORE_CONFIG path, STREAM2STORE_CONFIG_CONTENT inline,
//    or ./stream2store.toml)
// 3. Application property groups JSON (BlueprintMetadata group)
// 4. Environment variables (STREAM2STORE_* prefix)
// 5. CLI flags, applied by the binary
//
// Validation runs once all layers are applied and reports every problem at once.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

mod env_overrides;
mod properties;
mod sources;
mod validation;

pub use env_overrides::{EnvSource, ENV_PREFIX};
pub use properties::{apply_property_groups, PropertyGroup, BLUEPRINT_GROUP_ID};
pub use validation::ConfigError;

/// Main runtime configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub source: SourceConfig,

    #[serde(default)]
    pub sink: SinkConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub filter: FilterConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Stream source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub name: String,
    pub region: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_position: Option<InitialPosition>,
    /// RFC 3339 timestamp, required for `AT_TIMESTAMP`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_timestamp: Option<String>,
    pub poll_interval_ms: u64,
    pub max_records_per_poll: i32,
}

impl SourceConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            region: String::new(),
            initial_position: None,
            initial_timestamp: None,
            poll_interval_ms: 1_000,
            max_records_per_poll: 1_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InitialPosition {
    Latest,
    TrimHorizon,
    AtTimestamp,
}

impl std::fmt::Display for InitialPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InitialPosition::Latest => write!(f, "LATEST"),
            InitialPosition::TrimHorizon => write!(f, "TRIM_HORIZON"),
            InitialPosition::AtTimestamp => write!(f, "AT_TIMESTAMP"),
        }
    }
}

impl std::str::FromStr for InitialPosition {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "LATEST" => Ok(InitialPosition::Latest),
            "TRIM_HORIZON" => Ok(InitialPosition::TrimHorizon),
            "AT_TIMESTAMP" => Ok(InitialPosition::AtTimestamp),
            _ => anyhow::bail!(
                "Unsupported initial position: {}. Supported: LATEST, TRIM_HORIZON, AT_TIMESTAMP",
                s
            ),
        }
    }
}

/// Sink writer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    pub parallelism: usize,
    pub target_store_name: String,
    pub max_batch_size: usize,
    pub max_in_flight_requests: usize,
    pub max_buffered_requests: usize,
    pub max_time_in_buffer_ms: u64,
    pub overwrite_by_key_fields: Vec<String>,
    pub fail_on_error: bool,
    pub checkpoint_interval_ms: u64,
    pub drain_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
    pub retry: RetryConfig,
}

impl SinkConfig {
    pub fn max_time_in_buffer(&self) -> Duration {
        Duration::from_millis(self.max_time_in_buffer_ms)
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint_interval_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            parallelism: 1,
            target_store_name: String::new(),
            max_batch_size: 25,
            max_in_flight_requests: 50,
            max_buffered_requests: 10_000,
            max_time_in_buffer_ms: 5_000,
            overwrite_by_key_fields: vec!["ticker".to_string()],
            fail_on_error: false,
            checkpoint_interval_ms: 2_000,
            drain_timeout_ms: 30_000,
            shutdown_grace_ms: 30_000,
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl RetryConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
        }
    }
}

/// Storage backend configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Only honored by the keyspaces backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consistency_level: Option<String>,

    /// Write the item `price` as a String attribute instead of a Number.
    #[serde(default)]
    pub item_price_as_string: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dynamodb: Option<DynamoDbConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyspaces: Option<KeyspacesConfig>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    DynamoDb,
    Keyspaces,
    Memory,
}

impl std::fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreBackend::DynamoDb => write!(f, "dynamodb"),
            StoreBackend::Keyspaces => write!(f, "keyspaces"),
            StoreBackend::Memory => write!(f, "memory"),
        }
    }
}

impl std::str::FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "dynamodb" | "ddb" => Ok(StoreBackend::DynamoDb),
            "keyspaces" | "cassandra" => Ok(StoreBackend::Keyspaces),
            "memory" => Ok(StoreBackend::Memory),
            _ => anyhow::bail!(
                "Unsupported store backend: {}. Supported: dynamodb, keyspaces, memory",
                s
            ),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DynamoDbConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyspacesConfig {
    pub keyspace: String,
    /// Defaults to `cassandra.{region}.amazonaws.com`.
    pub contact_points: Vec<String>,
    pub port: u16,
    /// Defaults to the source region.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_datacenter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
}

impl Default for KeyspacesConfig {
    fn default() -> Self {
        Self {
            keyspace: "stock".to_string(),
            contact_points: Vec::new(),
            port: 9142,
            local_datacenter: None,
            username: None,
            password: None,
        }
    }
}

impl KeyspacesConfig {
    /// Fill region-derived defaults.
    pub fn resolved(&self, region: &str) -> KeyspacesConfig {
        let mut resolved = self.clone();
        if resolved.contact_points.is_empty() {
            resolved.contact_points = vec![format!("cassandra.{}.amazonaws.com", region)];
        }
        if resolved.local_datacenter.is_none() {
            resolved.local_datacenter = Some(region.to_string());
        }
        resolved
    }
}

/// Record filter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub enabled: bool,
    /// Records priced at or above this value are dropped.
    pub price_threshold: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            price_threshold: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

/// Explicit file locations, typically from CLI flags.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub properties_path: Option<PathBuf>,
}

impl RuntimeConfig {
    /// Load configuration from all sources with priority, then validate.
    pub fn load() -> Result<Self> {
        let config = Self::load_unvalidated(&LoadOptions::default())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply every configuration layer without validating, so callers can
    /// layer CLI overrides on top before calling [`RuntimeConfig::validate`].
    pub fn load_unvalidated(options: &LoadOptions) -> Result<Self> {
        sources::load_layers(options)
    }

    /// Merge another config into this one (used for TOML layering).
    pub fn merge(&mut self, other: RuntimeConfig) {
        self.source = other.source;
        self.sink = other.sink;
        self.filter = other.filter;
        self.logging = other.logging;

        self.store.backend = other.store.backend;
        self.store.item_price_as_string = other.store.item_price_as_string;
        if other.store.consistency_level.is_some() {
            self.store.consistency_level = other.store.consistency_level;
        }
        if other.store.dynamodb.is_some() {
            self.store.dynamodb = other.store.dynamodb;
        }
        if other.store.keyspaces.is_some() {
            self.store.keyspaces = other.store.keyspaces;
        }
    }

    /// Apply environment overrides from a custom source.
    pub fn apply_env_overrides_from<E: EnvSource>(&mut self, env: &E) -> Result<()> {
        env_overrides::apply_env_overrides(self, env)
    }

    /// Validate the configuration, collecting every issue.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        validation::validate_config(self)
    }

    /// Keyspaces settings with region-derived defaults applied.
    pub fn keyspaces(&self) -> KeyspacesConfig {
        self.store
            .keyspaces
            .clone()
            .unwrap_or_default()
            .resolved(&self.source.region)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_backend_from_str() {
        assert_eq!(
            "dynamodb".parse::<StoreBackend>().unwrap(),
            StoreBackend::DynamoDb
        );
        assert_eq!("DDB".parse::<StoreBackend>().unwrap(), StoreBackend::DynamoDb);
        assert_eq!(
            "keyspaces".parse::<StoreBackend>().unwrap(),
            StoreBackend::Keyspaces
        );
        assert_eq!(
            "cassandra".parse::<StoreBackend>().unwrap(),
            StoreBackend::Keyspaces
        );
        assert_eq!("memory".parse::<StoreBackend>().unwrap(), StoreBackend::Memory);
        assert!("s3".parse::<StoreBackend>().is_err());
    }

    #[test]
    fn test_initial_position_from_str() {
        assert_eq!(
            "latest".parse::<InitialPosition>().unwrap(),
            InitialPosition::Latest
        );
        assert_eq!(
            "TRIM_HORIZON".parse::<InitialPosition>().unwrap(),
            InitialPosition::TrimHorizon
        );
        assert!("EARLIEST".parse::<InitialPosition>().is_err());
    }

    #[test]
    fn test_default_configs() {
        let sink = SinkConfig::default();
        assert_eq!(sink.max_batch_size, 25);
        assert_eq!(sink.max_in_flight_requests, 50);
        assert_eq!(sink.max_buffered_requests, 10_000);
        assert_eq!(sink.max_time_in_buffer(), Duration::from_millis(5_000));
        assert_eq!(sink.overwrite_by_key_fields, vec!["ticker".to_string()]);
        assert!(!sink.fail_on_error);

        let filter = FilterConfig::default();
        assert!(filter.enabled);
        assert_eq!(filter.price_threshold, 1.0);

        assert_eq!(LoggingConfig::default().format, LogFormat::Text);
        assert_eq!(StoreConfig::default().backend, StoreBackend::DynamoDb);
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: RuntimeConfig = toml::from_str(
            r#"
            [source]
            name = "stock-stream"
            region = "eu-west-1"
            initial_position = "TRIM_HORIZON"

            [sink]
            target_store_name = "stock_prices"
            max_batch_size = 10

            [sink.retry]
            max_attempts = 2

            [store]
            backend = "keyspaces"
            "#,
        )
        .unwrap();

        assert_eq!(config.source.initial_position, Some(InitialPosition::TrimHorizon));
        assert_eq!(config.source.poll_interval_ms, 1_000);
        assert_eq!(config.sink.max_batch_size, 10);
        assert_eq!(config.sink.max_in_flight_requests, 50);
        assert_eq!(config.sink.retry.max_attempts, 2);
        assert_eq!(config.sink.retry.max_backoff_ms, 5_000);
        assert_eq!(config.store.backend, StoreBackend::Keyspaces);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_keyspaces_defaults_follow_region() {
        let mut config = RuntimeConfig::default();
        config.source.region = "ap-south-1".to_string();
        let ks = config.keyspaces();
        assert_eq!(ks.keyspace, "stock");
        assert_eq!(ks.port, 9142);
        assert_eq!(ks.contact_points, vec!["cassandra.ap-south-1.amazonaws.com"]);
        assert_eq!(ks.local_datacenter.as_deref(), Some("ap-south-1"));
    }
}
