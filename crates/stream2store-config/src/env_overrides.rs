use crate::{DynamoDbConfig, InitialPosition, KeyspacesConfig, LogFormat, RuntimeConfig, StoreBackend};
use anyhow::{anyhow, Context, Result};

pub const ENV_PREFIX: &str = "STREAM2STORE_";

/// Abstraction over environment-variable lookups so tests can supply their
/// own source of overrides.
pub trait EnvSource {
    fn get(&self, key: &str) -> Option<String>;

    /// Get an environment variable WITHOUT the STREAM2STORE_ prefix
    /// Used for AWS standard variables (AWS_REGION, etc.)
    fn get_raw(&self, key: &str) -> Option<String>;
}

/// Apply environment-variable overrides to the runtime config.
pub fn apply_env_overrides<E: EnvSource>(config: &mut RuntimeConfig, env: &E) -> Result<()> {
    // Source configuration
    if let Some(name) = get_env_string(env, "SOURCE_NAME")? {
        config.source.name = name;
    }
    // Fall back to the standard AWS variable when no explicit region is configured
    if let Some(region) = get_env_string(env, "SOURCE_REGION")? {
        config.source.region = region;
    } else if config.source.region.is_empty() {
        if let Some(region) = get_raw_env_string(env, "AWS_REGION")? {
            config.source.region = region;
        }
    }
    if let Some(position) = get_env_string(env, "SOURCE_INITIAL_POSITION")? {
        config.source.initial_position = Some(
            position
                .parse::<InitialPosition>()
                .context("Invalid STREAM2STORE_SOURCE_INITIAL_POSITION value")?,
        );
    }
    if let Some(ts) = get_env_string(env, "SOURCE_INITIAL_TIMESTAMP")? {
        config.source.initial_timestamp = Some(ts);
    }
    if let Some(val) = get_env_u64(env, "SOURCE_POLL_INTERVAL_MS")? {
        config.source.poll_interval_ms = val;
    }

    // Sink configuration
    if let Some(val) = get_env_usize(env, "SINK_PARALLELISM")? {
        config.sink.parallelism = val;
    }
    if let Some(name) = get_env_string(env, "SINK_TARGET_STORE_NAME")? {
        config.sink.target_store_name = name;
    }
    if let Some(val) = get_env_usize(env, "SINK_MAX_BATCH_SIZE")? {
        config.sink.max_batch_size = val;
    }
    if let Some(val) = get_env_usize(env, "SINK_MAX_IN_FLIGHT_REQUESTS")? {
        config.sink.max_in_flight_requests = val;
    }
    if let Some(val) = get_env_usize(env, "SINK_MAX_BUFFERED_REQUESTS")? {
        config.sink.max_buffered_requests = val;
    }
    if let Some(val) = get_env_u64(env, "SINK_MAX_TIME_IN_BUFFER_MS")? {
        config.sink.max_time_in_buffer_ms = val;
    }
    if let Some(fields) = get_env_string(env, "SINK_OVERWRITE_BY_KEY_FIELDS")? {
        config.sink.overwrite_by_key_fields = fields
            .split(',')
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(str::to_string)
            .collect();
    }
    if let Some(val) = get_env_bool(env, "SINK_FAIL_ON_ERROR")? {
        config.sink.fail_on_error = val;
    }
    if let Some(val) = get_env_u64(env, "SINK_CHECKPOINT_INTERVAL_MS")? {
        config.sink.checkpoint_interval_ms = val;
    }
    if let Some(val) = get_env_u64(env, "SINK_DRAIN_TIMEOUT_MS")? {
        config.sink.drain_timeout_ms = val;
    }
    if let Some(val) = get_env_u64(env, "SINK_SHUTDOWN_GRACE_MS")? {
        config.sink.shutdown_grace_ms = val;
    }
    if let Some(val) = get_env_u32(env, "SINK_RETRY_MAX_ATTEMPTS")? {
        config.sink.retry.max_attempts = val;
    }
    if let Some(val) = get_env_u64(env, "SINK_RETRY_INITIAL_BACKOFF_MS")? {
        config.sink.retry.initial_backoff_ms = val;
    }
    if let Some(val) = get_env_u64(env, "SINK_RETRY_MAX_BACKOFF_MS")? {
        config.sink.retry.max_backoff_ms = val;
    }

    // Store backend
    if let Some(backend) = get_env_string(env, "STORE_BACKEND")? {
        config.store.backend = backend
            .parse::<StoreBackend>()
            .context("Invalid STREAM2STORE_STORE_BACKEND value")?;
    }
    if let Some(level) = get_env_string(env, "STORE_CONSISTENCY_LEVEL")? {
        config.store.consistency_level = Some(level);
    }
    if let Some(val) = get_env_bool(env, "STORE_ITEM_PRICE_AS_STRING")? {
        config.store.item_price_as_string = val;
    }
    if let Some(endpoint) = get_env_string(env, "DYNAMODB_ENDPOINT")? {
        ensure_dynamodb(config).endpoint = Some(endpoint);
    }
    if let Some(keyspace) = get_env_string(env, "KEYSPACES_KEYSPACE")? {
        ensure_keyspaces(config).keyspace = keyspace;
    }
    if let Some(points) = get_env_string(env, "KEYSPACES_CONTACT_POINTS")? {
        ensure_keyspaces(config).contact_points = points
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();
    }
    if let Some(port) = get_env_u16(env, "KEYSPACES_PORT")? {
        ensure_keyspaces(config).port = port;
    }
    if let Some(dc) = get_env_string(env, "KEYSPACES_LOCAL_DATACENTER")? {
        ensure_keyspaces(config).local_datacenter = Some(dc);
    }
    if let Some(username) = get_env_string(env, "KEYSPACES_USERNAME")? {
        ensure_keyspaces(config).username = Some(username);
    }
    if let Some(password) = get_env_string(env, "KEYSPACES_PASSWORD")? {
        ensure_keyspaces(config).password = Some(password);
    }

    // Filter
    if let Some(val) = get_env_bool(env, "FILTER_ENABLED")? {
        config.filter.enabled = val;
    }
    if let Some(val) = get_env_string(env, "FILTER_PRICE_THRESHOLD")? {
        config.filter.price_threshold = val
            .parse::<f64>()
            .map_err(|e| anyhow!("Failed to parse {}FILTER_PRICE_THRESHOLD: {}", ENV_PREFIX, e))?;
    }

    // Logging
    if let Some(level) = get_env_string(env, "LOG_LEVEL")? {
        config.logging.level = level;
    }
    if let Some(format) = get_env_string(env, "LOG_FORMAT")? {
        config.logging.format = match format.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Text,
        };
    }

    Ok(())
}

fn ensure_dynamodb(config: &mut RuntimeConfig) -> &mut DynamoDbConfig {
    config.store.dynamodb.get_or_insert_with(DynamoDbConfig::default)
}

fn ensure_keyspaces(config: &mut RuntimeConfig) -> &mut KeyspacesConfig {
    config.store.keyspaces.get_or_insert_with(KeyspacesConfig::default)
}

fn get_env_string<E: EnvSource>(env: &E, key: &str) -> Result<Option<String>> {
    Ok(env.get(key))
}

fn get_raw_env_string<E: EnvSource>(env: &E, key: &str) -> Result<Option<String>> {
    Ok(env.get_raw(key))
}

fn get_env_parsed<E: EnvSource, T>(env: &E, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match get_env_string(env, key)? {
        Some(val) => {
            let parsed = val
                .trim()
                .parse::<T>()
                .map_err(|e| anyhow!("Failed to parse {}{}: {}", ENV_PREFIX, key, e))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

fn get_env_usize<E: EnvSource>(env: &E, key: &str) -> Result<Option<usize>> {
    get_env_parsed(env, key)
}

fn get_env_u64<E: EnvSource>(env: &E, key: &str) -> Result<Option<u64>> {
    get_env_parsed(env, key)
}

fn get_env_u32<E: EnvSource>(env: &E, key: &str) -> Result<Option<u32>> {
    get_env_parsed(env, key)
}

fn get_env_u16<E: EnvSource>(env: &E, key: &str) -> Result<Option<u16>> {
    get_env_parsed(env, key)
}

fn get_env_bool<E: EnvSource>(env: &E, key: &str) -> Result<Option<bool>> {
    match get_env_string(env, key)? {
        Some(val) => {
            let parsed = val.parse::<bool>().map_err(|e| {
                anyhow!(
                    "Failed to parse {}{} (expected bool): {}",
                    ENV_PREFIX,
                    key,
                    e
                )
            })?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapEnv(HashMap<String, String>);

    impl MapEnv {
        fn new(pairs: &[(&str, &str)]) -> Self {
            Self(
                pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            )
        }
    }

    impl EnvSource for MapEnv {
        fn get(&self, key: &str) -> Option<String> {
            self.0.get(&format!("{}{}", ENV_PREFIX, key)).cloned()
        }

        fn get_raw(&self, key: &str) -> Option<String> {
            self.0.get(key).cloned()
        }
    }

    #[test]
    fn test_env_overrides_apply() {
        let env = MapEnv::new(&[
            ("STREAM2STORE_SOURCE_NAME", "ticks"),
            ("STREAM2STORE_SOURCE_INITIAL_POSITION", "trim_horizon"),
            ("STREAM2STORE_SINK_MAX_BATCH_SIZE", "10"),
            ("STREAM2STORE_SINK_FAIL_ON_ERROR", "true"),
            ("STREAM2STORE_SINK_OVERWRITE_BY_KEY_FIELDS", "ticker, event_time"),
            ("STREAM2STORE_STORE_BACKEND", "keyspaces"),
            ("STREAM2STORE_STORE_ITEM_PRICE_AS_STRING", "true"),
            ("STREAM2STORE_KEYSPACES_PORT", "9042"),
            ("STREAM2STORE_LOG_FORMAT", "JSON"),
        ]);
        let mut config = RuntimeConfig::default();
        apply_env_overrides(&mut config, &env).unwrap();

        assert_eq!(config.source.name, "ticks");
        assert_eq!(
            config.source.initial_position,
            Some(InitialPosition::TrimHorizon)
        );
        assert_eq!(config.sink.max_batch_size, 10);
        assert!(config.sink.fail_on_error);
        assert_eq!(
            config.sink.overwrite_by_key_fields,
            vec!["ticker".to_string(), "event_time".to_string()]
        );
        assert_eq!(config.store.backend, StoreBackend::Keyspaces);
        assert!(config.store.item_price_as_string);
        assert_eq!(config.store.keyspaces.as_ref().unwrap().port, 9042);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_aws_region_fallback() {
        let env = MapEnv::new(&[("AWS_REGION", "eu-central-1")]);
        let mut config = RuntimeConfig::default();
        apply_env_overrides(&mut config, &env).unwrap();
        assert_eq!(config.source.region, "eu-central-1");

        // An explicit region wins over AWS_REGION
        let mut config = RuntimeConfig::default();
        config.source.region = "us-west-2".to_string();
        apply_env_overrides(&mut config, &env).unwrap();
        assert_eq!(config.source.region, "us-west-2");
    }

    #[test]
    fn test_env_parse_errors() {
        let env = MapEnv::new(&[("STREAM2STORE_SINK_MAX_BATCH_SIZE", "many")]);
        let err = apply_env_overrides(&mut RuntimeConfig::default(), &env).unwrap_err();
        assert!(err.to_string().contains("STREAM2STORE_SINK_MAX_BATCH_SIZE"));

        let env = MapEnv::new(&[("STREAM2STORE_SINK_FAIL_ON_ERROR", "yes")]);
        assert!(apply_env_overrides(&mut RuntimeConfig::default(), &env).is_err());
    }
}
