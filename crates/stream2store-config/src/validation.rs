// Configuration validation
//
// Collects every missing or invalid field so operators can fix them in one pass.

use crate::*;
use thiserror::Error;
use tracing::warn;

/// BatchWriteItem accepts at most 25 put requests per call.
pub const DYNAMODB_MAX_BATCH_SIZE: usize = 25;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {}", .issues.join("; "))]
    Invalid { issues: Vec<String> },
}

impl ConfigError {
    pub fn issues(&self) -> &[String] {
        match self {
            ConfigError::Invalid { issues } => issues,
        }
    }
}

pub fn validate_config(config: &RuntimeConfig) -> Result<(), ConfigError> {
    let mut issues = Vec::new();

    validate_source_config(&config.source, &mut issues);
    validate_sink_config(&config.sink, &mut issues);
    validate_store_config(config, &mut issues);

    if !config.filter.price_threshold.is_finite() {
        issues.push("filter.price_threshold must be a finite number".to_string());
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Invalid { issues })
    }
}

fn validate_source_config(config: &SourceConfig, issues: &mut Vec<String>) {
    if config.name.is_empty() {
        issues.push("source.name is required".to_string());
    }
    if config.region.is_empty() {
        issues.push("source.region is required".to_string());
    }
    match config.initial_position {
        None => issues.push("source.initial_position is required".to_string()),
        Some(InitialPosition::AtTimestamp) => match config.initial_timestamp.as_deref() {
            None | Some("") => issues.push(
                "source.initial_timestamp is required when initial_position is AT_TIMESTAMP"
                    .to_string(),
            ),
            Some(ts) => {
                if chrono::DateTime::parse_from_rfc3339(ts).is_err() {
                    issues.push(format!(
                        "source.initial_timestamp '{}' is not an RFC 3339 timestamp",
                        ts
                    ));
                }
            }
        },
        Some(_) => {}
    }
    if config.poll_interval_ms == 0 {
        issues.push("source.poll_interval_ms must be greater than 0".to_string());
    }
    if config.max_records_per_poll <= 0 {
        issues.push("source.max_records_per_poll must be greater than 0".to_string());
    }
}

fn validate_sink_config(config: &SinkConfig, issues: &mut Vec<String>) {
    if config.target_store_name.is_empty() {
        issues.push("sink.target_store_name is required".to_string());
    }

    for (name, value) in [
        ("sink.parallelism", config.parallelism as u64),
        ("sink.max_batch_size", config.max_batch_size as u64),
        (
            "sink.max_in_flight_requests",
            config.max_in_flight_requests as u64,
        ),
        (
            "sink.max_buffered_requests",
            config.max_buffered_requests as u64,
        ),
        ("sink.max_time_in_buffer_ms", config.max_time_in_buffer_ms),
        ("sink.checkpoint_interval_ms", config.checkpoint_interval_ms),
        ("sink.drain_timeout_ms", config.drain_timeout_ms),
        ("sink.retry.max_attempts", config.retry.max_attempts as u64),
        ("sink.retry.initial_backoff_ms", config.retry.initial_backoff_ms),
        ("sink.retry.max_backoff_ms", config.retry.max_backoff_ms),
    ] {
        if value == 0 {
            issues.push(format!("{} must be greater than 0", name));
        }
    }

    if config.max_buffered_requests < config.max_batch_size {
        issues.push(format!(
            "sink.max_buffered_requests ({}) must be at least sink.max_batch_size ({})",
            config.max_buffered_requests, config.max_batch_size
        ));
    }

    if config.retry.initial_backoff_ms > config.retry.max_backoff_ms {
        issues.push(format!(
            "sink.retry.initial_backoff_ms ({}) must not exceed sink.retry.max_backoff_ms ({})",
            config.retry.initial_backoff_ms, config.retry.max_backoff_ms
        ));
    }

    if config.overwrite_by_key_fields.iter().any(|f| f.is_empty()) {
        issues.push("sink.overwrite_by_key_fields must not contain empty names".to_string());
    }

    // Warn about settings that are valid but likely to hurt
    if config.max_buffered_requests > 1_000_000 {
        warn!(
            max_buffered_requests = config.max_buffered_requests,
            "sink.max_buffered_requests is very large; may cause memory issues"
        );
    }
    if config.parallelism > 64 {
        warn!(
            parallelism = config.parallelism,
            "sink.parallelism is very large; each slot opens its own writer"
        );
    }
}

fn validate_store_config(config: &RuntimeConfig, issues: &mut Vec<String>) {
    let store = &config.store;

    if store.backend != StoreBackend::Keyspaces && store.consistency_level.is_some() {
        warn!(
            backend = %store.backend,
            "store.consistency_level is only used by the keyspaces backend; ignoring"
        );
    }

    match store.backend {
        StoreBackend::DynamoDb => {
            if config.sink.max_batch_size > DYNAMODB_MAX_BATCH_SIZE {
                issues.push(format!(
                    "sink.max_batch_size ({}) exceeds the dynamodb limit of {}",
                    config.sink.max_batch_size, DYNAMODB_MAX_BATCH_SIZE
                ));
            }
            if let Some(endpoint) = store.dynamodb.as_ref().and_then(|d| d.endpoint.as_ref()) {
                if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                    issues.push(format!(
                        "store.dynamodb.endpoint '{}' must start with http:// or https://",
                        endpoint
                    ));
                }
            }
        }
        StoreBackend::Keyspaces => {
            let ks = config.keyspaces();
            if ks.keyspace.is_empty() {
                issues.push("store.keyspaces.keyspace must not be empty".to_string());
            }
            if ks.port == 0 {
                issues.push("store.keyspaces.port must be greater than 0".to_string());
            }
            if ks.username.is_some() != ks.password.is_some() {
                issues.push(
                    "store.keyspaces.username and store.keyspaces.password must be set together"
                        .to_string(),
                );
            }
            if let Some(level) = store.consistency_level.as_deref() {
                if !is_known_consistency(level) {
                    issues.push(format!(
                        "store.consistency_level '{}' is not a known consistency level",
                        level
                    ));
                }
            }
        }
        StoreBackend::Memory => {}
    }
}

pub(crate) fn is_known_consistency(level: &str) -> bool {
    matches!(
        level.to_uppercase().as_str(),
        "ANY"
            | "ONE"
            | "TWO"
            | "THREE"
            | "QUORUM"
            | "ALL"
            | "LOCAL_QUORUM"
            | "EACH_QUORUM"
            | "LOCAL_ONE"
    )
}
