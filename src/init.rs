// Initialization utilities
//
// Logging setup and construction of the store backend, record stages and
// writer settings from RuntimeConfig

use crate::pipeline::{SlotSettings, Stages};
use anyhow::{Context, Result};
use std::sync::Arc;
use stream2store_batch::BatchConfig;
use stream2store_config::{LogFormat, LoggingConfig, RuntimeConfig, StoreBackend, StoreConfig};
use stream2store_core::{
    AcceptAll, ItemMapper, PriceThresholdFilter, RecordFilter, RecordMapper, RowMapper,
};
use stream2store_writer::keyspaces::parse_consistency;
use stream2store_writer::{
    DynamoDbBackend, DynamoDbSettings, KeyspacesBackend, KeyspacesSettings, MemoryBackend,
    RetryPolicy, SinkSettings, WriteBackend,
};
use tracing::info;

/// Consistency used by the wide-column store when none is configured.
pub const DEFAULT_CONSISTENCY: &str = "LOCAL_QUORUM";

/// Initialize tracing/logging from the logging config
pub fn init_tracing(config: &LoggingConfig) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let env_filter = EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);

    // Try to set the global subscriber; ignore error if already set (idempotent)
    let _ = match config.format {
        LogFormat::Json => {
            tracing::subscriber::set_global_default(registry.with(fmt::layer().json()))
        }
        LogFormat::Text => tracing::subscriber::set_global_default(registry.with(fmt::layer())),
    };
}

/// Connect the configured store backend; one instance is shared by all slots.
pub async fn build_backend(config: &RuntimeConfig) -> Result<Arc<dyn WriteBackend>> {
    info!(
        backend = %config.store.backend,
        target = %config.sink.target_store_name,
        "Initializing store backend"
    );

    match config.store.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryBackend::new())),
        StoreBackend::DynamoDb => {
            let settings = DynamoDbSettings {
                table: config.sink.target_store_name.clone(),
                region: config.source.region.clone(),
                endpoint: config
                    .store
                    .dynamodb
                    .as_ref()
                    .and_then(|d| d.endpoint.clone()),
            };
            Ok(Arc::new(DynamoDbBackend::connect(settings).await))
        }
        StoreBackend::Keyspaces => {
            let level = config
                .store
                .consistency_level
                .as_deref()
                .unwrap_or(DEFAULT_CONSISTENCY);
            let consistency = parse_consistency(level).context("Invalid consistency level")?;

            let keyspaces = config.keyspaces();
            let settings = KeyspacesSettings {
                contact_points: keyspaces.contact_points,
                port: keyspaces.port,
                local_datacenter: keyspaces
                    .local_datacenter
                    .unwrap_or_else(|| config.source.region.clone()),
                keyspace: keyspaces.keyspace,
                table: config.sink.target_store_name.clone(),
                consistency,
                username: keyspaces.username,
                password: keyspaces.password,
            };
            let backend = KeyspacesBackend::connect(settings)
                .await
                .context("Failed to connect to the wide-column store")?;
            Ok(Arc::new(backend))
        }
    }
}

/// Filter stage: price threshold, or pass-through when disabled.
pub fn record_filter(config: &RuntimeConfig) -> Arc<dyn RecordFilter> {
    if config.filter.enabled {
        Arc::new(PriceThresholdFilter::new(config.filter.price_threshold))
    } else {
        Arc::new(AcceptAll)
    }
}

/// Mapper stage matching the backend's record layout.
pub fn record_mapper(store: &StoreConfig) -> Arc<dyn RecordMapper> {
    match store.backend {
        StoreBackend::Keyspaces => Arc::new(RowMapper),
        StoreBackend::DynamoDb | StoreBackend::Memory => Arc::new(ItemMapper {
            price_as_string: store.item_price_as_string,
        }),
    }
}

pub fn stages(config: &RuntimeConfig) -> Stages {
    Stages {
        filter: record_filter(config),
        mapper: record_mapper(&config.store),
    }
}

pub fn sink_settings(config: &RuntimeConfig) -> SinkSettings {
    let sink = &config.sink;
    SinkSettings {
        batch: BatchConfig {
            max_batch_size: sink.max_batch_size,
            max_buffered_requests: sink.max_buffered_requests,
            max_time_in_buffer: sink.max_time_in_buffer(),
            overwrite_by_key_fields: sink.overwrite_by_key_fields.clone(),
        },
        max_in_flight_requests: sink.max_in_flight_requests,
        fail_on_error: sink.fail_on_error,
        retry: retry_policy(config),
    }
}

pub fn retry_policy(config: &RuntimeConfig) -> RetryPolicy {
    let retry = &config.sink.retry;
    RetryPolicy {
        max_attempts: retry.max_attempts,
        initial_backoff: retry.initial_backoff(),
        max_backoff: retry.max_backoff(),
    }
}

pub fn slot_settings(config: &RuntimeConfig, slot: usize) -> SlotSettings {
    SlotSettings {
        slot,
        checkpoint_interval: config.sink.checkpoint_interval(),
        drain_timeout: config.sink.drain_timeout(),
        shutdown_grace: config.sink.shutdown_grace(),
        poll_interval: config.source.poll_interval(),
    }
}
