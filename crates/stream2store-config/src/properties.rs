//! Application property groups.
//!
//! Managed stream-processing runtimes hand the application a JSON list of
//! property groups. The `BlueprintMetadata` group carries the pipeline's core
//! settings:
//!
//! ```json
//! [{"PropertyGroupId": "BlueprintMetadata",
//!   "PropertyMap": {"StreamName": "stock-stream", "AWSRegion": "us-east-1",
//!                   "StreamInitialPosition": "LATEST", "SinkParallelism": "2",
//!                   "DDBTableName": "stock_prices"}}]
//! ```

use crate::{InitialPosition, RuntimeConfig};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};

pub const BLUEPRINT_GROUP_ID: &str = "BlueprintMetadata";

#[derive(Debug, Clone, Deserialize)]
pub struct PropertyGroup {
    #[serde(rename = "PropertyGroupId")]
    pub group_id: String,
    #[serde(rename = "PropertyMap", default)]
    pub properties: HashMap<String, String>,
}

pub(crate) fn read_property_groups(path: &Path) -> Result<Vec<PropertyGroup>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read application properties: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse application properties: {}", path.display()))
}

/// Map the `BlueprintMetadata` group onto the typed config.
///
/// Missing keys leave the existing values untouched; validation reports any
/// required field that is still unset.
pub fn apply_property_groups(config: &mut RuntimeConfig, groups: &[PropertyGroup]) -> Result<()> {
    let Some(group) = groups.iter().find(|g| g.group_id == BLUEPRINT_GROUP_ID) else {
        warn!(
            group = BLUEPRINT_GROUP_ID,
            "Application properties do not contain the expected property group"
        );
        return Ok(());
    };

    for (key, value) in &group.properties {
        match key.as_str() {
            "StreamName" => config.source.name = value.clone(),
            "AWSRegion" => config.source.region = value.clone(),
            "StreamInitialPosition" => {
                config.source.initial_position = Some(
                    value
                        .parse::<InitialPosition>()
                        .context("Invalid StreamInitialPosition")?,
                );
            }
            "StreamInitialTimestamp" => config.source.initial_timestamp = Some(value.clone()),
            "SinkParallelism" => {
                config.sink.parallelism = value
                    .trim()
                    .parse()
                    .with_context(|| format!("Invalid SinkParallelism: {}", value))?;
            }
            "DDBTableName" | "TargetStoreName" => config.sink.target_store_name = value.clone(),
            other => debug!(key = other, "Ignoring unknown application property"),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn groups(json: &str) -> Vec<PropertyGroup> {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_blueprint_group_maps_onto_config() {
        let groups = groups(
            r#"[
                {"PropertyGroupId": "Other", "PropertyMap": {"StreamName": "wrong"}},
                {"PropertyGroupId": "BlueprintMetadata", "PropertyMap": {
                    "StreamName": "stock-stream",
                    "AWSRegion": "us-west-2",
                    "StreamInitialPosition": "TRIM_HORIZON",
                    "SinkParallelism": "3",
                    "DDBTableName": "stock_prices"
                }}
            ]"#,
        );
        let mut config = RuntimeConfig::default();
        apply_property_groups(&mut config, &groups).unwrap();

        assert_eq!(config.source.name, "stock-stream");
        assert_eq!(config.source.region, "us-west-2");
        assert_eq!(
            config.source.initial_position,
            Some(InitialPosition::TrimHorizon)
        );
        assert_eq!(config.sink.parallelism, 3);
        assert_eq!(config.sink.target_store_name, "stock_prices");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_group_is_not_an_error() {
        let mut config = RuntimeConfig::default();
        apply_property_groups(&mut config, &groups(r#"[]"#)).unwrap();
        assert!(config.source.name.is_empty());
    }

    #[test]
    fn test_invalid_values() {
        let mut config = RuntimeConfig::default();
        let bad_parallelism = groups(
            r#"[{"PropertyGroupId": "BlueprintMetadata", "PropertyMap": {"SinkParallelism": "two"}}]"#,
        );
        assert!(apply_property_groups(&mut config, &bad_parallelism).is_err());

        let bad_position = groups(
            r#"[{"PropertyGroupId": "BlueprintMetadata", "PropertyMap": {"StreamInitialPosition": "EARLIEST"}}]"#,
        );
        assert!(apply_property_groups(&mut config, &bad_position).is_err());
    }
}
