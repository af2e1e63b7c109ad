// Configuration source loading.
//
// Priority order (highest first):
// 1. Environment variables (STREAM2STORE_* prefix)
// 2. Application property groups (explicit path or STREAM2STORE_PROPERTIES_FILE)
// 3. Config file: explicit path, STREAM2STORE_CONFIG, STREAM2STORE_CONFIG_CONTENT,
//    or ./stream2store.toml
// 4. Built-in defaults

use crate::env_overrides::{self, EnvSource, ENV_PREFIX};
use crate::properties;
use crate::*;
use anyhow::{Context, Result};
use std::env;
use std::path::Path;
use tracing::debug;

pub fn load_layers(options: &LoadOptions) -> Result<RuntimeConfig> {
    let mut config = RuntimeConfig::default();

    let file_config = match &options.config_path {
        Some(path) => Some(load_from_file_path(path)?),
        None => load_from_default_locations()?,
    };
    if let Some(file_config) = file_config {
        config.merge(file_config);
    }

    let properties_path = options
        .properties_path
        .clone()
        .or_else(|| env::var(format!("{}PROPERTIES_FILE", ENV_PREFIX)).ok().map(Into::into));
    if let Some(path) = properties_path {
        let groups = properties::read_property_groups(&path)?;
        properties::apply_property_groups(&mut config, &groups)
            .with_context(|| format!("Invalid application properties in {}", path.display()))?;
    }

    env_overrides::apply_env_overrides(&mut config, &StdEnvSource)?;
    Ok(config)
}

fn load_from_default_locations() -> Result<Option<RuntimeConfig>> {
    if let Ok(path) = env::var("STREAM2STORE_CONFIG") {
        return load_from_file_path(&path).map(Some);
    }

    if let Ok(content) = env::var("STREAM2STORE_CONFIG_CONTENT") {
        let config: RuntimeConfig = toml::from_str(&content)
            .context("Failed to parse inline config from STREAM2STORE_CONFIG_CONTENT")?;
        return Ok(Some(config));
    }

    let default_path = Path::new("./stream2store.toml");
    if default_path.exists() {
        return load_from_file_path(default_path).map(Some);
    }

    Ok(None)
}

/// Parse a TOML config file without applying any other layer.
pub fn load_from_file_path(path: impl AsRef<Path>) -> Result<RuntimeConfig> {
    let path = path.as_ref();
    debug!(path = %path.display(), "Loading config file");
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

struct StdEnvSource;

impl EnvSource for StdEnvSource {
    fn get(&self, key: &str) -> Option<String> {
        env::var(format!("{}{}", ENV_PREFIX, key)).ok()
    }

    fn get_raw(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_from_file_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [source]
            name = "stock-stream"
            region = "us-east-1"
            initial_position = "LATEST"

            [sink]
            target_store_name = "stock_prices"
            fail_on_error = true

            [logging]
            format = "json"
            "#
        )
        .unwrap();

        let config = load_from_file_path(file.path()).unwrap();
        assert_eq!(config.source.name, "stock-stream");
        assert!(config.sink.fail_on_error);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_missing_file() {
        let err = load_from_file_path("/nonexistent/stream2store.toml").unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_load_rejects_malformed_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[sink]\nmax_batch_size = \"lots\"").unwrap();
        let err = load_from_file_path(file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn test_properties_layer_over_file() {
        let mut toml_file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            toml_file,
            "[source]\nname = \"from-file\"\nregion = \"us-east-1\"\n"
        )
        .unwrap();
        let mut props = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            props,
            r#"[{{"PropertyGroupId": "BlueprintMetadata",
                 "PropertyMap": {{"StreamName": "from-properties", "StreamInitialPosition": "LATEST", "DDBTableName": "prices"}}}}]"#
        )
        .unwrap();

        let config = load_layers(&LoadOptions {
            config_path: Some(toml_file.path().to_path_buf()),
            properties_path: Some(props.path().to_path_buf()),
        })
        .unwrap();
        assert_eq!(config.source.name, "from-properties");
        assert_eq!(config.source.region, "us-east-1");
        assert_eq!(config.sink.target_store_name, "prices");
    }
}
