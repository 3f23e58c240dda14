//! Layered settings: an optional TOML file overridden by `BRIDGE_` environment
//! variables, e.g. `BRIDGE_PROVIDERS__DIRECT__TYPE=openai`.
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::adapters::factory::ProviderKind;
use crate::adapters::utils::ImageFormat;
use crate::config::{
    AdapterConfig, DEFAULT_BACKOFF_BASE_MS, DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT_MS,
};
use crate::errors::{BridgeError, BridgeResult};

pub const ENV_PREFIX: &str = "BRIDGE";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct EngineSettings {
    /// Bound on the total wall time of one invocation, retries included
    #[serde(default)]
    pub invocation_timeout_ms: Option<u64>,
}

impl EngineSettings {
    pub fn invocation_timeout(&self) -> Option<Duration> {
        self.invocation_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum ProviderSettings {
    OpenAi {
        api_key: String,
        #[serde(default)]
        base_url: Option<String>,
        #[serde(default)]
        model: Option<String>,
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
        #[serde(default = "default_max_retries")]
        max_retries: u32,
        #[serde(default = "default_backoff_base_ms")]
        backoff_base_ms: u64,
    },
    Databricks {
        host: String,
        token: String,
        /// Serving endpoint used when a request does not name one
        #[serde(default)]
        model: Option<String>,
        #[serde(default = "default_image_format")]
        image_format: ImageFormat,
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
        #[serde(default = "default_max_retries")]
        max_retries: u32,
        #[serde(default = "default_backoff_base_ms")]
        backoff_base_ms: u64,
    },
}

impl ProviderSettings {
    pub fn provider_kind(&self) -> ProviderKind {
        match self {
            ProviderSettings::OpenAi { .. } => ProviderKind::OpenAi,
            ProviderSettings::Databricks { .. } => ProviderKind::Databricks,
        }
    }

    pub fn image_format(&self) -> ImageFormat {
        match self {
            ProviderSettings::OpenAi { .. } => ImageFormat::OpenAi,
            ProviderSettings::Databricks { image_format, .. } => *image_format,
        }
    }

    /// Convert to the config the adapter is constructed with
    pub fn into_config(self) -> AdapterConfig {
        match self {
            ProviderSettings::OpenAi {
                api_key,
                base_url,
                model,
                timeout_ms,
                max_retries,
                backoff_base_ms,
            } => AdapterConfig {
                api_key: Some(api_key),
                base_url,
                model,
                timeout_ms,
                max_retries,
                backoff_base_ms,
            },
            ProviderSettings::Databricks {
                host,
                token,
                model,
                timeout_ms,
                max_retries,
                backoff_base_ms,
                ..
            } => AdapterConfig {
                api_key: Some(token),
                base_url: Some(host),
                model,
                timeout_ms,
                max_retries,
                backoff_base_ms,
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct BridgeSettings {
    #[serde(default)]
    pub engine: EngineSettings,
    /// Provider id to provider settings
    #[serde(default)]
    pub providers: HashMap<String, ProviderSettings>,
}

impl BridgeSettings {
    /// Load from the environment only
    pub fn new() -> BridgeResult<Self> {
        Self::load(None)
    }

    /// Load from an optional settings file, then layer the environment on top
    pub fn load(path: Option<&Path>) -> BridgeResult<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        let config = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(|err| {
            tracing::debug!("Configuration error: {:?}", &err);
            let message = err.to_string();
            match message.split_once("missing field `") {
                Some((_, rest)) => {
                    let field = rest.split('`').next().unwrap_or_default();
                    BridgeError::Config(format!(
                        "missing setting `{}`, set it in the settings file or through a {}_ variable",
                        field, ENV_PREFIX
                    ))
                }
                None => BridgeError::from(err),
            }
        })
    }
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_backoff_base_ms() -> u64 {
    DEFAULT_BACKOFF_BASE_MS
}

fn default_image_format() -> ImageFormat {
    ImageFormat::Anthropic
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use std::io::Write;

    fn clean_env() {
        for (key, _) in env::vars() {
            if key.starts_with("BRIDGE_") {
                env::remove_var(&key);
            }
        }
    }

    #[test]
    #[serial]
    fn test_empty_settings() {
        clean_env();
        let settings = BridgeSettings::new().unwrap();
        assert!(settings.providers.is_empty());
        assert_eq!(settings.engine.invocation_timeout(), None);
    }

    #[test]
    #[serial]
    fn test_openai_from_env() {
        clean_env();
        env::set_var("BRIDGE_PROVIDERS__DIRECT__TYPE", "openai");
        env::set_var("BRIDGE_PROVIDERS__DIRECT__API_KEY", "test-key");
        env::set_var("BRIDGE_PROVIDERS__DIRECT__MODEL", "gpt-4o-mini");
        env::set_var("BRIDGE_PROVIDERS__DIRECT__MAX_RETRIES", "5");
        env::set_var("BRIDGE_ENGINE__INVOCATION_TIMEOUT_MS", "30000");

        let settings = BridgeSettings::new().unwrap();
        assert_eq!(
            settings.engine.invocation_timeout(),
            Some(Duration::from_secs(30))
        );

        let provider = settings.providers["direct"].clone();
        assert_eq!(provider.provider_kind(), ProviderKind::OpenAi);
        let config = provider.into_config();
        assert_eq!(config.api_key.as_deref(), Some("test-key"));
        assert_eq!(config.model.as_deref(), Some("gpt-4o-mini"));
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.timeout_ms, DEFAULT_TIMEOUT_MS);

        clean_env();
    }

    #[test]
    #[serial]
    fn test_file_with_environment_override() {
        clean_env();
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
[engine]
invocation_timeout_ms = 5000

[providers.lakehouse]
type = "databricks"
host = "https://example.cloud.databricks.com"
token = "dapi-file"
model = "databricks-meta-llama"
"#
        )
        .unwrap();

        env::set_var("BRIDGE_PROVIDERS__LAKEHOUSE__TOKEN", "dapi-env");

        let settings = BridgeSettings::load(Some(file.path())).unwrap();
        assert_eq!(settings.engine.invocation_timeout_ms, Some(5000));

        let provider = settings.providers["lakehouse"].clone();
        assert_eq!(provider.image_format(), ImageFormat::Anthropic);
        let config = provider.into_config();
        assert_eq!(config.api_key.as_deref(), Some("dapi-env"));
        assert_eq!(
            config.base_url.as_deref(),
            Some("https://example.cloud.databricks.com")
        );

        clean_env();
    }

    #[test]
    #[serial]
    fn test_missing_field_names_the_setting() {
        clean_env();
        env::set_var("BRIDGE_PROVIDERS__DIRECT__TYPE", "openai");

        let err = BridgeSettings::new().unwrap_err();
        assert!(matches!(&err, BridgeError::Config(msg) if msg.contains("api_key")));

        clean_env();
    }

    #[test]
    #[serial]
    fn test_missing_file_is_an_error() {
        clean_env();
        let result = BridgeSettings::load(Some(Path::new("/nonexistent/bridge.toml")));
        assert!(matches!(result, Err(BridgeError::Config(_))));
    }
}
