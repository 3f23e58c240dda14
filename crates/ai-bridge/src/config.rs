use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::engine::policy::RetryPolicy;
use crate::errors::{BridgeError, BridgeResult};

pub const DEFAULT_TIMEOUT_MS: u64 = 600_000;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 1_000;

/// Settings every adapter is constructed with
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Credential used for outbound auth
    #[serde(default)]
    pub api_key: Option<String>,
    /// Override endpoint
    #[serde(default)]
    pub base_url: Option<String>,
    /// Model used when a request does not name one
    #[serde(default)]
    pub model: Option<String>,
    /// Per-attempt timeout
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Retry ceiling for transient failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Unit of the exponential backoff
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: None,
            model: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
        }
    }
}

impl fmt::Debug for AdapterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("timeout_ms", &self.timeout_ms)
            .field("max_retries", &self.max_retries)
            .field("backoff_base_ms", &self.backoff_base_ms)
            .finish()
    }
}

impl AdapterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_api_key<S: Into<String>>(mut self, api_key: S) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_base_url<S: Into<String>>(mut self, base_url: S) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_model<S: Into<String>>(mut self, model: S) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_backoff_base_ms(mut self, backoff_base_ms: u64) -> Self {
        self.backoff_base_ms = backoff_base_ms;
        self
    }

    /// Load `<PREFIX>_API_KEY`, `<PREFIX>_BASE_URL`, `<PREFIX>_MODEL`,
    /// `<PREFIX>_TIMEOUT_MS`, `<PREFIX>_MAX_RETRIES` and `<PREFIX>_BACKOFF_BASE_MS`
    pub fn from_env(prefix: &str) -> BridgeResult<Self> {
        let key = |name: &str| format!("{}_{}", prefix, name);

        let config = Self {
            api_key: get_env(&key("API_KEY"))?,
            base_url: get_env(&key("BASE_URL"))?,
            model: get_env(&key("MODEL"))?,
            timeout_ms: parse_env(&key("TIMEOUT_MS"))?.unwrap_or(DEFAULT_TIMEOUT_MS),
            max_retries: parse_env(&key("MAX_RETRIES"))?.unwrap_or(DEFAULT_MAX_RETRIES),
            backoff_base_ms: parse_env(&key("BACKOFF_BASE_MS"))?
                .unwrap_or(DEFAULT_BACKOFF_BASE_MS),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> BridgeResult<()> {
        if let Some(base_url) = &self.base_url {
            let url = Url::parse(base_url)?;
            if url.scheme() != "http" && url.scheme() != "https" {
                return Err(BridgeError::Config(format!(
                    "base url '{}' must use http or https",
                    base_url
                )));
            }
        }
        if self.timeout_ms == 0 {
            return Err(BridgeError::Config("timeout_ms must be positive".to_string()));
        }
        Ok(())
    }

    /// Base url without a trailing slash, falling back to `default`
    pub fn base_url_or(&self, default: &str) -> String {
        self.base_url
            .as_deref()
            .unwrap_or(default)
            .trim_end_matches('/')
            .to_string()
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new()
            .with_max_retries(self.max_retries)
            .with_backoff_base(Duration::from_millis(self.backoff_base_ms))
            .with_attempt_timeout(Some(self.attempt_timeout()))
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

/// Read an optional environment variable, treating an empty value as unset
pub fn get_env(key: &str) -> BridgeResult<Option<String>> {
    match env::var(key) {
        Ok(value) if value.is_empty() => Ok(None),
        Ok(value) => Ok(Some(value)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(BridgeError::Config(format!("{}: {}", key, e))),
    }
}

fn parse_env<T: FromStr>(key: &str) -> BridgeResult<Option<T>> {
    match get_env(key)? {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| BridgeError::Config(format!("{} has an invalid value: {}", key, raw))),
        None => Ok(None),
    }
}
