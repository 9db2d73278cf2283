use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::market_data::period::DEFAULT_REQUEST_TIMEOUT;

/// Connection settings. Loaded from an optional TOML file, then `MDX_*` environment
/// variables (nested keys separated by `__`, e.g. `MDX_PROPERTIES__USER`).
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MdxConfig {
    pub feed_address: String,
    /// Used when a period request is made without a deadline policy.
    pub request_timeout_ms: u64,
    pub log_filter: String,
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl Default for MdxConfig {
    fn default() -> Self {
        Self {
            feed_address: "sim:7300".to_string(),
            request_timeout_ms: u64::try_from(DEFAULT_REQUEST_TIMEOUT.as_millis()).unwrap_or(u64::MAX),
            log_filter: "info,mdx_rs=debug".to_string(),
            properties: HashMap::new(),
        }
    }
}

impl MdxConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        dotenvy::dotenv().ok();
        let defaults = MdxConfig::default();
        config::Config::builder()
            .set_default("feed_address", defaults.feed_address)?
            .set_default("request_timeout_ms", defaults.request_timeout_ms as i64)?
            .set_default("log_filter", defaults.log_filter)?
            .add_source(config::File::from(path.as_ref()).required(false))
            .add_source(config::Environment::with_prefix("MDX").prefix_separator("_").separator("__").try_parsing(true))
            .build()?
            .try_deserialize()
    }

    /// `mdx.toml` in the working directory, if present.
    pub fn load_default() -> Result<Self, config::ConfigError> {
        Self::load("mdx.toml")
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
