use std::path::PathBuf;

use anyhow::{Context, Result};
use config::{Config, ConfigError, Environment, File};
use lumen_chat::{CacheConfig, FetcherConfig, LiveFeedConfig};
use serde::Deserialize;

/// Runtime settings, read from `lumen.toml` (optional) and `LUMEN__*`
/// environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Room to tail when none is given on the command line.
    #[serde(default)]
    pub room: Option<String>,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_live_url")]
    pub live_url: String,
    /// Bearer token for both the HTTP API and the live feed.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

impl Settings {
    pub fn load() -> Result<Self> {
        let builder = Config::builder()
            .add_source(File::with_name("lumen").required(false))
            .add_source(Environment::with_prefix("LUMEN").separator("__"));

        let config = builder
            .build()
            .map_err(map_config_error)
            .context("failed to build configuration")?;

        config
            .try_deserialize::<Settings>()
            .map_err(map_config_error)
            .context("failed to deserialize configuration")
    }

    pub fn fetcher_config(&self) -> FetcherConfig {
        FetcherConfig {
            base_url: self.api_url.clone(),
            page_size: self.page_size,
            auth_token: self.token.clone(),
            ..FetcherConfig::default()
        }
    }

    pub fn live_config(&self) -> LiveFeedConfig {
        LiveFeedConfig {
            url: self.live_url.clone(),
            auth_token: self.token.clone(),
            ..LiveFeedConfig::default()
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            path: self.cache_dir.clone(),
            ..CacheConfig::default()
        }
    }
}

fn map_config_error(err: ConfigError) -> anyhow::Error {
    match err {
        ConfigError::NotFound(_) => err.into(),
        _ => anyhow::anyhow!(err),
    }
}

fn default_api_url() -> String {
    FetcherConfig::default().base_url
}

fn default_live_url() -> String {
    LiveFeedConfig::default().url
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./var/lumen-cache")
}

fn default_page_size() -> u32 {
    50
}
