//! Layered controller configuration: embedded defaults, then an optional TOML
//! file, then `CONVEYOR_`-prefixed environment variables (`__` separates
//! nesting, e.g. `CONVEYOR_GENERAL__LOG_LEVEL`).

use crate::logstore;
use anyhow::{Context, Result};
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use rust_embed::RustEmbed;
use serde::Deserialize;

const DEFAULT_CONFIG_PATH: &str = "/etc/conveyor/conveyor.toml";

#[derive(RustEmbed)]
#[folder = "src/conf/"]
#[include = "*.toml"]
struct EmbeddedConfigFS;

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Config {
    pub general: General,
    pub controller: Controller,
    pub registry: Registry,
    pub log_store: LogStore,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct General {
    /// Wires the in-memory reference backends instead of real adapters.
    pub dev_mode: bool,
    pub log_level: String,
    /// Master switch for cron triggering on this cluster.
    pub pipelines_enabled: bool,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Controller {
    /// Namespace holding cluster-level pipeline material (the CA secret).
    pub system_namespace: String,
    /// All intervals are in seconds.
    pub state_sync_interval: u64,
    pub cron_sync_interval: u64,
    pub log_sync_interval: u64,
    pub cert_sync_interval: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Registry {
    /// How often to re-check for quiescence while a rotation waits, seconds.
    pub quiescence_poll_interval: u64,
    /// How long a rotation may wait for builds to drain before giving up,
    /// seconds.
    pub quiescence_budget: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct LogStore {
    pub backend: logstore::Backend,
    pub path: Option<String>,
}

/// Parse configuration, layering the embedded defaults, the config file (the
/// default path is not required to exist) and the environment.
pub fn parse(path_override: &Option<String>) -> Result<Config> {
    let default_raw = EmbeddedConfigFS::get("default_config.toml")
        .context("embedded default config is missing from the build")?;
    let default_config = std::str::from_utf8(&default_raw.data)
        .context("embedded default config is not valid UTF-8")?;

    let path = path_override
        .clone()
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    let config = Figment::new()
        .merge(Toml::string(default_config))
        .merge(Toml::file(path))
        .merge(Env::prefixed("CONVEYOR_").split("__"))
        .extract::<Config>()
        .context("could not parse controller configuration")?;
    Ok(config)
}
