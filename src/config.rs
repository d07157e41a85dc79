//! Application configuration.
//!
//! Loaded from a TOML file, then overridden from the environment (a `.env`
//! file is honored through `dotenvy`):
//!
//! | Variable | Overrides |
//! |----------|-----------|
//! | `SOURCESYNC_POOL_SIZE` | `server.sync_tasks_pool_size` |
//! | `SOURCESYNC_SOURCES_RELOAD_SEC` | `server.sources_reload_sec` |
//! | `SOURCESYNC_POOL_MONITOR_SEC` | `server.pool_monitor_interval_sec` |
//! | `SOURCESYNC_SOURCES_JSON` | `sources_json` |
//! | `SOURCESYNC_META_DB` | `meta.sqlite_path` |

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::sources::{ConfigError, ServiceSettings, SourceConfigs, SourcesProvider};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub sync_tasks_pool_size: usize,
    pub sources_reload_sec: u64,
    pub pool_monitor_interval_sec: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let defaults = ServiceSettings::default();
        Self {
            sync_tasks_pool_size: defaults.pool_size,
            sources_reload_sec: defaults.reload_interval.as_secs(),
            pool_monitor_interval_sec: defaults.monitor_interval.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaConfig {
    /// SQLite file for collection status and logs; in-memory when unset.
    pub sqlite_path: Option<PathBuf>,
}

/// The `sources` key: either a table of declarations or a provider string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SourcesSetting {
    Static(SourceConfigs),
    Provider(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub meta: MetaConfig,
    pub sources: Option<SourcesSetting>,
    pub sources_json: Option<String>,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let mut config = Self::from_toml_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| dotenvy::var(key).ok())
    }

    /// Apply overrides from `lookup`, keyed by environment variable name.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("SOURCESYNC_POOL_SIZE") {
            self.server.sync_tasks_pool_size = val
                .trim()
                .parse()
                .with_context(|| format!("SOURCESYNC_POOL_SIZE={val}"))?;
        }
        if let Some(val) = lookup("SOURCESYNC_SOURCES_RELOAD_SEC") {
            self.server.sources_reload_sec = val
                .trim()
                .parse()
                .with_context(|| format!("SOURCESYNC_SOURCES_RELOAD_SEC={val}"))?;
        }
        if let Some(val) = lookup("SOURCESYNC_POOL_MONITOR_SEC") {
            self.server.pool_monitor_interval_sec = val
                .trim()
                .parse()
                .with_context(|| format!("SOURCESYNC_POOL_MONITOR_SEC={val}"))?;
        }
        if let Some(val) = lookup("SOURCESYNC_SOURCES_JSON") {
            self.sources_json = Some(val);
        }
        if let Some(val) = lookup("SOURCESYNC_META_DB")
            && !val.is_empty()
        {
            self.meta.sqlite_path = Some(PathBuf::from(val));
        }
        Ok(())
    }

    pub fn service_settings(&self) -> ServiceSettings {
        ServiceSettings {
            pool_size: self.server.sync_tasks_pool_size,
            reload_interval: Duration::from_secs(self.server.sources_reload_sec),
            monitor_interval: Duration::from_secs(self.server.pool_monitor_interval_sec),
        }
    }

    /// Resolve the single active sources mode, or `None` when no sources
    /// are configured.
    pub fn sources_provider(&self) -> Result<Option<SourcesProvider>, ConfigError> {
        let inline = self
            .sources_json
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty() && *s != "{}");

        let provider = match (&self.sources, inline) {
            (Some(_), Some(_)) => {
                return Err(ConfigError::Conflict(
                    "both `sources` and `sources_json` are set".to_string(),
                ));
            }
            (None, None) => None,
            (None, Some(json)) => Some(SourcesProvider::InlineJson(json.to_string())),
            (Some(SourcesSetting::Static(configs)), None) => {
                Some(SourcesProvider::Static(configs.clone()))
            }
            (Some(SourcesSetting::Provider(value)), None) => Some(SourcesProvider::parse(value)?),
        };

        if provider.is_some() && self.server.sync_tasks_pool_size == 0 {
            return Err(ConfigError::Invalid(
                "server.sync_tasks_pool_size must be positive when sources are configured"
                    .to_string(),
            ));
        }
        Ok(provider)
    }
}
