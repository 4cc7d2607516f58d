//! Configuration for schemacache.
//!
//! Layered with figment: built-in defaults, then `.schemacache.toml` in the
//! given root directory, then `SCHEMACACHE_*` environment variables.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::{CacheSettings, CACHE_MAX_AGE};
use crate::store::DEFAULT_STORE_NAME;
use crate::writer::DEFAULT_QUEUE_CAPACITY;

/// Config file name looked up in the root directory
pub const CONFIG_FILE: &str = ".schemacache.toml";

/// schemacache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    /// Seconds before a cached snapshot is refreshed (default: 600).
    #[serde(default = "default_max_age_secs")]
    pub cache_max_age_secs: u64,

    /// Reflection threads; 0 means twice the available parallelism.
    #[serde(default)]
    pub worker_threads: usize,

    /// Bound on queued store writes (default: 256).
    #[serde(default = "default_queue_capacity")]
    pub write_queue_capacity: usize,

    /// Store file location (default: `<cache dir>/schemacache/metadata.db`).
    #[serde(default)]
    pub store_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_max_age_secs: default_max_age_secs(),
            worker_threads: 0,
            write_queue_capacity: default_queue_capacity(),
            store_path: None,
        }
    }
}

fn default_max_age_secs() -> u64 {
    CACHE_MAX_AGE.as_secs()
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

impl Config {
    /// Load configuration for the given root directory.
    ///
    /// Returns defaults if there is no config file. Invalid values are
    /// reported and the defaults are used instead.
    pub fn load(root: &Path) -> Self {
        let config_path = root.join(CONFIG_FILE);

        let figment = Figment::from(Serialized::defaults(Config::default()));
        let figment = if config_path.exists() {
            figment.merge(Toml::file(&config_path))
        } else {
            figment
        };
        let figment = figment.merge(Env::prefixed("SCHEMACACHE_"));

        match figment.extract() {
            Ok(config) => {
                if config_path.exists() {
                    tracing::info!("Loaded config from {:?}", config_path);
                }
                config
            }
            Err(e) => {
                tracing::warn!("Config error: {}", e);
                Self::default()
            }
        }
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.cache_max_age_secs)
    }

    pub fn cache_settings(&self) -> CacheSettings {
        CacheSettings {
            max_age: self.max_age(),
            write_queue_capacity: self.write_queue_capacity,
        }
    }

    /// The configured store path, or the default under the user cache directory.
    pub fn resolve_store_path(&self) -> PathBuf {
        match &self.store_path {
            Some(path) => path.clone(),
            None => dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("schemacache")
                .join(DEFAULT_STORE_NAME),
        }
    }
}
