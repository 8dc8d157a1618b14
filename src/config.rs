//! Layered configuration using Figment.
//!
//! Settings are resolved in this order, later sources winning:
//! 1. Built-in defaults
//! 2. An optional TOML file (e.g. `cytostore.toml`)
//! 3. Environment variables prefixed with `CYTOSTORE_`, nested keys split on `__`
//!
//! # Example
//! ```no_run
//! use cytostore::config::Settings;
//!
//! let settings = Settings::load_from("cytostore.toml")?;
//! println!("chunk size: {}", settings.store.chunk_size);
//! # Ok::<(), cytostore::StoreError>(())
//! ```
//!
//! `CYTOSTORE_SQLITE__SYNCHRONOUS=full` switches the database to full sync.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::StoreResult;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Array layout and resolver settings
    #[serde(default)]
    pub store: StoreSettings,
    /// Relational database settings
    #[serde(default)]
    pub sqlite: SqliteSettings,
    /// Logging settings
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Array layout and resolver settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    /// Edge length of the square spatial chunks
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// Upper bound on pyramid levels, including full resolution
    #[serde(default = "default_max_pyramid_levels")]
    pub max_pyramid_levels: u8,
    /// Smallest spatial edge a downsampled level may have
    #[serde(default = "default_min_level_size")]
    pub min_level_size: u64,
    /// Capacity of the per-store name to id cache
    #[serde(default = "default_resolver_cache_capacity")]
    pub resolver_cache_capacity: usize,
    /// Pixel size used for scale transforms when a FOV does not declare one
    #[serde(default = "default_pixel_size_um")]
    pub default_pixel_size_um: f64,
}

/// SQLite sync-to-disk policy on commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Sync at WAL checkpoints only
    #[default]
    Normal,
    /// Sync on every commit
    Full,
}

impl SyncMode {
    /// Pragma value for `PRAGMA synchronous`.
    pub const fn pragma_value(self) -> &'static str {
        match self {
            SyncMode::Normal => "NORMAL",
            SyncMode::Full => "FULL",
        }
    }
}

/// Relational database settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteSettings {
    /// How long a locked database is retried before failing
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// Commit durability policy
    #[serde(default)]
    pub synchronous: SyncMode,
    /// Page cache size in KiB
    #[serde(default = "default_cache_size_kib")]
    pub cache_size_kib: u32,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_chunk_size() -> u64 {
    256
}

fn default_max_pyramid_levels() -> u8 {
    4
}

fn default_min_level_size() -> u64 {
    64
}

fn default_resolver_cache_capacity() -> usize {
    1024
}

fn default_pixel_size_um() -> f64 {
    1.0
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_cache_size_kib() -> u32 {
    65536
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_pyramid_levels: default_max_pyramid_levels(),
            min_level_size: default_min_level_size(),
            resolver_cache_capacity: default_resolver_cache_capacity(),
            default_pixel_size_um: default_pixel_size_um(),
        }
    }
}

impl Default for SqliteSettings {
    fn default() -> Self {
        Self {
            busy_timeout_ms: default_busy_timeout_ms(),
            synchronous: SyncMode::default(),
            cache_size_kib: default_cache_size_kib(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file (optional) and the environment.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let settings: Settings = Self::figment()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("CYTOSTORE_").split("__"))
            .extract()?;
        Ok(settings)
    }

    /// Load settings from the environment only.
    pub fn from_env() -> StoreResult<Self> {
        let settings: Settings = Self::figment()
            .merge(Env::prefixed("CYTOSTORE_").split("__"))
            .extract()?;
        Ok(settings)
    }

    fn figment() -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
    }

    /// Validate settings after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return Err(format!(
                "Invalid log format '{}'. Must be one of: {}",
                self.logging.format,
                valid_formats.join(", ")
            ));
        }

        if self.store.chunk_size == 0 {
            return Err("chunk_size must be greater than 0".to_string());
        }
        if self.store.max_pyramid_levels == 0 {
            return Err("max_pyramid_levels must be at least 1".to_string());
        }
        if self.store.resolver_cache_capacity == 0 {
            return Err("resolver_cache_capacity must be greater than 0".to_string());
        }
        if !(self.store.default_pixel_size_um > 0.0) {
            return Err(format!(
                "default_pixel_size_um must be positive, got {}",
                self.store.default_pixel_size_um
            ));
        }

        Ok(())
    }
}
