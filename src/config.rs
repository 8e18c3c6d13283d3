use std::env;
use std::path::PathBuf;

use directories::ProjectDirs;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::error::DriveCatError;

pub static CONFIG: OnceCell<Config> = OnceCell::new();

const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DatabaseConfig {
    /// Cumulative delta changes before an FTS optimize pass is triggered.
    pub optimize_threshold: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            optimize_threshold: 50,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ScannerConfig {
    /// Entries per store transaction.
    pub batch_size: usize,
    /// Entries between progress events.
    pub progress_interval: u64,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        ScannerConfig {
            batch_size: 1000,
            progress_interval: 100,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WatcherConfig {
    /// Quiet period before a burst of change events is flushed.
    pub debounce_secs: u64,
    /// Mount-table poll interval.
    pub poll_secs: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        WatcherConfig {
            debounce_secs: 10,
            poll_secs: 2,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HasherConfig {
    /// Concurrent file reads.
    pub threads: usize,
    /// Files below this size are never fingerprinted.
    pub min_file_size: u64,
}

impl Default for HasherConfig {
    fn default() -> Self {
        HasherConfig {
            threads: 8,
            min_file_size: 5 * 1024 * 1024,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ThumbnailConfig {
    /// On-disk byte budget for the thumbnail directory.
    pub budget_bytes: u64,
    /// Concurrent renders. Decoders are memory-hungry; keep this small.
    pub threads: usize,
    /// Longest edge of a rendered thumbnail, in pixels.
    pub long_edge: u32,
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        ThumbnailConfig {
            budget_bytes: 500 * 1024 * 1024,
            threads: 2,
            long_edge: 256,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SearchConfig {
    pub limit: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        SearchConfig { limit: 100 }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
    pub scanner: ScannerConfig,
    pub watcher: WatcherConfig,
    pub hasher: HasherConfig,
    pub thumbnails: ThumbnailConfig,
    pub search: SearchConfig,
}

impl Config {
    /// Defaults, then `config.toml` in the data directory, then
    /// `DRIVECAT_*` environment variables (e.g. `DRIVECAT_HASHER__THREADS`).
    pub fn load(project_dirs: &ProjectDirs) -> Result<Config, DriveCatError> {
        let config_path = Self::config_path(project_dirs);

        let config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed("DRIVECAT_").split("__"))
            .extract()
            .map_err(|e| DriveCatError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Checks `DRIVECAT_DATA_DIR` first so Docker and test runs can relocate
    /// everything, then falls back to the OS data directory.
    pub fn data_dir(project_dirs: &ProjectDirs) -> PathBuf {
        if let Ok(data_dir) = env::var("DRIVECAT_DATA_DIR") {
            PathBuf::from(data_dir)
        } else {
            project_dirs.data_local_dir().to_path_buf()
        }
    }

    pub fn config_path(project_dirs: &ProjectDirs) -> PathBuf {
        Self::data_dir(project_dirs).join("config.toml")
    }

    fn validate(&self) -> Result<(), DriveCatError> {
        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(DriveCatError::Config(format!(
                "logging.level must be one of {:?}, got '{}'",
                LOG_LEVELS, self.logging.level
            )));
        }
        if self.scanner.batch_size == 0 {
            return Err(DriveCatError::Config(
                "scanner.batch_size must be at least 1".to_string(),
            ));
        }
        if self.hasher.threads == 0 || self.thumbnails.threads == 0 {
            return Err(DriveCatError::Config(
                "worker thread counts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

pub fn get() -> &'static Config {
    CONFIG.get().expect("Config not initialized")
}
