use std::path::PathBuf;

use harvest_core::AppError;

pub const DEFAULT_DATA_ROOT: &str = "data";

/// Configuration for the filesystem store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub data_root: PathBuf,
}

impl StoreConfig {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
        }
    }

    /// Read configuration from environment variables.
    ///
    /// - `HARVEST_DATA_ROOT` (optional, defaults to `data`)
    pub fn from_env() -> Result<Self, AppError> {
        match std::env::var("HARVEST_DATA_ROOT") {
            Err(_) => Ok(Self::new(DEFAULT_DATA_ROOT)),
            Ok(raw) if raw.trim().is_empty() => Err(AppError::ConfigError(
                "HARVEST_DATA_ROOT is set but empty".into(),
            )),
            Ok(raw) => Ok(Self::new(raw.trim())),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::new(DEFAULT_DATA_ROOT)
    }
}
