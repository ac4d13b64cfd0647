//! Configuration management for the seed reconciler CLI.
//!
//! Configuration can be set via environment variables:
//! - `SEED_RECONCILER_STORE` - Optional. `memory` or `sqlite`. Defaults to `sqlite`.
//! - `SEED_RECONCILER_DATA_DIR` - Optional. Directory holding the SQLite file.
//!   Defaults to `./.seed-reconciler`.
//! - `SEED_RECONCILER_HOLIDAYS` - Optional. JSON/YAML list of `YYYY-MM-DD` holidays.
//! - `SEED_RECONCILER_DIRECTORY` - Optional. JSON/YAML role directory document.
//! - `SEED_RECONCILER_UNRESOLVED_FAIL_THRESHOLD` - Optional. Unresolved assignees
//!   above this fail a run.
//! - `SEED_RECONCILER_DRY_RUN` - Optional. Default for `generate --dry-run`.
//!
//! The library never reads these; the binary turns them into
//! [`EngineOptions`](crate::engine::EngineOptions).

use crate::calendar::HolidaySet;
use crate::engine::EngineOptions;
use crate::roles::InMemoryRoleDirectory;
use crate::store::StoreType;
use crate::util::env_var_bool;
use std::path::PathBuf;
use thiserror::Error;

pub const ENV_STORE: &str = "SEED_RECONCILER_STORE";
pub const ENV_DATA_DIR: &str = "SEED_RECONCILER_DATA_DIR";
pub const ENV_HOLIDAYS: &str = "SEED_RECONCILER_HOLIDAYS";
pub const ENV_DIRECTORY: &str = "SEED_RECONCILER_DIRECTORY";
pub const ENV_UNRESOLVED_FAIL_THRESHOLD: &str = "SEED_RECONCILER_UNRESOLVED_FAIL_THRESHOLD";
pub const ENV_DRY_RUN: &str = "SEED_RECONCILER_DRY_RUN";

const DEFAULT_DATA_DIR: &str = ".seed-reconciler";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Storage backend
    pub store_type: StoreType,

    /// Directory for persistent state
    pub data_dir: PathBuf,

    /// Holiday file for business-day arithmetic
    pub holidays_path: Option<PathBuf>,

    /// Role directory document
    pub directory_path: Option<PathBuf>,

    pub unresolved_fail_threshold: Option<u32>,

    /// Default for `generate` when `--dry-run` is not given
    pub dry_run: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_type: StoreType::default(),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            holidays_path: None,
            directory_path: None,
            unresolved_fail_threshold: None,
            dry_run: false,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if the store type or threshold
    /// cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        let store_type = match std::env::var(ENV_STORE) {
            Ok(value) => value
                .parse::<StoreType>()
                .map_err(|e| ConfigError::InvalidValue(ENV_STORE.to_string(), e))?,
            Err(_) => StoreType::default(),
        };

        let data_dir = std::env::var(ENV_DATA_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_DATA_DIR));

        let holidays_path = non_empty_var(ENV_HOLIDAYS).map(PathBuf::from);
        let directory_path = non_empty_var(ENV_DIRECTORY).map(PathBuf::from);

        let unresolved_fail_threshold = non_empty_var(ENV_UNRESOLVED_FAIL_THRESHOLD)
            .map(|raw| {
                raw.trim().parse::<u32>().map_err(|e| {
                    ConfigError::InvalidValue(
                        ENV_UNRESOLVED_FAIL_THRESHOLD.to_string(),
                        format!("{}", e),
                    )
                })
            })
            .transpose()?;

        Ok(Self {
            store_type,
            data_dir,
            holidays_path,
            directory_path,
            unresolved_fail_threshold,
            dry_run: env_var_bool(ENV_DRY_RUN, false),
        })
    }

    /// Read the holiday file (if any) and build engine options.
    pub fn engine_options(&self) -> Result<EngineOptions, ConfigError> {
        let holidays = match &self.holidays_path {
            Some(path) => HolidaySet::from_path(path)
                .map_err(|e| ConfigError::InvalidValue(ENV_HOLIDAYS.to_string(), e.to_string()))?,
            None => HolidaySet::new(),
        };
        Ok(EngineOptions {
            holidays,
            unresolved_fail_threshold: self.unresolved_fail_threshold,
        })
    }

    /// Load the role directory, or an empty one when none is configured.
    pub fn role_directory(&self) -> Result<InMemoryRoleDirectory, ConfigError> {
        match &self.directory_path {
            Some(path) => InMemoryRoleDirectory::from_path(path)
                .map_err(|e| ConfigError::InvalidValue(ENV_DIRECTORY.to_string(), e.to_string())),
            None => Ok(InMemoryRoleDirectory::new()),
        }
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}
