//! Bootstrap configuration and root folder resolution
//!
//! Configuration is deliberately small: everything here is read once at
//! startup. Sources, highest priority first:
//! 1. Command-line arguments
//! 2. Environment variable (`DEVREC_ROOT_FOLDER`)
//! 3. TOML configuration file
//! 4. Built-in defaults (OS-dependent root folder)
//!
//! A missing TOML file is not an error: a warning is logged and defaults apply.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable overriding the root folder
pub const ROOT_FOLDER_ENV: &str = "DEVREC_ROOT_FOLDER";

/// Database file name inside the root folder
pub const DATABASE_FILE_NAME: &str = "devrec.db";

/// Bootstrap configuration loaded from TOML
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TomlConfig {
    /// Root folder holding the database (optional)
    #[serde(default)]
    pub root_folder: Option<PathBuf>,

    /// Explicit database path; relative paths are resolved against the root folder
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Reconciliation tuning
    #[serde(default)]
    pub reconcile: ReconcileConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error); `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Reconciliation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Observations of one poll cycle processed concurrently
    #[serde(default = "default_max_concurrent_observations")]
    pub max_concurrent_observations: usize,

    /// Reviewer name stamped on automatic queue transitions
    #[serde(default = "default_system_reviewer")]
    pub system_reviewer: String,

    /// Automatically mark pending queue entries as duplicate once a later
    /// unambiguous observation resolves the same device
    #[serde(default = "default_supersede_pending")]
    pub supersede_pending: bool,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            max_concurrent_observations: default_max_concurrent_observations(),
            system_reviewer: default_system_reviewer(),
            supersede_pending: default_supersede_pending(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_concurrent_observations() -> usize {
    8
}

fn default_system_reviewer() -> String {
    "system".to_string()
}

fn default_supersede_pending() -> bool {
    true
}

impl TomlConfig {
    /// Validate values that serde cannot check
    pub fn validate(&self) -> Result<()> {
        if self.reconcile.max_concurrent_observations == 0 {
            return Err(Error::Config(
                "reconcile.max_concurrent_observations must be at least 1".to_string(),
            ));
        }
        if self.reconcile.system_reviewer.trim().is_empty() {
            return Err(Error::Config(
                "reconcile.system_reviewer must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Database file location for the given root folder
    pub fn database_path(&self, root_folder: &Path) -> PathBuf {
        match &self.database_path {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => root_folder.join(path),
            None => root_folder.join(DATABASE_FILE_NAME),
        }
    }
}

/// Parse a TOML configuration file
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: TomlConfig = toml::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

/// Load configuration, degrading to defaults when no file is available
///
/// An explicit path that exists but fails to parse is still an error.
pub fn load_or_default(explicit_path: Option<&Path>) -> Result<TomlConfig> {
    let path = match explicit_path {
        Some(path) => Some(path.to_path_buf()),
        None => default_config_path(),
    };

    match path {
        Some(path) if path.exists() => {
            info!("Loading configuration from {}", path.display());
            load_toml_config(&path)
        }
        Some(path) => {
            warn!(
                "Configuration file {} not found, using built-in defaults",
                path.display()
            );
            Ok(TomlConfig::default())
        }
        None => {
            warn!("No configuration file found, using built-in defaults");
            Ok(TomlConfig::default())
        }
    }
}

/// Get the default configuration file path for the platform, if one exists
pub fn default_config_path() -> Option<PathBuf> {
    let user_config = dirs::config_dir().map(|d| d.join("devrec").join("config.toml"));
    if let Some(path) = user_config {
        if path.exists() {
            return Some(path);
        }
    }

    if cfg!(target_os = "linux") {
        let system_config = PathBuf::from("/etc/devrec/config.toml");
        if system_config.exists() {
            return Some(system_config);
        }
    }

    None
}

/// Root folder resolution in priority order:
/// 1. Command-line argument
/// 2. `DEVREC_ROOT_FOLDER` environment variable
/// 3. TOML config `root_folder`
/// 4. OS-dependent default
pub fn resolve_root_folder(cli_arg: Option<&Path>, config: &TomlConfig) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(ROOT_FOLDER_ENV) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Some(path) = &config.root_folder {
        return path.clone();
    }

    default_root_folder()
}

/// Get OS-dependent default root folder path
pub fn default_root_folder() -> PathBuf {
    if cfg!(target_os = "linux") {
        // ~/.local/share/devrec (or /var/lib/devrec for system-wide)
        dirs::data_local_dir()
            .map(|d| d.join("devrec"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/devrec"))
    } else if cfg!(target_os = "macos") {
        dirs::data_dir()
            .map(|d| d.join("devrec"))
            .unwrap_or_else(|| PathBuf::from("/Library/Application Support/devrec"))
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir()
            .map(|d| d.join("devrec"))
            .unwrap_or_else(|| PathBuf::from("C:\\ProgramData\\devrec"))
    } else {
        PathBuf::from("./devrec_data")
    }
}
