//! Configuration file resolution and loading
//!
//! Config file location follows a fixed priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. Per-user config directory (`~/.config/coma/<file>` on Linux)
//! 4. System config directory (`/etc/coma/<file>`, Linux only)
//!
//! A missing config file is never fatal: callers receive compiled defaults
//! and a warning is logged.

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Directory name used under the platform config directory
pub const CONFIG_DIR_NAME: &str = "coma";

/// Logging section shared by all COMA binaries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default tracing filter directive (e.g. "info", "coma_ingest=debug")
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Resolve the config file path.
///
/// Returns `None` when no candidate exists; the CLI and ENV candidates are
/// returned even if the file is absent so that the loader can warn about it.
pub fn resolve_config_path(
    cli_arg: Option<&Path>,
    env_var_name: &str,
    file_name: &str,
) -> Option<PathBuf> {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    // Priority 2: Environment variable
    if let Some(path) = env_value(env_var_name) {
        return Some(PathBuf::from(path));
    }

    // Priority 3: Per-user config directory
    if let Some(user) = dirs::config_dir().map(|d| d.join(CONFIG_DIR_NAME).join(file_name)) {
        if user.exists() {
            return Some(user);
        }
    }

    // Priority 4: System config directory
    if cfg!(target_os = "linux") {
        let system = PathBuf::from("/etc").join(CONFIG_DIR_NAME).join(file_name);
        if system.exists() {
            return Some(system);
        }
    }

    None
}

/// Load a TOML config file, falling back to `T::default()` when the file is
/// not available.
///
/// A file that exists but cannot be parsed is an error.
pub fn load_toml_or_default<T>(path: Option<&Path>) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    let Some(path) = path else {
        info!("No config file found, using compiled defaults");
        return Ok(T::default());
    };

    if !path.exists() {
        warn!(
            path = %path.display(),
            "Config file not found, using compiled defaults"
        );
        return Ok(T::default());
    }

    let content = std::fs::read_to_string(path)?;
    let config = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))?;

    debug!(path = %path.display(), "Config file loaded");
    Ok(config)
}

/// Read an environment variable, ignoring empty or whitespace-only values
pub fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
