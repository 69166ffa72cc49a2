//! Centralized path resolution for topoplay
//!
//! # Environment Variables
//!
//! - `TOPOPLAY_CONFIG_DIR` - Override config directory
//! - `TOPOPLAY_STATE_DIR` - Override state directory (cluster logs)
//!
//! # Path Resolution Priority
//!
//! For config_dir():
//! 1. `TOPOPLAY_CONFIG_DIR` environment variable
//! 2. `XDG_CONFIG_HOME/topoplay` (if set)
//! 3. `~/.config/topoplay`
//!
//! For state_dir():
//! 1. `TOPOPLAY_STATE_DIR` environment variable
//! 2. `XDG_STATE_HOME/topoplay` (if set)
//! 3. `~/.local/state/topoplay`

use anyhow::{Context, Result};
use playgraph::config::{SETTINGS_FILE, expand_path};
use std::path::PathBuf;

/// Environment variable for config directory override
pub const ENV_CONFIG_DIR: &str = "TOPOPLAY_CONFIG_DIR";

/// Environment variable for state directory override
pub const ENV_STATE_DIR: &str = "TOPOPLAY_STATE_DIR";

const APP_DIR: &str = "topoplay";

/// Get the topoplay config directory path
pub fn config_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(ENV_CONFIG_DIR) {
        let path = expand_path(&dir);
        log::debug!(
            "Using config dir from {}: {}",
            ENV_CONFIG_DIR,
            path.display()
        );
        return Ok(path);
    }

    if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
        let path = PathBuf::from(xdg_config).join(APP_DIR);
        log::debug!("Using XDG_CONFIG_HOME: {}", path.display());
        return Ok(path);
    }

    let home = dirs::home_dir().context("Could not determine home directory")?;
    let path = home.join(".config").join(APP_DIR);
    log::debug!("Using default config dir: {}", path.display());
    Ok(path)
}

/// Get the topoplay state directory path
pub fn state_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(ENV_STATE_DIR) {
        let path = expand_path(&dir);
        log::debug!("Using state dir from {}: {}", ENV_STATE_DIR, path.display());
        return Ok(path);
    }

    if let Ok(xdg_state) = std::env::var("XDG_STATE_HOME") {
        let path = PathBuf::from(xdg_state).join(APP_DIR);
        log::debug!("Using XDG_STATE_HOME: {}", path.display());
        return Ok(path);
    }

    let home = dirs::home_dir().context("Could not determine home directory")?;
    let path = home.join(".local").join("state").join(APP_DIR);
    log::debug!("Using default state dir: {}", path.display());
    Ok(path)
}

/// Path of the settings file inside the config directory
pub fn settings_file() -> Result<PathBuf> {
    Ok(config_dir()?.join(SETTINGS_FILE))
}

// ============================================================================
// Tests
// ============================================================================
