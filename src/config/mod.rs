//! Runtime settings and config-directory resolution.

use std::env;
use std::path::PathBuf;

use crate::error::{DaemonError, Result};

const CONFIG_DIR_NAME: &str = "kde-connect-fyne";

/// Startup settings. Everything here comes from the environment; the
/// interesting state (identity, paired devices) lives in the config store.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Human-readable name announced to peers.
    pub device_name: String,
    /// One of desktop / laptop / phone / tablet / tv.
    pub device_type: String,
}

impl Settings {
    /// `KDECONNECTD_DEVICE_NAME` wins, then the machine hostname, then a
    /// fixed fallback.
    pub fn from_env() -> Self {
        let device_name = env::var("KDECONNECTD_DEVICE_NAME")
            .ok()
            .filter(|name| !name.is_empty())
            .or_else(|| env::var("HOSTNAME").ok().filter(|name| !name.is_empty()))
            .unwrap_or_else(|| "KDE Connect Daemon".to_string());
        let device_type = env::var("KDECONNECTD_DEVICE_TYPE")
            .ok()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| "desktop".to_string());
        Self {
            device_name,
            device_type,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            device_name: "KDE Connect Daemon".to_string(),
            device_type: "desktop".to_string(),
        }
    }
}

/// Directory holding `config.json` and the credential PEMs.
/// `KDECONNECTD_CONFIG_DIR` overrides the platform default.
pub fn default_config_dir() -> Result<PathBuf> {
    if let Ok(dir) = env::var("KDECONNECTD_CONFIG_DIR") {
        if !dir.is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }
    dirs::config_dir()
        .map(|dir| dir.join(CONFIG_DIR_NAME))
        .ok_or_else(|| DaemonError::persistence("could not resolve a config directory"))
}
