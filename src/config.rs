//! Daemon configuration (config.json)
//!
//! Loaded from the platform config directory (e.g.
//! `~/.config/tailview/config.json` on Linux), with every field defaulted so
//! a missing or partial file works out of the box.

use crate::discovery;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Daemon settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Listen address for the TCP server.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Fallback polling cadence per tailed file, in milliseconds. The
    /// filesystem watcher usually delivers lines sooner; this bounds the
    /// worst case.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Base directory for `list` requests.
    #[serde(default = "default_search_root")]
    pub search_root: String,
    /// Ignore globs for `list` requests, relative to the search base.
    #[serde(default = "default_ignores")]
    pub ignores: Vec<String>,
    /// Shared token clients must present in `hello`. Unset means every
    /// connection is admitted.
    #[serde(default)]
    pub auth_token: Option<String>,
}

fn default_bind_addr() -> String {
    "127.0.0.1:4040".to_string()
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_search_root() -> String {
    ".".to_string()
}

fn default_ignores() -> Vec<String> {
    discovery::DEFAULT_IGNORES
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            poll_interval_ms: default_poll_interval_ms(),
            search_root: default_search_root(),
            ignores: default_ignores(),
            auth_token: None,
        }
    }
}

/// Tailview config directory (e.g. `~/.config/tailview/`).
fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("tailview"))
}

/// Load config from the default location, returning defaults if the file is
/// missing or invalid.
pub fn load_config() -> Config {
    let Some(path) = config_dir().map(|d| d.join("config.json")) else {
        return Config::default();
    };
    load_config_from(&path)
}

/// Load config from an explicit path (the `--config` flag).
pub fn load_config_from(path: &Path) -> Config {
    match std::fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str(&contents).unwrap_or_default(),
        Err(_) => Config::default(),
    }
}

/// Save config to an explicit path.
pub fn save_config_to(config: &Config, path: &Path) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config).map_err(std::io::Error::other)?;
    atomic_write(path, json.as_bytes())
}

/// Write bytes to a file atomically: write to a temp file in the same
/// directory, then rename over the target. Prevents partial JSON on crash.
fn atomic_write(path: &Path, data: &[u8]) -> Result<(), std::io::Error> {
    use std::io::Write;

    let parent = path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no parent")
    })?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(data)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
