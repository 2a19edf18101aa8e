//! YAML configuration.
//!
//! Recognised options: `paths` (base directories to scan), `recursion`
//! (discovery depth, default 1), `quick` (non-interactive one-shot,
//! default false) and `mode` (`fetch` or `pull`, default `fetch`). An
//! absent file means defaults; an invalid `mode` silently reverts to the
//! default.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::services::jobs::Mode;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub paths: Vec<PathBuf>,
    pub recursion: usize,
    pub quick: bool,
    pub mode: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            paths: Vec::new(),
            recursion: 1,
            quick: false,
            mode: "fetch".to_string(),
        }
    }
}

impl AppConfig {
    /// The configured batch mode. Only `fetch` and `pull` are accepted
    /// from the file; anything else reverts to `fetch`.
    pub fn mode(&self) -> Mode {
        match self.mode.as_str() {
            "fetch" => Mode::Fetch,
            "pull" => Mode::Pull,
            other => {
                tracing::debug!(mode = other, "unrecognised configured mode, using fetch");
                Mode::Fetch
            }
        }
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("grove").join("config.yml"))
}

/// Load configuration from `path`, or from the default location when no
/// path is given. Any problem reading or parsing the file logs a warning
/// and yields the defaults.
pub fn load(path: Option<&Path>) -> AppConfig {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => match default_config_path() {
            Some(p) => p,
            None => return AppConfig::default(),
        },
    };
    if !path.exists() {
        return AppConfig::default();
    }
    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(err) => {
            tracing::warn!(path = %path.display(), %err, "config not readable, using defaults");
            return AppConfig::default();
        }
    };
    match serde_yaml::from_str(&text) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(path = %path.display(), %err, "config not parsable, using defaults");
            AppConfig::default()
        }
    }
}
