//! Configuration loading and saving utilities.
//!
//! The config lives at `~/.fleetdeck/sync.json`. A missing file means
//! defaults; a malformed one is an error so typos do not silently reset the
//! subscription endpoint.

use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

pub const ENDPOINT_ENV: &str = "FLEETDECK_WS_ENDPOINT";
pub const DEFAULT_WS_ENDPOINT: &str =
    "ws://localhost:8080/v1/subscribe?eventNames=resource.change";
pub const DEFAULT_PING_TIMEOUT_MS: u64 = 11_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub ws_endpoint: String,
    /// Two missed server pings (sent every 5s) plus slack.
    pub ping_timeout_ms: u64,
    /// Lifecycle states after which a resource belongs to no collection.
    pub terminal_states: BTreeSet<String>,
    pub auth_enabled: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            ws_endpoint: DEFAULT_WS_ENDPOINT.to_string(),
            ping_timeout_ms: DEFAULT_PING_TIMEOUT_MS,
            terminal_states: ["removed", "purged"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            auth_enabled: true,
        }
    }
}

impl SyncConfig {
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn is_terminal(&self, state: Option<&str>) -> bool {
        state
            .map(|state| self.terminal_states.contains(state))
            .unwrap_or(false)
    }
}

/// Returns the path to the fleetdeck directory (~/.fleetdeck).
pub fn get_fleetdeck_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".fleetdeck"))
}

/// Returns the path to the sync configuration file.
pub fn get_sync_config_path() -> Option<PathBuf> {
    get_fleetdeck_dir().map(|d| d.join("sync.json"))
}

/// Loads the default config file and applies environment overrides.
pub fn load_sync_config() -> Result<SyncConfig> {
    let mut config = match get_sync_config_path() {
        Some(path) => load_sync_config_from(&path)?,
        None => SyncConfig::default(),
    };

    if let Ok(endpoint) = env::var(ENDPOINT_ENV) {
        if !endpoint.trim().is_empty() {
            config.ws_endpoint = endpoint;
        }
    }
    Ok(config)
}

pub fn load_sync_config_from(path: &Path) -> Result<SyncConfig> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(SyncConfig::default())
        }
        Err(source) => {
            return Err(SyncError::Io {
                context: format!("reading {}", path.display()),
                source,
            })
        }
    };

    serde_json::from_str(&content).map_err(|err| SyncError::Config {
        path: path.to_path_buf(),
        details: err.to_string(),
    })
}

pub fn save_sync_config(config: &SyncConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| SyncError::Io {
            context: format!("creating {}", parent.display()),
            source,
        })?;
    }

    let content = serde_json::to_string_pretty(config).map_err(|source| SyncError::Json {
        context: "serializing sync config".to_string(),
        source,
    })?;
    fs::write(path, content).map_err(|source| SyncError::Io {
        context: format!("writing {}", path.display()),
        source,
    })
}
