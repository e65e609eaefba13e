//! Connector settings.
//!
//! Defaults are persisted to a per-user config file. Environment variables
//! override any stored values so deployments can tune pools without editing
//! the file.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::pool::PoolSettings;

const CONFIG_ENV: &str = "DBCONNECTOR_CONFIG";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorSettings {
    pub pool: PoolSettings,
    /// Upper bound on establishing a direct session
    pub connect_timeout_secs: u64,
    /// Upper bound on establishing a remote session when the config sets none
    pub remote_connect_timeout_secs: u64,
    /// Upper bound on `test_connection`
    pub test_timeout_secs: u64,
    /// How long to wait for an SSH forward to accept connections
    pub tunnel_ready_timeout_secs: u64,
}

impl Default for ConnectorSettings {
    fn default() -> Self {
        Self {
            pool: PoolSettings::default(),
            connect_timeout_secs: 15,
            remote_connect_timeout_secs: 30,
            test_timeout_secs: 10,
            tunnel_ready_timeout_secs: 30,
        }
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn config_path_with(lookup: &dyn Fn(&str) -> Option<String>) -> PathBuf {
    if let Some(explicit) = lookup(CONFIG_ENV).filter(|p| !p.trim().is_empty()) {
        return PathBuf::from(explicit);
    }

    if cfg!(windows) {
        let appdata = lookup("APPDATA")
            .or_else(|| lookup("USERPROFILE"))
            .unwrap_or_default();
        let mut path = PathBuf::from(appdata);
        path.push("dbconnector");
        path.push("config.json");
        path
    } else {
        let home = lookup("HOME").unwrap_or_default();
        let mut path = PathBuf::from(home);
        path.push(".dbconnector");
        path.push("config.json");
        path
    }
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Location of the settings file
pub fn config_path() -> PathBuf {
    config_path_with(&env_lookup)
}

fn load_from_file(path: &Path) -> Option<ConnectorSettings> {
    let raw = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&raw) {
        Ok(settings) => Some(settings),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring malformed connector settings");
            None
        }
    }
}

impl ConnectorSettings {
    fn apply_overrides(&mut self, lookup: &dyn Fn(&str) -> Option<String>) {
        let num = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let count = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u32>().ok());

        if let Some(value) = count("DBCONNECTOR_POOL_MAX_CONNECTIONS") {
            self.pool.max_connections = value;
        }
        if let Some(value) = count("DBCONNECTOR_POOL_MIN_CONNECTIONS") {
            self.pool.min_connections = value;
        }
        if let Some(value) = num("DBCONNECTOR_POOL_ACQUIRE_TIMEOUT_SECS") {
            self.pool.acquire_timeout_secs = value;
        }
        if let Some(value) = num("DBCONNECTOR_POOL_IDLE_TIMEOUT_SECS") {
            self.pool.idle_timeout_secs = (value > 0).then_some(value);
        }
        if let Some(value) = num("DBCONNECTOR_POOL_MAX_LIFETIME_SECS") {
            self.pool.max_lifetime_secs = (value > 0).then_some(value);
        }
        if let Some(value) = lookup("DBCONNECTOR_POOL_TEST_BEFORE_ACQUIRE") {
            self.pool.test_before_acquire = parse_bool(&value);
        }
        if let Some(value) = num("DBCONNECTOR_CONNECT_TIMEOUT_SECS") {
            self.connect_timeout_secs = value;
        }
        if let Some(value) = num("DBCONNECTOR_REMOTE_CONNECT_TIMEOUT_SECS") {
            self.remote_connect_timeout_secs = value;
        }
        if let Some(value) = num("DBCONNECTOR_TEST_TIMEOUT_SECS") {
            self.test_timeout_secs = value;
        }
        if let Some(value) = num("DBCONNECTOR_TUNNEL_READY_TIMEOUT_SECS") {
            self.tunnel_ready_timeout_secs = value;
        }
    }

    fn load_with(lookup: &dyn Fn(&str) -> Option<String>) -> Self {
        let path = config_path_with(lookup);
        let mut settings = load_from_file(&path).unwrap_or_default();
        settings.apply_overrides(lookup);
        settings
    }

    /// Stored settings (or defaults) with environment overrides applied
    pub fn load() -> Self {
        Self::load_with(&env_lookup)
    }

    pub fn save_to_file(&self) -> EngineResult<()> {
        self.save_to(&config_path())
    }

    pub fn save_to(&self, path: &Path) -> EngineResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                EngineError::invalid_config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let payload = serde_json::to_string_pretty(self)
            .map_err(|e| EngineError::invalid_config(format!("Save failed: {}", e)))?;
        fs::write(path, payload)
            .map_err(|e| EngineError::invalid_config(format!("Save failed: {}", e)))?;
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn remote_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_connect_timeout_secs)
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }

    pub fn tunnel_ready_timeout(&self) -> Duration {
        Duration::from_secs(self.tunnel_ready_timeout_secs)
    }
}
