//! pveflow settings
//!
//! API connection, operation timeouts and the provider default policy, read
//! from a YAML settings file and overridden by `PROXMOX_VE_*` variables.

pub mod error;

pub use error::*;

use pveflow_core::DefaultPolicy;
use pveflow_reconcile::Timeouts;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const CONFIG_PATH_ENV: &str = "PVEFLOW_CONFIG_PATH";
pub const ENDPOINT_ENV: &str = "PROXMOX_VE_ENDPOINT";
pub const API_TOKEN_ENV: &str = "PROXMOX_VE_API_TOKEN";
pub const INSECURE_ENV: &str = "PROXMOX_VE_INSECURE";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub api: ApiSettings,
    pub timeouts: TimeoutSettings,
    /// Status polling interval in milliseconds
    pub poll_interval_ms: u64,
    pub defaults: DefaultPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api: ApiSettings::default(),
            timeouts: TimeoutSettings::default(),
            poll_interval_ms: 1000,
            defaults: DefaultPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    pub endpoint: Option<String>,
    /// `USER@REALM!TOKENID=SECRET`
    pub api_token: Option<String>,
    pub insecure: bool,
}

impl ApiSettings {
    pub fn endpoint(&self) -> Result<&str> {
        self.endpoint
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::Missing("api.endpoint"))
    }

    pub fn api_token(&self) -> Result<&str> {
        self.api_token
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::Missing("api.api_token"))
    }
}

/// Operation timeouts in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub create: u64,
    pub clone: u64,
    pub migrate: u64,
    pub start: u64,
    pub shutdown: u64,
    pub stop: u64,
    pub reboot: u64,
    pub move_disk: u64,
    pub resize_disk: u64,
    pub request: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            create: 1800,
            clone: 1800,
            migrate: 1800,
            start: 1800,
            shutdown: 1800,
            stop: 300,
            reboot: 1800,
            move_disk: 1800,
            resize_disk: 1800,
            request: 300,
        }
    }
}

impl From<&TimeoutSettings> for Timeouts {
    fn from(t: &TimeoutSettings) -> Self {
        let secs = Duration::from_secs;
        Timeouts {
            create: secs(t.create),
            clone: secs(t.clone),
            migrate: secs(t.migrate),
            start: secs(t.start),
            shutdown: secs(t.shutdown),
            stop: secs(t.stop),
            reboot: secs(t.reboot),
            move_disk: secs(t.move_disk),
            resize_disk: secs(t.resize_disk),
            request: secs(t.request),
        }
    }
}

impl Settings {
    pub fn from_yaml(content: &str, path: &Path) -> Result<Self> {
        serde_yaml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content, path)
    }

    /// Discovered settings file (or defaults when there is none) with the
    /// environment applied on top.
    pub fn load() -> Result<Self> {
        let mut settings = match find_settings_file() {
            Ok(path) => {
                debug!(path = %path.display(), "Loading settings");
                Self::from_file(&path)?
            }
            Err(ConfigError::SettingsFileNotFound) => {
                debug!("No settings file, using defaults");
                Self::default()
            }
            Err(e) => return Err(e),
        };
        settings.apply_env()?;
        Ok(settings)
    }

    /// Overrides the API connection from `PROXMOX_VE_*` variables.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(endpoint) = std::env::var(ENDPOINT_ENV) {
            self.api.endpoint = Some(endpoint);
        }
        if let Ok(token) = std::env::var(API_TOKEN_ENV) {
            self.api.api_token = Some(token);
        }
        if let Ok(value) = std::env::var(INSECURE_ENV) {
            self.api.insecure = parse_bool(INSECURE_ENV, &value)?;
        }
        Ok(())
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts::from(&self.timeouts)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            name,
            value: value.to_string(),
        }),
    }
}

/// Finds the settings file.
///
/// Search order:
/// 1. `PVEFLOW_CONFIG_PATH`
/// 2. current directory: `pveflow.local.yaml`, `pveflow.yaml`
/// 3. `~/.config/pveflow/config.yaml`
pub fn find_settings_file() -> Result<PathBuf> {
    if let Ok(config_path) = std::env::var(CONFIG_PATH_ENV) {
        let path = PathBuf::from(config_path);
        if path.exists() {
            return Ok(path);
        }
    }

    let current_dir = std::env::current_dir()?;
    for filename in ["pveflow.local.yaml", "pveflow.yaml"] {
        let path = current_dir.join(filename);
        if path.exists() {
            return Ok(path);
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        let global = config_dir.join("pveflow").join("config.yaml");
        if global.exists() {
            return Ok(global);
        }
    }

    Err(ConfigError::SettingsFileNotFound)
}
