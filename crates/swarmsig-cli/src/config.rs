//! CLI configuration
//!
//! Reads from ~/.swarmsig/config.toml

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use swarmsig::{SwarmConfig, DEFAULT_ICE_SERVERS, DEFAULT_NUMWANT, DEFAULT_TRACKER_URL};

/// Top-level config structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub webrtc: WebRtcConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

/// Tracker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    #[serde(default = "default_tracker_url")]
    pub url: String,
    /// Offers per announce
    #[serde(default = "default_numwant")]
    pub numwant: usize,
    #[serde(default = "default_true")]
    pub announce_stopped: bool,
    #[serde(default)]
    pub reannounce: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            url: default_tracker_url(),
            numwant: default_numwant(),
            announce_stopped: true,
            reannounce: false,
        }
    }
}

fn default_tracker_url() -> String {
    DEFAULT_TRACKER_URL.to_string()
}

fn default_numwant() -> usize {
    DEFAULT_NUMWANT
}

fn default_true() -> bool {
    true
}

/// WebRTC configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRtcConfig {
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<String>,
    #[serde(default = "default_gather_timeout_ms")]
    pub gather_timeout_ms: u64,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            gather_timeout_ms: default_gather_timeout_ms(),
        }
    }
}

fn default_ice_servers() -> Vec<String> {
    DEFAULT_ICE_SERVERS.iter().map(|s| s.to_string()).collect()
}

fn default_gather_timeout_ms() -> u64 {
    5000
}

/// Session limits; unset means unbounded
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub max_messages: Option<usize>,
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,
    #[serde(default)]
    pub session_timeout_secs: Option<u64>,
    #[serde(default)]
    pub attempt_timeout_secs: Option<u64>,
}

impl Config {
    /// Load config from the default path, creating it if missing
    pub fn load() -> Result<Self> {
        Self::load_from(&get_config_path())
    }

    /// Load config from `path`, writing defaults there if it doesn't exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file {}", path.display()))
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Load config, returning default on any error (no panic)
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_default()
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn gather_timeout(&self) -> Duration {
        Duration::from_millis(self.webrtc.gather_timeout_ms)
    }

    /// Session settings for the library
    pub fn swarm_config(&self) -> SwarmConfig {
        SwarmConfig {
            tracker_url: self.tracker.url.clone(),
            numwant: self.tracker.numwant,
            max_messages: self.session.max_messages,
            idle_timeout: self.session.idle_timeout_secs.map(Duration::from_secs),
            session_timeout: self.session.session_timeout_secs.map(Duration::from_secs),
            attempt_timeout: self.session.attempt_timeout_secs.map(Duration::from_secs),
            announce_stopped: self.tracker.announce_stopped,
            reannounce: self.tracker.reannounce,
        }
    }
}

/// Get the swarmsig directory (~/.swarmsig)
pub fn get_swarmsig_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("SWARMSIG_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".swarmsig")
}

/// Get the config file path (~/.swarmsig/config.toml)
pub fn get_config_path() -> PathBuf {
    get_swarmsig_dir().join("config.toml")
}
