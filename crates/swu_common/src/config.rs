//! Agent configuration.
//!
//! Loads settings from /etc/swupdate/agent.toml or uses defaults, then applies
//! environment overrides.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Config file path
pub const CONFIG_PATH: &str = "/etc/swupdate/agent.toml";

/// Controller socket locations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpcConfig {
    /// Control socket: commands and image stream
    #[serde(default = "default_control_socket")]
    pub control_socket: PathBuf,

    /// Progress socket: status notifications
    #[serde(default = "default_progress_socket")]
    pub progress_socket: PathBuf,
}

fn default_control_socket() -> PathBuf {
    PathBuf::from("/tmp/sockinstctrl")
}

fn default_progress_socket() -> PathBuf {
    PathBuf::from("/tmp/swupdateprog")
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            control_socket: default_control_socket(),
            progress_socket: default_progress_socket(),
        }
    }
}

/// Update lock locations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockConfig {
    /// System-wide lock, used when running as root
    #[serde(default = "default_lock_file")]
    pub lock_file: PathBuf,

    /// Directory for the per-uid lock of unprivileged runs
    #[serde(default = "default_user_lock_dir")]
    pub user_lock_dir: PathBuf,

    /// Presence of this file means a reboot is pending
    #[serde(default = "default_reboot_marker")]
    pub reboot_marker: PathBuf,
}

fn default_lock_file() -> PathBuf {
    PathBuf::from("/var/lock/swupdate.lock")
}

fn default_user_lock_dir() -> PathBuf {
    PathBuf::from("/tmp")
}

fn default_reboot_marker() -> PathBuf {
    PathBuf::from("/run/swupdate_rebooting")
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lock_file: default_lock_file(),
            user_lock_dir: default_user_lock_dir(),
            reboot_marker: default_reboot_marker(),
        }
    }
}

/// Subprocess handler tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerConfig {
    /// Liveness re-check interval of the polling loop
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Per-stream line accumulation buffer
    #[serde(default = "default_line_buffer")]
    pub line_buffer_size: usize,
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_line_buffer() -> usize {
    256
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            line_buffer_size: default_line_buffer(),
        }
    }
}

/// Complete agent configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_tmpdir")]
    pub tmpdir: PathBuf,

    #[serde(default)]
    pub ipc: IpcConfig,

    #[serde(default)]
    pub lock: LockConfig,

    #[serde(default)]
    pub handler: HandlerConfig,
}

fn default_tmpdir() -> PathBuf {
    PathBuf::from("/tmp")
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            tmpdir: default_tmpdir(),
            ipc: IpcConfig::default(),
            lock: LockConfig::default(),
            handler: HandlerConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Load config from the default path, falling back to defaults, then
    /// apply environment overrides
    pub fn load() -> Self {
        let mut config = if Path::new(CONFIG_PATH).exists() {
            Self::load_from_path(CONFIG_PATH).unwrap_or_else(|e| {
                warn!("Invalid config {}, using defaults: {}", CONFIG_PATH, e);
                Self::default()
            })
        } else {
            debug!("No config at {}, using defaults", CONFIG_PATH);
            Self::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    /// Load config from specific path
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, String> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| e.to_string())?;
        let config: AgentConfig = toml::from_str(&content).map_err(|e| e.to_string())?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Apply overrides from a variable lookup (the environment in production)
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let path = |key: &str| lookup(key).filter(|v| !v.is_empty()).map(PathBuf::from);

        if let Some(p) = path("SWUPDATE_CTRL_SOCKET") {
            self.ipc.control_socket = p;
        }
        if let Some(p) = path("SWUPDATE_PROGRESS_SOCKET") {
            self.ipc.progress_socket = p;
        }
        if let Some(p) = path("SWUPDATE_LOCK_FILE") {
            self.lock.lock_file = p;
        }
        if let Some(p) = path("SWUPDATE_REBOOT_FILE") {
            self.lock.reboot_marker = p;
        }
        if let Some(p) = path("TMPDIR") {
            self.tmpdir = p;
        }
    }
}
