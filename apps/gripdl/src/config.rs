//! Daemon configuration management.
//!
//! Configuration is stored as TOML:
//! - Linux: `~/.config/gripdl/gripdl.toml`
//! - Windows: `%APPDATA%/gripdl/gripdl.toml`
//!
//! `GRIPDL_CONFIG` overrides the location.

use std::path::{Path, PathBuf};
use std::time::Duration;

use gripdl_engine::config::{
    DEFAULT_MAX_SEGMENTS, DEFAULT_MIN_SEGMENT_BYTES, DEFAULT_READ_TIMEOUT, DEFAULT_USER_AGENT,
    default_download_dir,
};
use gripdl_engine::{EngineConfig, RetryPolicy};
use serde::{Deserialize, Serialize};

use crate::capture::DEFAULT_CAPTURE_PORT;

/// Environment variable pointing at an alternative config file.
pub const CONFIG_ENV: &str = "GRIPDL_CONFIG";

const STATE_FILE: &str = "state.json";

/// Daemon configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Where finished downloads land.
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    /// Directory holding the transfer state file.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Loopback port the native host connects to.
    #[serde(default = "default_capture_port")]
    pub capture_port: u16,

    #[serde(default = "default_max_segments")]
    pub max_segments: u32,

    #[serde(default = "default_min_segment_bytes")]
    pub min_segment_bytes: u64,

    /// Attempts per segment before the transfer fails.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Per-request timeout in seconds (0 = none).
    #[serde(default)]
    pub request_timeout_secs: u64,

    /// Seconds a response may stay silent before the attempt is retried
    /// (0 = wait forever).
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// User agent for requests that did not carry one.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_state_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata).join("gripdl")
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home)
            .join(".local")
            .join("share")
            .join("gripdl")
    }
}

fn default_capture_port() -> u16 {
    DEFAULT_CAPTURE_PORT
}

fn default_max_segments() -> u32 {
    DEFAULT_MAX_SEGMENTS
}

fn default_min_segment_bytes() -> u64 {
    DEFAULT_MIN_SEGMENT_BYTES
}

fn default_max_attempts() -> u32 {
    RetryPolicy::default().max_attempts
}

fn default_read_timeout_secs() -> u64 {
    DEFAULT_READ_TIMEOUT.as_secs()
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.into()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            state_dir: default_state_dir(),
            capture_port: default_capture_port(),
            max_segments: default_max_segments(),
            min_segment_bytes: default_min_segment_bytes(),
            max_attempts: default_max_attempts(),
            request_timeout_secs: 0,
            read_timeout_secs: default_read_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

impl Config {
    /// Loads configuration from disk, or creates a default if not found.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&config_path())
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Writes the configuration to `path`, creating parent directories.
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// Location of the transfer state document.
    pub fn state_file(&self) -> PathBuf {
        self.state_dir.join(STATE_FILE)
    }

    /// Maps the file settings onto the engine's configuration.
    pub fn engine_config(&self) -> EngineConfig {
        let defaults = EngineConfig::default();
        EngineConfig {
            download_dir: self.download_dir.clone(),
            max_segments: self.max_segments.max(1),
            min_segment_bytes: self.min_segment_bytes.max(1),
            retry: RetryPolicy {
                max_attempts: self.max_attempts.max(1),
                ..defaults.retry
            },
            request_timeout: (self.request_timeout_secs > 0)
                .then(|| Duration::from_secs(self.request_timeout_secs)),
            read_timeout: (self.read_timeout_secs > 0)
                .then(|| Duration::from_secs(self.read_timeout_secs)),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs.max(1)),
            user_agent: self.user_agent.clone(),
            ..defaults
        }
    }
}

/// Returns the configuration file path, honouring [`CONFIG_ENV`].
pub fn config_path() -> PathBuf {
    if let Some(path) = std::env::var_os(CONFIG_ENV).filter(|p| !p.is_empty()) {
        return PathBuf::from(path);
    }

    #[cfg(target_os = "linux")]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home)
            .join(".config")
            .join("gripdl")
            .join("gripdl.toml")
    }

    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata).join("gripdl").join("gripdl.toml")
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        PathBuf::from("/tmp/gripdl/gripdl.toml")
    }
}
