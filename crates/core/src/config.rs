//! Daemon configuration
//!
//! Every field has a default, so an empty (or missing) `boxsync.toml` is a
//! valid configuration:
//!
//! ```toml
//! branch = "master"
//! debounce_secs = 5
//! commit_message = "(boxsync automatic commit)"
//!
//! [server]
//! host = "127.0.0.1"
//! port_range = [15550, 15579]
//! idle_timeout_secs = 5
//! max_line_len = 1024
//! max_handler_failures = 5
//!
//! [ignore]
//! use_gitignore = true
//! additional_patterns = []
//! ```

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Name of the per-repository configuration file
pub const CONFIG_FILE_NAME: &str = "boxsync.toml";

/// Errors raised while loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Branch kept in sync with the directory
    pub branch: String,

    /// Quiet period after the last change before committing
    pub debounce_secs: u64,

    /// Message used for automatic commits
    pub commit_message: String,

    /// Hook server settings
    pub server: ServerConfig,

    /// Which directory events to drop
    pub ignore: IgnoreConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            branch: "master".to_string(),
            debounce_secs: 5,
            commit_message: "(boxsync automatic commit)".to_string(),
            server: ServerConfig::default(),
            ignore: IgnoreConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Parse configuration from TOML text and validate it
    pub fn from_toml(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        let config: SyncConfig = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text, path)
    }

    /// Load `boxsync.toml` from the repository directory, or use defaults
    pub fn load_or_default(repo_dir: &Path) -> Result<Self, ConfigError> {
        let path = repo_dir.join(CONFIG_FILE_NAME);
        if path.is_file() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.branch.trim().is_empty() {
            return Err(ConfigError::Invalid("branch must not be empty".to_string()));
        }
        if self.debounce_secs == 0 {
            return Err(ConfigError::Invalid(
                "debounce_secs must be at least 1".to_string(),
            ));
        }
        self.server.validate()
    }

    /// Debounce quiet period
    pub fn debounce(&self) -> Duration {
        Duration::from_secs(self.debounce_secs)
    }
}

/// Hook server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface to listen on
    pub host: IpAddr,

    /// First and last candidate port, inclusive
    pub port_range: (u16, u16),

    /// How long a client may stay silent before being evicted
    pub idle_timeout_secs: u64,

    /// Longest accepted line, in bytes
    pub max_line_len: usize,

    /// Consecutive handler failures after which the server gives up
    pub max_handler_failures: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::from([127, 0, 0, 1]),
            port_range: (15550, 15579),
            idle_timeout_secs: 5,
            max_line_len: 1024,
            max_handler_failures: 5,
        }
    }
}

impl ServerConfig {
    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        let (first, last) = self.port_range;
        if first == 0 || first > last {
            return Err(ConfigError::Invalid(format!(
                "port_range [{}, {}] is empty",
                first, last
            )));
        }
        if self.idle_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "idle_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.max_line_len == 0 {
            return Err(ConfigError::Invalid(
                "max_line_len must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Idle timeout per client connection
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Ignore configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IgnoreConfig {
    /// Use .gitignore patterns (default: true)
    #[serde(default = "default_true")]
    pub use_gitignore: bool,

    /// Additional gitignore-style patterns
    #[serde(default)]
    pub additional_patterns: Vec<String>,
}

impl Default for IgnoreConfig {
    fn default() -> Self {
        Self {
            use_gitignore: true,
            additional_patterns: vec![],
        }
    }
}

fn default_true() -> bool {
    true
}
