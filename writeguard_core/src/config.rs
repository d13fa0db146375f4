//! Guard configuration.
//!
//! The configuration is a TOML document:
//!
//! ```toml
//! protected_roots = ["/srv/project"]
//! default_ttl_seconds = 300
//! heartbeat_timeout_seconds = 30
//! heartbeat_check_interval_seconds = 5
//! cleanup_interval_seconds = 10
//! ledger_path = "permissions.db"
//! ```
//!
//! Every key is optional; missing keys take the defaults below.

use crate::error::{GuardError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_TTL_SECONDS: u64 = 300;
pub const DEFAULT_HEARTBEAT_TIMEOUT_SECONDS: u64 = 30;
pub const DEFAULT_HEARTBEAT_CHECK_INTERVAL_SECONDS: u64 = 5;
pub const DEFAULT_CLEANUP_INTERVAL_SECONDS: u64 = 10;
pub const DEFAULT_FS_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_LEDGER_PATH: &str = "permissions.db";

/// Upper bound for every duration setting: ten years.
pub const MAX_DURATION_SECONDS: u64 = 10 * 365 * 24 * 60 * 60;

/// Directories never descended into when locking a tree.
pub const DEFAULT_SKIP_DIRS: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    "target",
    "node_modules",
    "__pycache__",
    "venv",
    ".venv",
    "env",
    "build",
    "dist",
];

/// Compiled-artifact extensions left untouched when locking a tree.
pub const DEFAULT_SKIP_EXTENSIONS: &[&str] = &[
    "pyc", "pyo", "o", "a", "so", "dylib", "dll", "exe", "class", "rlib",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Directories whose whole subtree is governed by the guard.
    pub protected_roots: Vec<PathBuf>,

    /// Lifetime of a grant when the caller does not supply one.
    pub default_ttl_seconds: u64,

    /// Silence longer than this triggers lockdown.
    pub heartbeat_timeout_seconds: u64,

    /// How often the supervisor compares the last heartbeat to the deadline.
    pub heartbeat_check_interval_seconds: u64,

    /// How often the supervisor sweeps expired grants.
    pub cleanup_interval_seconds: u64,

    /// SQLite file holding the grant and audit tables.
    pub ledger_path: PathBuf,

    pub skip_dirs: Vec<String>,

    pub skip_extensions: Vec<String>,

    /// Attempts per chmod/stat call before the failure is reported.
    pub fs_retry_attempts: u32,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            protected_roots: default_protected_roots(),
            default_ttl_seconds: DEFAULT_TTL_SECONDS,
            heartbeat_timeout_seconds: DEFAULT_HEARTBEAT_TIMEOUT_SECONDS,
            heartbeat_check_interval_seconds: DEFAULT_HEARTBEAT_CHECK_INTERVAL_SECONDS,
            cleanup_interval_seconds: DEFAULT_CLEANUP_INTERVAL_SECONDS,
            ledger_path: PathBuf::from(DEFAULT_LEDGER_PATH),
            skip_dirs: DEFAULT_SKIP_DIRS.iter().map(|s| s.to_string()).collect(),
            skip_extensions: DEFAULT_SKIP_EXTENSIONS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            fs_retry_attempts: DEFAULT_FS_RETRY_ATTEMPTS,
        }
    }
}

/// The working directory stands in when no roots are configured.
fn default_protected_roots() -> Vec<PathBuf> {
    match std::env::current_dir() {
        Ok(dir) => vec![dir],
        Err(_) => vec![PathBuf::from(".")],
    }
}

impl GuardConfig {
    /// Build a configuration protecting exactly `roots`, with defaults elsewhere.
    pub fn with_roots<P: AsRef<Path>>(roots: impl IntoIterator<Item = P>) -> Self {
        Self {
            protected_roots: roots
                .into_iter()
                .map(|p| p.as_ref().to_path_buf())
                .collect(),
            ..Self::default()
        }
    }

    /// Parse a configuration document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let raw: toml::Value = toml::from_str(content)?;
        let has_roots = raw.get("protected_roots").is_some();
        let config: GuardConfig = raw.try_into()?;

        if !has_roots {
            warn!(
                "Configuration has no protected_roots, defaulting to {:?}",
                config.protected_roots
            );
        }

        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading configuration from {:?}", path);

        let content = fs::read_to_string(path).map_err(|e| {
            GuardError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let config = Self::from_toml_str(&content)?;
        info!(
            "Loaded configuration from {:?} with {} protected root(s)",
            path,
            config.protected_roots.len()
        );
        Ok(config)
    }

    /// Load a configuration file, falling back to the documented defaults
    /// when it is missing or malformed. The fallback is always logged.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                let config = Self::default();
                warn!(
                    "Unusable configuration at {:?} ({}); using defaults with protected roots {:?}",
                    path, e, config.protected_roots
                );
                config
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_ttl_seconds == 0 {
            return Err(GuardError::Config(
                "default_ttl_seconds must be greater than zero".to_string(),
            ));
        }
        if self.heartbeat_timeout_seconds == 0 {
            return Err(GuardError::Config(
                "heartbeat_timeout_seconds must be greater than zero".to_string(),
            ));
        }
        if self.heartbeat_check_interval_seconds == 0 || self.cleanup_interval_seconds == 0 {
            return Err(GuardError::Config(
                "check and cleanup intervals must be greater than zero".to_string(),
            ));
        }
        for (name, value) in [
            ("default_ttl_seconds", self.default_ttl_seconds),
            ("heartbeat_timeout_seconds", self.heartbeat_timeout_seconds),
            ("heartbeat_check_interval_seconds", self.heartbeat_check_interval_seconds),
            ("cleanup_interval_seconds", self.cleanup_interval_seconds),
        ] {
            if value > MAX_DURATION_SECONDS {
                return Err(GuardError::Config(format!(
                    "{} ({}) exceeds the maximum of {} seconds",
                    name, value, MAX_DURATION_SECONDS
                )));
            }
        }
        if self.heartbeat_check_interval_seconds >= self.heartbeat_timeout_seconds {
            return Err(GuardError::Config(format!(
                "heartbeat_check_interval_seconds ({}) must be shorter than heartbeat_timeout_seconds ({})",
                self.heartbeat_check_interval_seconds, self.heartbeat_timeout_seconds
            )));
        }
        if self.fs_retry_attempts == 0 {
            return Err(GuardError::Config(
                "fs_retry_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_seconds)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_seconds)
    }

    pub fn heartbeat_check_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_check_interval_seconds)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }
}
