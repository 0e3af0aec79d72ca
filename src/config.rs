//! Configuration
//!
//! Policy and paths are loaded from `~/.config/apex/config.toml`, overridable by
//! environment variables. `config.toml` presence/validity is itself one of the
//! fail-closed gate's registered conditions (SPEC_FULL.md §4.9).

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{ApexError, Result};

/// Top-level configuration, loaded once at process start.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApexConfig {
    /// Root directory for runtime state: `audit/`, `runs/`, `runtime.db`, locks.
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,

    #[serde(default)]
    pub risk: RiskConfig,

    #[serde(default)]
    pub sandbox: SandboxConfig,

    #[serde(default)]
    pub writer_queue: WriterQueueConfig,

    /// Path to the kill-switch sentinel file.
    #[serde(default = "default_kill_switch_path")]
    pub kill_switch_path: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RiskConfig {
    /// Optional path to a git tag prefix for daily audit anchors.
    pub git_tag_prefix: Option<String>,
    /// Minimum free disk space (bytes) required by the disk-space gate condition.
    pub min_disk_space_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SandboxConfig {
    /// "none", "ulimit", "docker", or "auto" to probe at startup.
    #[serde(default = "default_sandbox_level")]
    pub level: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            level: default_sandbox_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WriterQueueConfig {
    #[serde(default = "default_flush_ms")]
    pub flush_ms: u64,
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    #[serde(default = "default_max_crash_restarts")]
    pub max_crash_restarts: u32,
}

impl Default for WriterQueueConfig {
    fn default() -> Self {
        Self {
            flush_ms: default_flush_ms(),
            max_batch: default_max_batch(),
            queue_size: default_queue_size(),
            max_crash_restarts: default_max_crash_restarts(),
        }
    }
}

fn default_base_dir() -> PathBuf {
    dirs::data_dir().unwrap_or_else(|| PathBuf::from(".")).join("apex")
}

fn default_kill_switch_path() -> PathBuf {
    default_base_dir().join("KILL")
}

fn default_sandbox_level() -> String {
    "auto".to_string()
}

fn default_flush_ms() -> u64 {
    50
}

fn default_max_batch() -> usize {
    100
}

fn default_queue_size() -> usize {
    1000
}

fn default_max_crash_restarts() -> u32 {
    3
}

impl Default for ApexConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            risk: RiskConfig::default(),
            sandbox: SandboxConfig::default(),
            writer_queue: WriterQueueConfig::default(),
            kill_switch_path: default_kill_switch_path(),
        }
    }
}

impl ApexConfig {
    pub fn config_dir() -> PathBuf {
        dirs::config_dir().unwrap_or_else(|| PathBuf::from(".")).join("apex")
    }

    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Loads from `config_path()`, returning defaults if the file is absent. A
    /// malformed file is an error (the fail-closed gate treats this as a deny).
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).map_err(|e| ApexError::ConfigError {
            reason: format!("failed to read config file: {e}"),
        })?;
        toml::from_str(&content).map_err(|e| ApexError::ConfigError {
            reason: format!("failed to parse config file: {e}"),
        })
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::config_dir();
        fs::create_dir_all(&dir).map_err(|e| ApexError::ConfigError {
            reason: format!("failed to create config directory: {e}"),
        })?;
        let content = toml::to_string_pretty(self).map_err(|e| ApexError::ConfigError {
            reason: format!("failed to serialise config: {e}"),
        })?;
        fs::write(Self::config_path(), content).map_err(|e| ApexError::ConfigError {
            reason: format!("failed to write config file: {e}"),
        })?;
        Ok(())
    }

    /// Environment overrides take precedence over the file: `APEX_BASE_DIR`,
    /// `APEX_KILL_SWITCH_PATH`.
    pub fn with_env(mut self) -> Self {
        if let Ok(dir) = std::env::var("APEX_BASE_DIR") {
            if !dir.is_empty() {
                self.base_dir = PathBuf::from(dir);
            }
        }
        if let Ok(path) = std::env::var("APEX_KILL_SWITCH_PATH") {
            if !path.is_empty() {
                self.kill_switch_path = PathBuf::from(path);
            }
        }
        self
    }

    pub fn audit_dir(&self) -> PathBuf {
        self.base_dir.join("audit")
    }

    pub fn db_path(&self) -> PathBuf {
        self.base_dir.join("runtime.db")
    }

    pub fn wal_path(&self) -> PathBuf {
        self.base_dir.join("actions_wal.jsonl")
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.base_dir.join("runs")
    }

    pub fn global_lock_path(&self) -> PathBuf {
        self.base_dir.join("apex.lock")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn default_config_derives_paths_under_base_dir() {
        let config = ApexConfig::default();
        assert_eq!(config.audit_dir(), config.base_dir.join("audit"));
        assert_eq!(config.db_path(), config.base_dir.join("runtime.db"));
    }

    #[test]
    fn load_nonexistent_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let config = ApexConfig::load_from(&path).unwrap();
        assert_eq!(config, ApexConfig::default());
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = ApexConfig::default();
        config.base_dir = dir.path().join("state");
        config.writer_queue.max_batch = 42;

        let content = toml::to_string_pretty(&config).unwrap();
        fs::write(&path, content).unwrap();

        let loaded = ApexConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "not valid = [[[ toml").unwrap();
        let err = ApexConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, ApexError::ConfigError { .. }));
    }

    #[test]
    fn env_overrides_base_dir() {
        env::set_var("APEX_BASE_DIR", "/tmp/apex-env-test");
        let config = ApexConfig::default().with_env();
        assert_eq!(config.base_dir, PathBuf::from("/tmp/apex-env-test"));
        env::remove_var("APEX_BASE_DIR");
    }

    #[test]
    fn empty_env_var_does_not_override() {
        env::set_var("APEX_BASE_DIR", "");
        let default_dir = ApexConfig::default().base_dir;
        let config = ApexConfig::default().with_env();
        assert_eq!(config.base_dir, default_dir);
        env::remove_var("APEX_BASE_DIR");
    }
}
