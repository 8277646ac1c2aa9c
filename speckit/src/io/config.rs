//! Project configuration stored under `.speckit/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::SpeckitError;

/// Speckit configuration (TOML).
///
/// Meant to be edited by hand. Missing fields fall back to defaults, and a
/// missing file is the same as an empty one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SpeckitConfig {
    /// Directory holding one `<branch>/` folder per feature, relative to the project root.
    pub specs_dir: PathBuf,

    /// Session map location, relative to the project root.
    pub sessions_path: PathBuf,

    /// Value passed to the agent's `--permission-mode`.
    pub permission_mode: String,

    /// Wall-clock limit for one agent workflow.
    pub agent_timeout_secs: u64,

    pub agent_max_turns: u32,

    /// Agent executable.
    pub agent_command: String,

    /// Tracker CLI executable.
    pub tracker_command: String,

    pub tracker_timeout_secs: u64,

    /// Truncate tracker stdout/stderr beyond this many bytes.
    pub tracker_output_limit_bytes: usize,

    /// Maximum issues fetched per listing.
    pub issue_list_limit: u32,

    /// Abort a multi-step run on the first failed workflow.
    pub stop_on_error: bool,
}

impl Default for SpeckitConfig {
    fn default() -> Self {
        Self {
            specs_dir: PathBuf::from("specs"),
            sessions_path: PathBuf::from(".speckit/sessions.json"),
            permission_mode: "acceptEdits".to_string(),
            agent_timeout_secs: 10 * 60,
            agent_max_turns: 50,
            agent_command: "claude".to_string(),
            tracker_command: "gh".to_string(),
            tracker_timeout_secs: 60,
            tracker_output_limit_bytes: 1_000_000,
            issue_list_limit: 100,
            stop_on_error: true,
        }
    }
}

impl SpeckitConfig {
    pub fn validate(&self) -> Result<(), SpeckitError> {
        if self.agent_timeout_secs == 0 {
            return Err(SpeckitError::config("agent_timeout_secs must be > 0"));
        }
        if self.agent_max_turns == 0 {
            return Err(SpeckitError::config("agent_max_turns must be > 0"));
        }
        if self.tracker_timeout_secs == 0 {
            return Err(SpeckitError::config("tracker_timeout_secs must be > 0"));
        }
        if self.tracker_output_limit_bytes == 0 {
            return Err(SpeckitError::config("tracker_output_limit_bytes must be > 0"));
        }
        if self.issue_list_limit == 0 {
            return Err(SpeckitError::config("issue_list_limit must be > 0"));
        }
        if self.agent_command.trim().is_empty() {
            return Err(SpeckitError::config("agent_command must not be empty"));
        }
        if self.tracker_command.trim().is_empty() {
            return Err(SpeckitError::config("tracker_command must not be empty"));
        }
        if self.permission_mode.trim().is_empty() {
            return Err(SpeckitError::config("permission_mode must not be empty"));
        }
        if self.specs_dir.as_os_str().is_empty() {
            return Err(SpeckitError::config("specs_dir must not be empty"));
        }
        Ok(())
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs)
    }

    pub fn tracker_timeout(&self) -> Duration {
        Duration::from_secs(self.tracker_timeout_secs)
    }
}

/// Load config from a TOML file, or defaults if it does not exist.
pub fn load_config(path: &Path) -> Result<SpeckitConfig> {
    if !path.exists() {
        return Ok(SpeckitConfig::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: SpeckitConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &SpeckitConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
