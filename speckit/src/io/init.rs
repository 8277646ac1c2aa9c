//! Project layout and `.speckit/` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::info;

use super::config::{SpeckitConfig, write_config};

/// Canonical paths for a project root.
#[derive(Debug, Clone)]
pub struct SpeckitPaths {
    pub root: PathBuf,
    pub speckit_dir: PathBuf,
    pub config_path: PathBuf,
    pub gitignore_path: PathBuf,
}

impl SpeckitPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let speckit_dir = root.join(".speckit");
        Self {
            root,
            config_path: speckit_dir.join("config.toml"),
            gitignore_path: speckit_dir.join(".gitignore"),
            speckit_dir,
        }
    }

    pub fn specs_dir(&self, cfg: &SpeckitConfig) -> PathBuf {
        self.root.join(&cfg.specs_dir)
    }

    pub fn sessions_path(&self, cfg: &SpeckitConfig) -> PathBuf {
        self.root.join(&cfg.sessions_path)
    }
}

#[derive(Debug, Clone)]
pub struct InitOptions {
    /// Overwrite an existing `.speckit/` config.
    pub force: bool,
}

/// Create `.speckit/config.toml`, its `.gitignore`, and the specs directory.
pub fn init_project(root: &Path, options: &InitOptions) -> Result<SpeckitPaths> {
    let paths = SpeckitPaths::new(root);
    if paths.speckit_dir.exists() && !paths.speckit_dir.is_dir() {
        return Err(anyhow!("speckit init: .speckit exists but is not a directory"));
    }
    if paths.config_path.exists() && !options.force {
        return Err(anyhow!(
            "speckit init: {} already exists (use --force to overwrite)",
            paths.config_path.display()
        ));
    }

    let cfg = SpeckitConfig::default();
    write_config(&paths.config_path, &cfg)?;
    fs::write(&paths.gitignore_path, SPECKIT_GITIGNORE)
        .with_context(|| format!("write file {}", paths.gitignore_path.display()))?;
    let specs_dir = paths.specs_dir(&cfg);
    fs::create_dir_all(&specs_dir)
        .with_context(|| format!("create directory {}", specs_dir.display()))?;

    info!(root = %paths.root.display(), "initialized speckit project");
    Ok(paths)
}

const SPECKIT_GITIGNORE: &str = "sessions.json\n*.tmp\n";
