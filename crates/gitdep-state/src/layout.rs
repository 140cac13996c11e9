use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use gitdep_core::{LOCK_FILE_NAME, PROJECT_MANIFEST_FILE};
use gitdep_registry::PROCESSES_DIR;

/// Overrides the per-user cache root.
pub const CACHE_DIR_ENV: &str = "GITDEP_CACHE_DIR";

/// Paths inside one consumer project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectLayout {
    root: PathBuf,
}

impl ProjectLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(PROJECT_MANIFEST_FILE)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join(LOCK_FILE_NAME)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join(".gitdep")
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.state_dir().join("snapshots")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.state_dir().join("logs")
    }

    pub fn step_log_path(&self, dependency: &str, txid: &str, step: &str) -> PathBuf {
        self.logs_dir()
            .join(format!("{dependency}-{txid}-{step}.log"))
    }

    pub fn upgrades_dir(&self) -> PathBuf {
        self.state_dir().join("upgrades")
    }

    pub fn claim_path(&self, dependency: &str) -> PathBuf {
        self.upgrades_dir().join(format!("{dependency}.json"))
    }

    /// File locked while a stale claim of `dependency` is taken over.
    pub fn claim_guard_path(&self, dependency: &str) -> PathBuf {
        self.upgrades_dir().join(format!("{dependency}.reclaim"))
    }

    pub fn ensure_state_dirs(&self) -> Result<()> {
        for dir in [self.snapshots_dir(), self.logs_dir(), self.upgrades_dir()] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

/// Per-user cache shared by every project: upstream mirrors and the
/// process registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLayout {
    root: PathBuf,
}

impl CacheLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `GITDEP_CACHE_DIR`, else the platform cache directory.
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(default_cache_root()?))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn processes_dir(&self) -> PathBuf {
        self.root.join(PROCESSES_DIR)
    }

    pub fn repos_dir(&self) -> PathBuf {
        self.root.join("repos")
    }

    pub fn mirror_dir(&self, key: &str) -> PathBuf {
        self.repos_dir().join(key)
    }
}

pub fn default_cache_root() -> Result<PathBuf> {
    if let Some(value) = std::env::var_os(CACHE_DIR_ENV).filter(|value| !value.is_empty()) {
        return Ok(PathBuf::from(value));
    }
    dirs::cache_dir()
        .map(|dir| dir.join("gitdep"))
        .ok_or_else(|| anyhow!("could not determine a cache directory; set {CACHE_DIR_ENV}"))
}
