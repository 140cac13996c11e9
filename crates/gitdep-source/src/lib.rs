//! Resolves dependency refs against their upstream git repositories.
//!
//! Git is treated as a versioned object store: every upstream gets one bare
//! mirror in the cache, refs are resolved to full commit ids there, and
//! `dependency.yaml` is read straight from the resolved commit.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context, Result};
use gitdep_core::{normalize_source, CommitId, DependencyConfig, DEPENDENCY_CONFIG_FILE};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

mod git_ops;

use git_ops::{run_git, run_git_clone_mirror, try_git};

/// One ref of one upstream, pinned to a commit.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRevision {
    pub commit: CommitId,
    pub config: DependencyConfig,
    /// Local copy of the upstream, when the resolver keeps one.
    pub checkout: Option<PathBuf>,
}

pub trait UpstreamResolver {
    fn resolve(&self, name: &str, source: &str, reference: &str) -> Result<ResolvedRevision>;
}

/// Resolver backed by bare mirrors under `<cache>/repos/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitUpstream {
    repos_dir: PathBuf,
}

impl GitUpstream {
    pub fn new(repos_dir: impl Into<PathBuf>) -> Self {
        Self {
            repos_dir: repos_dir.into(),
        }
    }

    pub fn mirror_path(&self, source: &str) -> Result<PathBuf> {
        let normalized = normalize_source(source)?;
        Ok(self.repos_dir.join(mirror_key(&normalized)))
    }

    /// Clones the mirror on first use and fetches it afterwards.
    pub fn sync_mirror(&self, name: &str, source: &str) -> Result<PathBuf> {
        let normalized = normalize_source(source)?;
        let mirror = self.repos_dir.join(mirror_key(&normalized));

        if mirror.join("HEAD").is_file() {
            debug!(dependency = name, mirror = %mirror.display(), "fetching upstream mirror");
            run_git(&mirror, &["fetch", "--tags", "--prune", "--quiet", "origin"], name)?;
            return Ok(mirror);
        }

        fs::create_dir_all(&self.repos_dir)
            .with_context(|| format!("failed to create {}", self.repos_dir.display()))?;
        let staged = self.repos_dir.join(format!(
            ".{}.tmp-{}-{}",
            mirror_key(&normalized),
            std::process::id(),
            unique_suffix()
        ));
        if let Err(err) = run_git_clone_mirror(&normalized, &staged, name) {
            let _ = fs::remove_dir_all(&staged);
            return Err(err);
        }

        if let Err(err) = fs::rename(&staged, &mirror) {
            let _ = fs::remove_dir_all(&staged);
            // Another process may have finished the same clone first.
            if !mirror.join("HEAD").is_file() {
                return Err(err).with_context(|| {
                    format!("failed to move mirror into place at {}", mirror.display())
                });
            }
        }
        info!(dependency = name, source = %normalized, "cloned upstream mirror");
        Ok(mirror)
    }

    pub fn resolve_commit(&self, mirror: &Path, name: &str, reference: &str) -> Result<CommitId> {
        validate_reference(reference)?;
        let rev = format!("{reference}^{{commit}}");
        let Some(stdout) = try_git(mirror, &["rev-parse", "--verify", "--quiet", &rev], name)?
        else {
            bail!("upstream-resolve-failed: ref '{reference}' of dependency '{name}' does not exist");
        };
        CommitId::parse(stdout.trim()).with_context(|| {
            format!("upstream-resolve-failed: git rev-parse returned an invalid commit for '{reference}'")
        })
    }

    /// Reads `dependency.yaml` at `commit`; a commit without one declares
    /// no changes and no commands.
    pub fn read_config(&self, mirror: &Path, name: &str, commit: &CommitId) -> Result<DependencyConfig> {
        let object = format!("{commit}:{DEPENDENCY_CONFIG_FILE}");
        if try_git(mirror, &["cat-file", "-e", &object], name)?.is_none() {
            debug!(dependency = name, %commit, "no {DEPENDENCY_CONFIG_FILE} at commit");
            return Ok(DependencyConfig::empty());
        }
        let raw = run_git(mirror, &["show", &object], name)?;
        let config = DependencyConfig::from_yaml_str(&raw).with_context(|| {
            format!("{DEPENDENCY_CONFIG_FILE} of dependency '{name}' at {} is invalid", commit.short())
        })?;
        Ok(config)
    }
}

impl UpstreamResolver for GitUpstream {
    fn resolve(&self, name: &str, source: &str, reference: &str) -> Result<ResolvedRevision> {
        let mirror = self.sync_mirror(name, source)?;
        let commit = self.resolve_commit(&mirror, name, reference)?;
        let config = self.read_config(&mirror, name, &commit)?;
        debug!(dependency = name, reference, %commit, "resolved upstream ref");
        Ok(ResolvedRevision {
            commit,
            config,
            checkout: Some(mirror),
        })
    }
}

fn mirror_key(normalized_source: &str) -> String {
    let digest = hex::encode(Sha256::digest(normalized_source.as_bytes()));
    digest[..16].to_string()
}

fn validate_reference(reference: &str) -> Result<()> {
    if reference.trim().is_empty() {
        return Err(anyhow!("ref must not be empty"));
    }
    if reference.starts_with('-') {
        return Err(anyhow!("ref '{reference}' must not start with '-'"));
    }
    if reference.chars().any(|ch| ch.is_whitespace() || ch.is_control()) {
        return Err(anyhow!("ref '{reference}' must not contain whitespace"));
    }
    Ok(())
}

fn unique_suffix() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default()
}
