use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use fs2::FileExt;
use gitdep_registry::process_alive;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::fs_ops::write_atomic;
use crate::snapshot::{SnapshotId, SnapshotStore};
use crate::ProjectLayout;

/// Claim state that blocks further upgrades until `gitdep repair`.
pub const ROLLBACK_FAILED_STATE: &str = "rollback_failed";

/// The per-dependency marker an in-flight upgrade holds. It doubles as the
/// upgrade's journal: the orchestrator rewrites it on every transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeClaim {
    pub txid: String,
    pub pid: u32,
    pub dependency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_ref: Option<String>,
    pub to_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
    pub state: String,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
}

impl UpgradeClaim {
    pub fn requires_repair(&self) -> bool {
        self.state == ROLLBACK_FAILED_STATE
    }
}

#[derive(Debug, Error)]
pub enum ClaimError {
    #[error("upgrade of '{dependency}' already in progress (txid={txid} pid={pid})")]
    InProgress {
        dependency: String,
        txid: String,
        pid: u32,
    },
    #[error(
        "dependency '{dependency}' requires repair (reason=rollback_failed txid={txid}); inspect the project and run `gitdep repair {dependency}`"
    )]
    RequiresRepair { dependency: String, txid: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Claims `claim.dependency` for `claim.txid`. A leftover claim of a dead
/// process is reclaimed unless its rollback failed.
pub fn acquire_claim(layout: &ProjectLayout, claim: &UpgradeClaim) -> Result<PathBuf, ClaimError> {
    let path = layout.claim_path(&claim.dependency);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let rendered = render_claim(claim)?;

    // A stale claim is removed at most once per attempt; the last attempt
    // reports contention instead of looping.
    for _ in 0..3 {
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                file.write_all(&rendered)
                    .with_context(|| format!("failed to write claim {}", path.display()))?;
                file.flush()
                    .with_context(|| format!("failed to flush claim {}", path.display()))?;
                debug!(dependency = %claim.dependency, txid = %claim.txid, "claimed upgrade");
                return Ok(path);
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                let existing = match read_claim(layout, &claim.dependency) {
                    Ok(Some(existing)) => existing,
                    // Released between our open and our read.
                    Ok(None) => continue,
                    Err(err) => {
                        return Err(ClaimError::Other(err.context(format!(
                            "upgrade claim for '{}' requires repair (reason=claim_unreadable path={})",
                            claim.dependency,
                            path.display()
                        ))));
                    }
                };

                if existing.requires_repair() {
                    return Err(ClaimError::RequiresRepair {
                        dependency: claim.dependency.clone(),
                        txid: existing.txid,
                    });
                }
                if process_alive(existing.pid)? {
                    return Err(ClaimError::InProgress {
                        dependency: claim.dependency.clone(),
                        txid: existing.txid,
                        pid: existing.pid,
                    });
                }

                reclaim_stale_claim(layout, &existing)?;
            }
            Err(err) => {
                return Err(ClaimError::Other(anyhow::Error::new(err).context(format!(
                    "failed to claim upgrade marker {}",
                    path.display()
                ))));
            }
        }
    }

    Err(ClaimError::Other(anyhow!(
        "failed to claim upgrade marker {} (reason=claim_contended)",
        path.display()
    )))
}

/// Removes `stale` if it is still the claim on disk. Takeovers are
/// serialized through an OS file lock, so a claim written by a concurrent
/// winner is never deleted. The lock is released with the file handle,
/// also when the process dies.
fn reclaim_stale_claim(layout: &ProjectLayout, stale: &UpgradeClaim) -> Result<()> {
    let guard_path = layout.claim_guard_path(&stale.dependency);
    let guard = fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(&guard_path)
        .with_context(|| format!("failed to open claim guard {}", guard_path.display()))?;
    FileExt::lock_exclusive(&guard)
        .with_context(|| format!("failed to lock claim guard {}", guard_path.display()))?;

    let current = read_claim(layout, &stale.dependency)?;
    if current.as_ref().map(|claim| claim.txid.as_str()) != Some(stale.txid.as_str()) {
        debug!(
            dependency = %stale.dependency,
            stale_txid = %stale.txid,
            "stale claim already taken over"
        );
        return Ok(());
    }

    warn!(
        dependency = %stale.dependency,
        stale_txid = %stale.txid,
        state = %stale.state,
        "reclaiming upgrade claim left by a dead process"
    );
    release_claim(layout, &stale.dependency)?;
    discard_orphaned_snapshot(layout, stale);
    Ok(())
}

/// The dead transaction never committed or rolled back, so its snapshot has
/// no owner left. The lock file itself is only ever replaced atomically.
fn discard_orphaned_snapshot(layout: &ProjectLayout, stale: &UpgradeClaim) {
    let Some(raw) = stale.snapshot_id.as_deref() else {
        return;
    };
    let result = SnapshotId::parse(raw)
        .and_then(|id| SnapshotStore::new(layout.snapshots_dir()).delete(&id));
    match result {
        Ok(()) => warn!(
            dependency = %stale.dependency,
            snapshot = raw,
            "discarded snapshot of reclaimed upgrade"
        ),
        Err(err) => warn!(
            dependency = %stale.dependency,
            snapshot = raw,
            "failed to discard snapshot of reclaimed upgrade: {err:#}"
        ),
    }
}

pub fn read_claim(layout: &ProjectLayout, dependency: &str) -> Result<Option<UpgradeClaim>> {
    let path = layout.claim_path(dependency);
    let raw = match fs::read(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read claim {}", path.display()));
        }
    };
    let claim = serde_json::from_slice(&raw)
        .with_context(|| format!("failed parsing claim {}", path.display()))?;
    Ok(Some(claim))
}

/// Rewrites a held claim, typically with a new `state`.
pub fn update_claim(layout: &ProjectLayout, claim: &UpgradeClaim) -> Result<()> {
    let path = layout.claim_path(&claim.dependency);
    write_atomic(&path, &render_claim(claim)?)
        .with_context(|| format!("failed to update claim {}", path.display()))
}

pub fn release_claim(layout: &ProjectLayout, dependency: &str) -> Result<()> {
    let path = layout.claim_path(dependency);
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => {
            Err(err).with_context(|| format!("failed to release claim {}", path.display()))
        }
    }
}

/// Every claim currently on disk, by dependency name.
pub fn list_claims(layout: &ProjectLayout) -> Result<Vec<UpgradeClaim>> {
    let dir = layout.upgrades_dir();
    let read_dir = match fs::read_dir(&dir) {
        Ok(read_dir) => read_dir,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed reading {}", dir.display()));
        }
    };

    let mut claims = Vec::new();
    for entry in read_dir {
        let entry = entry.with_context(|| format!("failed iterating {}", dir.display()))?;
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            continue;
        }
        let Some(dependency) = path.file_stem().and_then(|stem| stem.to_str()) else {
            continue;
        };
        if let Some(claim) = read_claim(layout, dependency)? {
            claims.push(claim);
        }
    }
    claims.sort_by(|left, right| left.dependency.cmp(&right.dependency));
    Ok(claims)
}

fn render_claim(claim: &UpgradeClaim) -> Result<Vec<u8>> {
    let mut rendered =
        serde_json::to_vec_pretty(claim).context("failed serializing upgrade claim")?;
    rendered.push(b'\n');
    Ok(rendered)
}
