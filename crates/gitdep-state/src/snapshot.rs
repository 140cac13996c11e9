use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use gitdep_core::timestamp::now_utc;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::fs_ops::{copy_dir_recursive, remove_path, sha256_hex, write_atomic};

const MANIFEST_FILE: &str = "manifest.json";
const SNAPSHOT_FORMAT_VERSION: u32 = 1;

static SNAPSHOT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(String);

impl SnapshotId {
    fn generate() -> Result<Self> {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("system time is before unix epoch")?
            .as_nanos();
        let sequence = SNAPSHOT_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        Ok(Self(format!(
            "snap-{nanos}-{}-{sequence}",
            std::process::id()
        )))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let valid = raw.starts_with("snap-")
            && raw.len() > "snap-".len()
            && raw
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');
        if !valid {
            return Err(anyhow!("invalid snapshot id '{raw}'"));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapturedKind {
    File,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedPath {
    pub original: PathBuf,
    pub existed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<CapturedKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stored: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub version: u32,
    pub id: SnapshotId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub paths: Vec<CapturedPath>,
}

/// Restorable copies of project files, one directory per snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn snapshot_dir(&self, id: &SnapshotId) -> PathBuf {
        self.root.join(id.as_str())
    }

    pub fn exists(&self, id: &SnapshotId) -> bool {
        self.snapshot_dir(id).join(MANIFEST_FILE).is_file()
    }

    /// Captures `paths` as they are now. Paths that do not exist are
    /// recorded as absent so a restore removes them again.
    pub fn create(&self, paths: &[PathBuf]) -> Result<SnapshotId> {
        let id = SnapshotId::generate()?;
        let dir = self.snapshot_dir(&id);
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create snapshot dir {}", dir.display()))?;

        match self.capture_all(&dir, paths) {
            Ok(captured) => {
                let manifest = SnapshotManifest {
                    version: SNAPSHOT_FORMAT_VERSION,
                    id: id.clone(),
                    created_at: now_utc(),
                    paths: captured,
                };
                let mut rendered = serde_json::to_vec_pretty(&manifest)
                    .context("failed serializing snapshot manifest")?;
                rendered.push(b'\n');
                // The manifest goes last: a snapshot without one is incomplete.
                if let Err(err) = write_atomic(&dir.join(MANIFEST_FILE), &rendered) {
                    let _ = remove_path(&dir);
                    return Err(err);
                }
            }
            Err(err) => {
                let _ = remove_path(&dir);
                return Err(err);
            }
        }

        info!(snapshot = %id, paths = paths.len(), "created snapshot");
        Ok(id)
    }

    fn capture_all(&self, dir: &Path, paths: &[PathBuf]) -> Result<Vec<CapturedPath>> {
        let mut captured = Vec::with_capacity(paths.len());
        for (index, original) in paths.iter().enumerate() {
            let metadata = match fs::metadata(original) {
                Ok(metadata) => metadata,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    captured.push(CapturedPath {
                        original: original.clone(),
                        existed: false,
                        kind: None,
                        stored: None,
                        sha256: None,
                    });
                    continue;
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed to inspect {}", original.display()));
                }
            };

            let stored = format!("{index}");
            if metadata.is_dir() {
                copy_dir_recursive(original, &dir.join(&stored))?;
                captured.push(CapturedPath {
                    original: original.clone(),
                    existed: true,
                    kind: Some(CapturedKind::Directory),
                    stored: Some(stored),
                    sha256: None,
                });
            } else {
                let contents = fs::read(original)
                    .with_context(|| format!("failed to read {}", original.display()))?;
                fs::write(dir.join(&stored), &contents).with_context(|| {
                    format!("failed to store snapshot copy of {}", original.display())
                })?;
                captured.push(CapturedPath {
                    original: original.clone(),
                    existed: true,
                    kind: Some(CapturedKind::File),
                    stored: Some(stored),
                    sha256: Some(sha256_hex(&contents)),
                });
            }
        }
        Ok(captured)
    }

    pub fn read_manifest(&self, id: &SnapshotId) -> Result<SnapshotManifest> {
        let path = self.snapshot_dir(id).join(MANIFEST_FILE);
        let raw = fs::read(&path)
            .with_context(|| format!("failed to read snapshot manifest {}", path.display()))?;
        serde_json::from_slice(&raw)
            .with_context(|| format!("failed parsing snapshot manifest {}", path.display()))
    }

    /// Puts every captured path back the way it was. Running it twice has
    /// the same effect as running it once.
    pub fn restore(&self, id: &SnapshotId) -> Result<()> {
        let manifest = self.read_manifest(id)?;
        let dir = self.snapshot_dir(id);

        for captured in &manifest.paths {
            let original = &captured.original;
            if !captured.existed {
                remove_path(original)?;
                continue;
            }

            let stored = captured
                .stored
                .as_deref()
                .map(|stored| dir.join(stored))
                .ok_or_else(|| {
                    anyhow!(
                        "snapshot {id} has no stored copy of {}",
                        original.display()
                    )
                })?;

            match captured.kind {
                Some(CapturedKind::File) => {
                    let contents = fs::read(&stored).with_context(|| {
                        format!("failed to read snapshot copy {}", stored.display())
                    })?;
                    if let Some(expected) = &captured.sha256 {
                        let actual = sha256_hex(&contents);
                        if &actual != expected {
                            return Err(anyhow!(
                                "snapshot copy of {} is corrupt (expected sha256 {expected}, found {actual})",
                                original.display()
                            ));
                        }
                    }
                    if fs::symlink_metadata(original).is_ok_and(|metadata| metadata.is_dir()) {
                        remove_path(original)?;
                    }
                    write_atomic(original, &contents)?;
                }
                Some(CapturedKind::Directory) => {
                    copy_dir_recursive(&stored, original)?;
                }
                None => {
                    return Err(anyhow!(
                        "snapshot {id} does not record the kind of {}",
                        original.display()
                    ));
                }
            }
        }

        info!(snapshot = %id, "restored snapshot");
        Ok(())
    }

    pub fn delete(&self, id: &SnapshotId) -> Result<()> {
        remove_path(&self.snapshot_dir(id))?;
        debug!(snapshot = %id, "deleted snapshot");
        Ok(())
    }

    /// Complete snapshots, oldest first.
    pub fn list(&self) -> Result<Vec<SnapshotId>> {
        let read_dir = match fs::read_dir(&self.root) {
            Ok(read_dir) => read_dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed reading snapshots {}", self.root.display()));
            }
        };

        let mut ids = Vec::new();
        for entry in read_dir {
            let entry = entry
                .with_context(|| format!("failed iterating snapshots {}", self.root.display()))?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let Ok(id) = SnapshotId::parse(&name) else {
                continue;
            };
            if self.exists(&id) {
                ids.push(id);
            }
        }

        ids.sort_by_key(|id| snapshot_sort_key(id.as_str()));
        Ok(ids)
    }
}

fn snapshot_sort_key(id: &str) -> (u128, u64, String) {
    let mut parts = id.trim_start_matches("snap-").split('-');
    let nanos = parts.next().and_then(|part| part.parse().ok()).unwrap_or(0);
    let _pid = parts.next();
    let sequence = parts.next().and_then(|part| part.parse().ok()).unwrap_or(0);
    (nanos, sequence, id.to_string())
}
