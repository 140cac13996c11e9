//! Durable, cross-process view of the commands gitdep is running.
//!
//! Every execution owns one JSON record named after its pid, so concurrent
//! executions never contend on a shared file. Records are advisory: readers
//! repair the store by dropping entries whose process no longer exists.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

mod entry;
mod liveness;

pub use entry::{ProcessEntry, ProcessStatus};
pub use liveness::process_alive;

/// Name of the registry directory below the gitdep cache root.
pub const PROCESSES_DIR: &str = "processes";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRegistry {
    root: PathBuf,
}

impl ProcessRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn record_path(&self, pid: u32) -> PathBuf {
        self.root.join(format!("{pid}.json"))
    }

    pub fn register(&self, entry: &ProcessEntry) -> Result<()> {
        self.write_record(entry)?;
        debug!(pid = entry.pid, command = %entry.command, "registered process");
        Ok(())
    }

    pub fn deregister(&self, pid: u32) -> Result<()> {
        let path = self.record_path(pid);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(pid, "deregistered process");
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err)
                .with_context(|| format!("failed removing process record {}", path.display())),
        }
    }

    /// Records a new status for `pid`. A pid without a record is left alone
    /// so a late status update cannot resurrect a deregistered entry.
    pub fn update_status(&self, pid: u32, status: ProcessStatus) -> Result<()> {
        let Some(mut entry) = self.get(pid)? else {
            debug!(pid, "ignoring status update for unregistered process");
            return Ok(());
        };
        entry.status = status;
        self.write_record(&entry)
    }

    pub fn get(&self, pid: u32) -> Result<Option<ProcessEntry>> {
        read_record(&self.record_path(pid))
    }

    /// Lists records whose process is still alive, oldest first. Records of
    /// dead processes are removed along the way.
    pub fn list_active(&self) -> Result<Vec<ProcessEntry>> {
        let read_dir = match fs::read_dir(&self.root) {
            Ok(read_dir) => read_dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed reading process registry {}", self.root.display())
                });
            }
        };

        let mut entries = Vec::new();
        for dir_entry in read_dir {
            let dir_entry = dir_entry.with_context(|| {
                format!("failed iterating process registry {}", self.root.display())
            })?;
            let path = dir_entry.path();
            let Some(pid) = record_pid(&path) else {
                continue;
            };

            // A concurrent deregistration or a half-created file is not an
            // error for readers.
            let entry = match read_record(&path) {
                Ok(Some(entry)) => entry,
                Ok(None) => continue,
                Err(err) => {
                    debug!(path = %path.display(), "skipping unreadable process record: {err:#}");
                    continue;
                }
            };

            if entry.pid != pid {
                debug!(path = %path.display(), "skipping process record with mismatched pid");
                continue;
            }

            if process_alive(pid)? {
                entries.push(entry);
            } else {
                debug!(pid, "pruning process record of dead process");
                self.deregister(pid)?;
            }
        }

        entries.sort_by(|left, right| {
            left.start_time
                .cmp(&right.start_time)
                .then(left.pid.cmp(&right.pid))
        });
        Ok(entries)
    }

    pub fn list_active_for_repo(&self, repo: &Path) -> Result<Vec<ProcessEntry>> {
        let wanted = canonical_or_self(repo);
        Ok(self
            .list_active()?
            .into_iter()
            .filter(|entry| {
                entry
                    .repo
                    .as_deref()
                    .is_some_and(|owner| canonical_or_self(owner) == wanted)
            })
            .collect())
    }

    fn write_record(&self, entry: &ProcessEntry) -> Result<()> {
        fs::create_dir_all(&self.root).with_context(|| {
            format!("failed creating process registry {}", self.root.display())
        })?;

        let path = self.record_path(entry.pid);
        let mut payload =
            serde_json::to_vec_pretty(entry).context("failed serializing process record")?;
        payload.push(b'\n');

        let mut tmp = tempfile::Builder::new()
            .prefix(".record-")
            .tempfile_in(&self.root)
            .with_context(|| {
                format!("failed creating temp record in {}", self.root.display())
            })?;
        tmp.write_all(&payload)
            .with_context(|| format!("failed writing process record {}", path.display()))?;
        tmp.flush()
            .with_context(|| format!("failed flushing process record {}", path.display()))?;
        tmp.persist(&path)
            .map_err(|err| err.error)
            .with_context(|| format!("failed persisting process record {}", path.display()))?;
        Ok(())
    }
}

fn read_record(path: &Path) -> Result<Option<ProcessEntry>> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed reading process record {}", path.display()));
        }
    };
    let entry = serde_json::from_slice(&raw)
        .with_context(|| format!("failed parsing process record {}", path.display()))?;
    Ok(Some(entry))
}

fn record_pid(path: &Path) -> Option<u32> {
    if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

fn canonical_or_self(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
