use std::fs;
use std::io;
use std::path::Path;

use anyhow::{Context, Result};
use gitdep_core::LockFile;
use tracing::debug;

use crate::fs_ops::write_atomic;

/// Reads the lock file at `path`; `None` when it does not exist yet.
pub fn read_lock_file(path: &Path) -> Result<Option<LockFile>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read lock file: {}", path.display()));
        }
    };

    let lock = LockFile::from_yaml_str(&raw)
        .with_context(|| format!("failed parsing lock file: {}", path.display()))?;
    Ok(Some(lock))
}

pub fn write_lock_file(path: &Path, lock: &LockFile) -> Result<()> {
    let rendered = lock.to_yaml_string()?;
    write_atomic(path, rendered.as_bytes())
        .with_context(|| format!("failed to write lock file: {}", path.display()))?;
    debug!(path = %path.display(), entries = lock.dependencies.len(), "wrote lock file");
    Ok(())
}
