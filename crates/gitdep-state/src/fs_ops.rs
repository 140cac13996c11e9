use std::collections::VecDeque;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha256};

/// Writes `data` to a temp file next to `path` and renames it into place,
/// so readers see either the old or the new contents.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create {}", parent.display()))?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".gitdep-tmp-")
        .tempfile_in(parent)
        .with_context(|| format!("failed creating temp file in {}", parent.display()))?;
    tmp.write_all(data)
        .with_context(|| format!("failed writing {}", path.display()))?;
    tmp.flush()
        .with_context(|| format!("failed flushing {}", path.display()))?;
    tmp.as_file()
        .sync_all()
        .with_context(|| format!("failed syncing {}", path.display()))?;
    tmp.persist(path)
        .map_err(|err| err.error)
        .with_context(|| format!("failed replacing {}", path.display()))?;
    Ok(())
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Removes a file or directory tree; a missing path is not an error.
pub fn remove_path(path: &Path) -> Result<()> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to inspect {}", path.display()));
        }
    };
    if metadata.is_dir() {
        fs::remove_dir_all(path)
            .with_context(|| format!("failed to remove directory {}", path.display()))
    } else {
        fs::remove_file(path).with_context(|| format!("failed to remove {}", path.display()))
    }
}

pub fn copy_dir_recursive(source_root: &Path, destination_root: &Path) -> Result<()> {
    if !source_root.is_dir() {
        return Err(anyhow!(
            "copy source is not a directory: {}",
            source_root.display()
        ));
    }

    remove_path(destination_root)?;
    fs::create_dir_all(destination_root)
        .with_context(|| format!("failed creating directory {}", destination_root.display()))?;

    let mut queue: VecDeque<(PathBuf, PathBuf)> = VecDeque::new();
    queue.push_back((source_root.to_path_buf(), destination_root.to_path_buf()));

    while let Some((from_dir, to_dir)) = queue.pop_front() {
        for entry in fs::read_dir(&from_dir)
            .with_context(|| format!("failed reading directory {}", from_dir.display()))?
        {
            let entry = entry
                .with_context(|| format!("failed iterating directory {}", from_dir.display()))?;
            let file_type = entry
                .file_type()
                .with_context(|| format!("failed reading type of {}", entry.path().display()))?;
            let source = entry.path();
            let destination = to_dir.join(entry.file_name());

            if file_type.is_dir() {
                fs::create_dir_all(&destination).with_context(|| {
                    format!("failed creating directory {}", destination.display())
                })?;
                queue.push_back((source, destination));
            } else {
                fs::copy(&source, &destination).with_context(|| {
                    format!(
                        "failed copying {} to {}",
                        source.display(),
                        destination.display()
                    )
                })?;
            }
        }
    }

    Ok(())
}
