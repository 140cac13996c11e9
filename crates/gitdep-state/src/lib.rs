//! On-disk state of a gitdep project: lock file, snapshots, upgrade claims
//! and the per-user cache layout.

mod claim;
mod fs_ops;
mod layout;
mod lock_store;
mod project;
mod snapshot;

pub use claim::{
    acquire_claim, list_claims, read_claim, release_claim, update_claim, ClaimError,
    UpgradeClaim, ROLLBACK_FAILED_STATE,
};
pub use fs_ops::{sha256_hex, write_atomic};
pub use layout::{default_cache_root, CacheLayout, ProjectLayout, CACHE_DIR_ENV};
pub use lock_store::{read_lock_file, write_lock_file};
pub use project::read_project_manifest;
pub use snapshot::{CapturedKind, CapturedPath, SnapshotId, SnapshotManifest, SnapshotStore};

/// Transaction ids end in the owning pid, like `tx-<unix-nanos>-<pid>`.
pub fn new_txid() -> anyhow::Result<String> {
    use anyhow::Context;

    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .context("system time is before unix epoch")?
        .as_nanos();
    Ok(format!("tx-{nanos}-{}", std::process::id()))
}
