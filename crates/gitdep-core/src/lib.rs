mod change;
mod command;
mod commit;
mod config;
mod lock;
mod manifest;
mod source;
pub mod timestamp;
mod validation;

pub use change::Change;
pub use command::{parse_command_ref, Command};
pub use commit::{CommitId, InvalidCommitId};
pub use config::{DependencyConfig, CONFIG_API_VERSION, DEPENDENCY_CONFIG_FILE};
pub use lock::{LockEntry, LockFile, LOCK_API_VERSION, LOCK_FILE_NAME};
pub use manifest::{DeclaredDependency, ProjectManifest, ProjectSettings, PROJECT_MANIFEST_FILE};
pub use source::normalize_source;
pub use validation::{validate_dependency_name, ValidationError, ValidationIssue};

#[cfg(test)]
mod tests;
