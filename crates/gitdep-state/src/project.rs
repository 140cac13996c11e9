use std::fs;
use std::io;

use anyhow::{Context, Result};
use gitdep_core::ProjectManifest;

use crate::ProjectLayout;

/// Loads `gitdep.toml`; a project without one declares nothing.
pub fn read_project_manifest(layout: &ProjectLayout) -> Result<ProjectManifest> {
    let path = layout.manifest_path();
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(ProjectManifest::default()),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read project manifest: {}", path.display()));
        }
    };
    ProjectManifest::from_toml_str(&raw)
        .with_context(|| format!("failed parsing project manifest: {}", path.display()))
}
