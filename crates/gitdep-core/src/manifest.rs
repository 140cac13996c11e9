use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::{normalize_source, validate_dependency_name};

pub const PROJECT_MANIFEST_FILE: &str = "gitdep.toml";

/// The consumer-side `gitdep.toml`: which dependencies are declared and
/// project-wide settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectManifest {
    #[serde(default)]
    pub settings: ProjectSettings,
    #[serde(default)]
    pub dependencies: BTreeMap<String, DeclaredDependency>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectSettings {
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclaredDependency {
    pub source: String,
}

impl ProjectManifest {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let mut manifest: Self =
            toml::from_str(input).context("failed to parse gitdep project manifest")?;

        for (name, dependency) in &mut manifest.dependencies {
            validate_dependency_name(name)?;
            dependency.source = normalize_source(&dependency.source)
                .with_context(|| format!("invalid source for dependency '{name}'"))?;
        }
        if manifest.settings.timeout_secs == Some(0) {
            return Err(anyhow!(
                "settings.timeout_secs must be greater than zero (omit it for no timeout)"
            ));
        }

        Ok(manifest)
    }

    pub fn source_for(&self, name: &str) -> Option<&str> {
        self.dependencies
            .get(name)
            .map(|dependency| dependency.source.as_str())
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.settings.timeout_secs.map(Duration::from_secs)
    }
}
