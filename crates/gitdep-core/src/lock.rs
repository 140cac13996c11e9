use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::timestamp::{format_rfc3339, parse_rfc3339};
use crate::validation::{validate_dependency_name, ValidationError, ValidationIssue};
use crate::{normalize_source, CommitId};

pub const LOCK_API_VERSION: &str = "gitdep/v1";
pub const LOCK_FILE_NAME: &str = "dependency.lock";

const SUBJECT: &str = "lock file";

/// The recorded, currently consumed revision of one dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockEntry {
    pub source: String,
    pub reference: String,
    pub commit: CommitId,
    pub consumed_at: OffsetDateTime,
}

impl LockEntry {
    pub fn new(
        source: &str,
        reference: &str,
        commit: CommitId,
        consumed_at: OffsetDateTime,
    ) -> Result<Self> {
        let source = normalize_source(source)?;
        if reference.trim().is_empty() {
            return Err(anyhow!("lock entry ref must not be empty"));
        }
        Ok(Self {
            source,
            reference: reference.trim().to_string(),
            commit,
            consumed_at,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockFile {
    pub api_version: String,
    pub dependencies: BTreeMap<String, LockEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawLockFile {
    #[serde(rename = "apiVersion")]
    api_version: Option<String>,
    #[serde(default)]
    dependencies: BTreeMap<String, RawLockEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawLockEntry {
    source: String,
    #[serde(rename = "ref")]
    reference: String,
    commit: String,
    consumed_at: String,
}

impl Default for LockFile {
    fn default() -> Self {
        Self::new()
    }
}

impl LockFile {
    pub fn new() -> Self {
        Self {
            api_version: LOCK_API_VERSION.to_string(),
            dependencies: BTreeMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&LockEntry> {
        self.dependencies.get(name)
    }

    /// Returns a new lock file with `name` set to `entry`, replacing any
    /// previous entry of that name.
    pub fn with_entry(&self, name: &str, entry: LockEntry) -> Result<Self> {
        validate_dependency_name(name)?;
        let mut next = self.clone();
        next.dependencies.insert(name.to_string(), entry);
        Ok(next)
    }

    /// Accepts entries in any order; rejects malformed hashes, timestamps and
    /// unknown API versions rather than coercing them.
    pub fn from_yaml_str(input: &str) -> Result<Self, ValidationError> {
        let raw = serde_yaml::from_str::<RawLockFile>(input).map_err(|err| {
            ValidationError::single(SUBJECT, "", format!("malformed YAML: {err}"))
        })?;

        let mut issues = Vec::new();
        match raw.api_version.as_deref().map(str::trim) {
            None => issues.push(ValidationIssue::new("apiVersion", "missing apiVersion")),
            Some(LOCK_API_VERSION) => {}
            Some(other) => issues.push(ValidationIssue::new(
                "apiVersion",
                format!("unsupported apiVersion '{other}' (expected '{LOCK_API_VERSION}')"),
            )),
        }

        let mut dependencies = BTreeMap::new();
        for (name, raw_entry) in raw.dependencies {
            let field = format!("dependencies.{name}");
            if let Err(err) = validate_dependency_name(&name) {
                issues.push(ValidationIssue::new(&field, err.to_string()));
                continue;
            }

            let before = issues.len();
            let source = match normalize_source(&raw_entry.source) {
                Ok(source) => Some(source),
                Err(err) => {
                    issues.push(ValidationIssue::new(
                        format!("{field}.source"),
                        err.to_string(),
                    ));
                    None
                }
            };
            if raw_entry.reference.trim().is_empty() {
                issues.push(ValidationIssue::new(
                    format!("{field}.ref"),
                    "ref must not be empty",
                ));
            }
            let commit = match CommitId::parse(&raw_entry.commit) {
                Ok(commit) => Some(commit),
                Err(err) => {
                    issues.push(ValidationIssue::new(
                        format!("{field}.commit"),
                        err.to_string(),
                    ));
                    None
                }
            };
            let consumed_at = match parse_rfc3339(&raw_entry.consumed_at) {
                Ok(consumed_at) => Some(consumed_at),
                Err(err) => {
                    issues.push(ValidationIssue::new(
                        format!("{field}.consumed_at"),
                        format!("{err:#}"),
                    ));
                    None
                }
            };

            if issues.len() > before {
                continue;
            }
            if let (Some(source), Some(commit), Some(consumed_at)) = (source, commit, consumed_at) {
                dependencies.insert(
                    name,
                    LockEntry {
                        source,
                        reference: raw_entry.reference.trim().to_string(),
                        commit,
                        consumed_at,
                    },
                );
            }
        }

        if !issues.is_empty() {
            return Err(ValidationError::new(SUBJECT, issues));
        }

        Ok(Self {
            api_version: LOCK_API_VERSION.to_string(),
            dependencies,
        })
    }

    /// Entries are emitted in name order so lock diffs stay small.
    pub fn to_yaml_string(&self) -> Result<String> {
        let mut dependencies = BTreeMap::new();
        for (name, entry) in &self.dependencies {
            dependencies.insert(
                name.clone(),
                RawLockEntry {
                    source: entry.source.clone(),
                    reference: entry.reference.clone(),
                    commit: entry.commit.to_string(),
                    consumed_at: format_rfc3339(&entry.consumed_at)?,
                },
            );
        }
        let raw = RawLockFile {
            api_version: Some(self.api_version.clone()),
            dependencies,
        };
        serde_yaml::to_string(&raw).context("failed serializing lock file")
    }
}
