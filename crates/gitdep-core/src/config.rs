use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};

use serde::Deserialize;
use serde_yaml::{Mapping, Value};

use crate::validation::{ValidationError, ValidationIssue};
use crate::{Change, Command};

pub const CONFIG_API_VERSION: &str = "gitdep/v1";
pub const DEPENDENCY_CONFIG_FILE: &str = "dependency.yaml";

const SUBJECT: &str = "dependency configuration";

/// The validated contents of an upstream `dependency.yaml`.
#[derive(Debug, Clone, PartialEq)]
pub struct DependencyConfig {
    pub api_version: String,
    pub changes: BTreeMap<String, Change>,
    pub commands: BTreeMap<String, Command>,
}

#[derive(Debug, Default, Deserialize)]
struct RawDependencyConfig {
    #[serde(rename = "apiVersion")]
    api_version: Option<String>,
    changes: Option<Mapping>,
    commands: Option<Mapping>,
}

#[derive(Debug, Default, Deserialize)]
struct RawChange {
    #[serde(rename = "type")]
    change_type: Option<String>,
    description: Option<String>,
    migration: Option<String>,
    verify: Option<String>,
    #[serde(default)]
    metadata: BTreeMap<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
struct RawCommand {
    run: Option<String>,
    description: Option<String>,
    working_dir: Option<String>,
    #[serde(default)]
    env: BTreeMap<String, Value>,
}

impl DependencyConfig {
    /// What a dependency without a `dependency.yaml` declares: nothing.
    pub fn empty() -> Self {
        Self {
            api_version: CONFIG_API_VERSION.to_string(),
            changes: BTreeMap::new(),
            commands: BTreeMap::new(),
        }
    }

    /// Parses and validates a configuration, reporting every problem found
    /// rather than stopping at the first.
    pub fn from_yaml_str(input: &str) -> Result<Self, ValidationError> {
        let raw = serde_yaml::from_str::<RawDependencyConfig>(input).map_err(|err| {
            ValidationError::single(SUBJECT, "", format!("malformed YAML: {err}"))
        })?;

        let mut issues = Vec::new();
        let api_version = match raw.api_version {
            None => {
                issues.push(ValidationIssue::new("apiVersion", "missing apiVersion"));
                String::new()
            }
            Some(version) if version.trim() != CONFIG_API_VERSION => {
                issues.push(ValidationIssue::new(
                    "apiVersion",
                    format!("unsupported apiVersion '{version}' (expected '{CONFIG_API_VERSION}')"),
                ));
                version
            }
            Some(version) => version.trim().to_string(),
        };

        let raw_commands = raw.commands.unwrap_or_default();
        let declared_commands = raw_commands
            .keys()
            .filter_map(scalar_key)
            .collect::<BTreeSet<_>>();

        let mut commands = BTreeMap::new();
        for (key, value) in raw_commands {
            let Some(name) = scalar_key(&key) else {
                issues.push(ValidationIssue::new(
                    "commands",
                    "command names must be plain strings",
                ));
                continue;
            };
            if commands.contains_key(&name) {
                issues.push(ValidationIssue::new(
                    format!("commands.{name}"),
                    "duplicate command name",
                ));
                continue;
            }
            if let Some(command) = parse_command(&name, value, &mut issues) {
                commands.insert(name, command);
            }
        }

        let mut changes = BTreeMap::new();
        for (key, value) in raw.changes.unwrap_or_default() {
            let Some(reference) = scalar_key(&key) else {
                issues.push(ValidationIssue::new(
                    "changes",
                    "change references must be plain strings",
                ));
                continue;
            };
            if let Some(change) = parse_change(&reference, value, &declared_commands, &mut issues)
            {
                changes.insert(reference, change);
            }
        }

        if !issues.is_empty() {
            return Err(ValidationError::new(SUBJECT, issues));
        }

        Ok(Self {
            api_version,
            changes,
            commands,
        })
    }

    pub fn change(&self, reference: &str) -> Option<&Change> {
        self.changes.get(reference)
    }

    pub fn command(&self, name: &str) -> Option<&Command> {
        self.commands.get(name)
    }

    pub fn migration_for(&self, change: &Change) -> Option<&Command> {
        change
            .migration
            .as_deref()
            .and_then(|name| self.command(name))
    }

    pub fn verify_for(&self, change: &Change) -> Option<&Command> {
        change.verify.as_deref().and_then(|name| self.command(name))
    }
}

fn parse_command(name: &str, value: Value, issues: &mut Vec<ValidationIssue>) -> Option<Command> {
    let field = format!("commands.{name}");
    let before = issues.len();

    if name.trim().is_empty() {
        issues.push(ValidationIssue::new(&field, "command name must not be empty"));
    } else if name.contains(':') {
        issues.push(ValidationIssue::new(
            &field,
            "command name must not contain ':' (reserved for '<dependency>:<command>')",
        ));
    } else if name.chars().any(char::is_whitespace) {
        issues.push(ValidationIssue::new(
            &field,
            "command name must not contain whitespace",
        ));
    }

    // `name: "script"` is shorthand for `name: { run: "script" }`.
    let raw = match value {
        Value::String(run) => RawCommand {
            run: Some(run),
            ..RawCommand::default()
        },
        other => match serde_yaml::from_value::<RawCommand>(other) {
            Ok(raw) => raw,
            Err(err) => {
                issues.push(ValidationIssue::new(
                    &field,
                    format!("malformed command: {err}"),
                ));
                return None;
            }
        },
    };

    let run = raw.run.unwrap_or_default();
    if run.trim().is_empty() {
        issues.push(ValidationIssue::new(
            format!("{field}.run"),
            "run must not be empty",
        ));
    }

    let working_dir = match raw.working_dir {
        Some(dir) => match validate_working_dir(&dir) {
            Ok(dir) => Some(dir),
            Err(message) => {
                issues.push(ValidationIssue::new(
                    format!("{field}.working_dir"),
                    message,
                ));
                None
            }
        },
        None => None,
    };

    let mut env = BTreeMap::new();
    for (key, value) in raw.env {
        if key.is_empty() || key.contains('=') {
            issues.push(ValidationIssue::new(
                format!("{field}.env"),
                format!("invalid environment variable name '{key}'"),
            ));
            continue;
        }
        match scalar_key(&value) {
            Some(value) => {
                env.insert(key, value);
            }
            None => issues.push(ValidationIssue::new(
                format!("{field}.env.{key}"),
                "environment values must be strings, numbers or booleans",
            )),
        }
    }

    if issues.len() > before {
        return None;
    }

    Some(Command {
        name: name.to_string(),
        run,
        description: raw.description,
        working_dir,
        env,
    })
}

fn parse_change(
    reference: &str,
    value: Value,
    declared_commands: &BTreeSet<String>,
    issues: &mut Vec<ValidationIssue>,
) -> Option<Change> {
    let field = format!("changes.{reference}");
    let before = issues.len();

    if reference.trim().is_empty() {
        issues.push(ValidationIssue::new(
            "changes",
            "change reference must not be empty",
        ));
    }

    let raw = if value.is_null() {
        RawChange::default()
    } else {
        match serde_yaml::from_value::<RawChange>(value) {
            Ok(raw) => raw,
            Err(err) => {
                issues.push(ValidationIssue::new(
                    &field,
                    format!("malformed change: {err}"),
                ));
                return None;
            }
        }
    };

    for (slot, target) in [("migration", &raw.migration), ("verify", &raw.verify)] {
        let Some(target) = target else {
            continue;
        };
        if target.trim().is_empty() {
            issues.push(ValidationIssue::new(
                format!("{field}.{slot}"),
                format!("{slot} must name a command"),
            ));
        } else if !declared_commands.contains(target) {
            issues.push(ValidationIssue::new(
                format!("{field}.{slot}"),
                format!("references unknown command '{target}'"),
            ));
        }
    }

    if issues.len() > before {
        return None;
    }

    Some(Change {
        reference: reference.to_string(),
        change_type: raw.change_type,
        description: raw.description.unwrap_or_default(),
        migration: raw.migration,
        verify: raw.verify,
        metadata: raw.metadata,
    })
}

fn validate_working_dir(dir: &str) -> Result<PathBuf, String> {
    if dir.trim().is_empty() {
        return Err("working_dir must not be empty".to_string());
    }
    let path = Path::new(dir);
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => {
                return Err(format!(
                    "working_dir '{dir}' must be relative to the project root"
                ));
            }
            Component::ParentDir => {
                return Err(format!("working_dir '{dir}' must not contain '..'"));
            }
            Component::CurDir | Component::Normal(_) => {}
        }
    }
    Ok(path.to_path_buf())
}

fn scalar_key(value: &Value) -> Option<String> {
    match value {
        Value::String(value) => Some(value.clone()),
        Value::Number(value) => Some(value.to_string()),
        Value::Bool(value) => Some(value.to_string()),
        _ => None,
    }
}
