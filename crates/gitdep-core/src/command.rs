use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{anyhow, Result};

/// A named shell invocation declared by a dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub name: String,
    pub run: String,
    pub description: Option<String>,
    /// Relative to the consumer project root.
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

/// Splits a `<dependency>:<command>` invocation.
pub fn parse_command_ref(value: &str) -> Result<(String, String)> {
    let (dependency, command) = value.split_once(':').ok_or_else(|| {
        anyhow!("invalid command reference '{value}': expected '<dependency>:<command>'")
    })?;
    let dependency = dependency.trim();
    let command = command.trim();
    if dependency.is_empty() {
        return Err(anyhow!(
            "invalid command reference '{value}': dependency must not be empty"
        ));
    }
    if command.is_empty() || command.contains(':') {
        return Err(anyhow!(
            "invalid command reference '{value}': command name must be non-empty and contain no ':'"
        ));
    }
    Ok((dependency.to_string(), command.to_string()))
}
