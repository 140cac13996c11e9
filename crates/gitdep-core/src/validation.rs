use std::fmt;

use anyhow::{anyhow, Result};
use thiserror::Error;

/// One problem found while validating a configuration or lock document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.field.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.field, self.message)
        }
    }
}

/// Every issue found in a single validation pass over one document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {subject} ({} problem{}): {}", .issues.len(), plural(.issues.len()), render_issues(.issues))]
pub struct ValidationError {
    pub subject: String,
    pub issues: Vec<ValidationIssue>,
}

impl ValidationError {
    pub fn new(subject: impl Into<String>, issues: Vec<ValidationIssue>) -> Self {
        Self {
            subject: subject.into(),
            issues,
        }
    }

    pub fn single(
        subject: impl Into<String>,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(subject, vec![ValidationIssue::new(field, message)])
    }

    pub fn has_issue_for(&self, field: &str) -> bool {
        self.issues.iter().any(|issue| issue.field == field)
    }
}

fn plural(count: usize) -> &'static str {
    if count == 1 {
        ""
    } else {
        "s"
    }
}

fn render_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Dependency names end up in file names and in `<dependency>:<command>`
/// invocations, so they share one restricted grammar.
pub fn validate_dependency_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 64 {
        return Err(anyhow!(
            "invalid dependency name '{name}': must be 1-64 characters"
        ));
    }

    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return Err(anyhow!("invalid dependency name: must not be empty"));
    };

    let first_is_valid = first.is_ascii_lowercase() || first.is_ascii_digit();
    let rest_is_valid = chars.all(|ch| {
        ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-' || ch == '_' || ch == '.'
    });
    if !first_is_valid || !rest_is_valid {
        return Err(anyhow!(
            "invalid dependency name '{name}': use lowercase letters, digits, '-', '_' or '.'"
        ));
    }

    Ok(())
}
