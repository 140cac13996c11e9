use std::collections::BTreeMap;

/// A declared, semantically meaningful revision of a dependency.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    /// Any valid git ref: commit hash, tag or branch name.
    pub reference: String,
    /// `breaking`, `feature`, `fix`, or anything else the upstream chooses.
    pub change_type: Option<String>,
    pub description: String,
    pub migration: Option<String>,
    pub verify: Option<String>,
    pub metadata: BTreeMap<String, serde_yaml::Value>,
}

impl Change {
    pub fn is_breaking(&self) -> bool {
        self.change_type.as_deref() == Some("breaking")
    }

    pub fn has_commands(&self) -> bool {
        self.migration.is_some() || self.verify.is_some()
    }
}
