use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

/// Environment variable holding the default command timeout.
pub const TIMEOUT_ENV: &str = "GITDEP_COMMAND_TIMEOUT";

/// What to run and how to supervise it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessConfig {
    pub command: String,
    pub working_dir: PathBuf,
    pub env: BTreeMap<String, String>,
    pub log_file: Option<PathBuf>,
    pub timeout: Option<Duration>,
    /// Repository the execution belongs to, recorded in the registry.
    pub repo: Option<PathBuf>,
}

impl ProcessConfig {
    pub fn new(command: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            working_dir: working_dir.into(),
            env: BTreeMap::new(),
            log_file: None,
            timeout: None,
            repo: None,
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_envs(mut self, env: &BTreeMap<String, String>) -> Self {
        self.env
            .extend(env.iter().map(|(key, value)| (key.clone(), value.clone())));
        self
    }

    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_repo(mut self, repo: impl Into<PathBuf>) -> Self {
        self.repo = Some(repo.into());
        self
    }

    /// Explicit timeout first, then `GITDEP_COMMAND_TIMEOUT`, else none.
    pub fn effective_timeout(&self) -> Result<Option<Duration>> {
        resolve_timeout(self.timeout, std::env::var(TIMEOUT_ENV).ok().as_deref())
    }
}

pub fn resolve_timeout(
    explicit: Option<Duration>,
    env_value: Option<&str>,
) -> Result<Option<Duration>> {
    if explicit.is_some() {
        return Ok(explicit);
    }
    match env_value.map(str::trim) {
        None | Some("") => Ok(None),
        Some(raw) => parse_timeout(raw)
            .map(Some)
            .with_context(|| format!("invalid {TIMEOUT_ENV} value '{raw}'")),
    }
}

/// Parses `90`, `90s`, `15m` or `2h`.
pub fn parse_timeout(raw: &str) -> Result<Duration> {
    let raw = raw.trim();
    let (digits, unit_secs) = match raw.char_indices().last() {
        Some((idx, 's')) => (&raw[..idx], 1),
        Some((idx, 'm')) => (&raw[..idx], 60),
        Some((idx, 'h')) => (&raw[..idx], 60 * 60),
        Some(_) => (raw, 1),
        None => return Err(anyhow!("timeout must not be empty")),
    };

    let value = digits
        .trim()
        .parse::<u64>()
        .with_context(|| format!("timeout '{raw}' must be a whole number with optional s, m or h suffix"))?;
    if value == 0 {
        return Err(anyhow!("timeout '{raw}' must be greater than zero"));
    }
    let secs = value
        .checked_mul(unit_secs)
        .ok_or_else(|| anyhow!("timeout '{raw}' is too large"))?;
    Ok(Duration::from_secs(secs))
}
