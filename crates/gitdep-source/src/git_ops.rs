use std::path::Path;
use std::process::{Command, Output};

use anyhow::{bail, Context, Result};
use tracing::debug;

pub(crate) fn base_git_command() -> Command {
    let mut command = Command::new("git");
    command
        .arg("-c")
        .arg("core.autocrlf=false")
        .arg("-c")
        .arg("core.eol=lf");
    if cfg!(windows) {
        command.arg("-c").arg("core.longpaths=true");
    }
    // Never block on a credential prompt.
    command.env("GIT_TERMINAL_PROMPT", "0");
    command
}

pub(crate) fn run_git_clone_mirror(location: &str, destination: &Path, dependency: &str) -> Result<()> {
    debug!(dependency, location, "cloning upstream mirror");
    let output = base_git_command()
        .arg("clone")
        .arg("--mirror")
        .arg("--quiet")
        .arg("--")
        .arg(location)
        .arg(destination)
        .output()
        .with_context(|| {
            format!("upstream-resolve-failed: dependency '{dependency}' failed launching git clone")
        })?;
    if !output.status.success() {
        bail!(
            "upstream-resolve-failed: dependency '{}' git clone of {} failed: {}",
            dependency,
            location,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

/// Runs git in `repo_root` and returns its stdout; non-zero exit is an error.
pub(crate) fn run_git(repo_root: &Path, args: &[&str], dependency: &str) -> Result<String> {
    let output = git_output(repo_root, args, dependency)?;
    if !output.status.success() {
        bail!(
            "upstream-resolve-failed: dependency '{}' git {} failed: {}",
            dependency,
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    String::from_utf8(output.stdout).with_context(|| {
        format!(
            "upstream-resolve-failed: git {} produced non-UTF-8 output",
            args.join(" ")
        )
    })
}

/// Like [`run_git`] but reports a non-zero exit as `None`.
pub(crate) fn try_git(repo_root: &Path, args: &[&str], dependency: &str) -> Result<Option<String>> {
    let output = git_output(repo_root, args, dependency)?;
    if !output.status.success() {
        return Ok(None);
    }
    let stdout = String::from_utf8(output.stdout).with_context(|| {
        format!(
            "upstream-resolve-failed: git {} produced non-UTF-8 output",
            args.join(" ")
        )
    })?;
    Ok(Some(stdout))
}

fn git_output(repo_root: &Path, args: &[&str], dependency: &str) -> Result<Output> {
    debug!(dependency, repo = %repo_root.display(), "git {}", args.join(" "));
    base_git_command()
        .args(args)
        .current_dir(repo_root)
        .output()
        .with_context(|| {
            format!(
                "upstream-resolve-failed: dependency '{}' failed launching git {}",
                dependency,
                args.join(" ")
            )
        })
}
