use std::process::{Command, Stdio};

use anyhow::{anyhow, Context, Result};

/// Forcefully terminates `pid` together with everything it spawned.
///
/// gitdep starts every command as the leader of its own process group, so on
/// Unix the whole group is signalled. Windows uses `taskkill /T`.
pub fn kill_process_tree(pid: u32) -> Result<()> {
    if pid == 0 {
        return Err(anyhow!("refusing to kill pid 0"));
    }

    #[cfg(unix)]
    let mut command = {
        let mut command = Command::new("kill");
        command.arg("-9").arg("--").arg(format!("-{pid}"));
        command
    };

    #[cfg(windows)]
    let mut command = {
        let mut command = Command::new("taskkill");
        command.args(["/PID", &pid.to_string(), "/T", "/F"]);
        command
    };

    #[cfg(not(any(unix, windows)))]
    return Err(anyhow!("process termination is unsupported on this platform"));

    #[cfg(any(unix, windows))]
    {
        let output = command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("failed executing termination of pid={pid}"))?;
        if !output.status.success() {
            return Err(anyhow!(
                "termination of pid={pid} failed: status={} stderr='{}'",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(())
    }
}
