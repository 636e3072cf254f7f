use anyhow::Result;
use std::io::IsTerminal;
use std::process::{Command, Stdio};

use crate::config::is_truthy;
use crate::error::PipelineError;
use crate::output;
use crate::utils::which;

fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

pub fn interactive_allowed(non_interactive: bool) -> bool {
    let ci = std::env::var("CI").map(|value| is_truthy(&value)).unwrap_or(false);
    !non_interactive && !ci && std::io::stdin().is_terminal()
}

fn sudo_cached() -> bool {
    Command::new("sudo")
        .arg("-n")
        .arg("true")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

pub fn ensure_sudo_cached(non_interactive: bool) -> Result<()> {
    if is_root() {
        return Ok(());
    }
    if which("sudo").is_none() {
        return Err(PipelineError::PrivilegeError("sudo is not installed".to_string()).into());
    }
    if sudo_cached() {
        tracing::debug!("sudo credentials already cached");
        return Ok(());
    }
    if !interactive_allowed(non_interactive) {
        return Err(PipelineError::PrivilegeError(
            "sudo credentials are not cached and prompting is disabled (non-interactive mode); run `sudo -v` first"
                .to_string(),
        )
        .into());
    }

    output::info("Administrator privileges are required for the libvirt provider");
    let status = Command::new("sudo").arg("-v").status();
    match status {
        Ok(status) if status.success() => Ok(()),
        Ok(status) => Err(PipelineError::PrivilegeError(format!(
            "sudo -v exited with {}",
            status.code().unwrap_or(-1)
        ))
        .into()),
        Err(err) => Err(PipelineError::PrivilegeError(format!("failed to run sudo: {err}")).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_flag_disables_prompts() {
        assert!(!interactive_allowed(true));
    }
}
