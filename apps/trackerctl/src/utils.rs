use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use std::ffi::OsStr;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub command: String,
    pub ok: bool,
    pub stdout: String,
    pub stderr: String,
    pub returncode: i32,
}

impl CommandResult {
    pub fn detail(&self) -> &str {
        if self.stderr.is_empty() {
            self.stdout.as_str()
        } else {
            self.stderr.as_str()
        }
    }
}

pub fn which<S: AsRef<OsStr>>(cmd: S) -> Option<PathBuf> {
    let cmd_ref = cmd.as_ref();
    std::env::var_os("PATH").and_then(|paths| {
        std::env::split_paths(&paths).find_map(|dir| {
            let candidate = dir.join(cmd_ref);
            if candidate.is_file() {
                Some(candidate)
            } else {
                None
            }
        })
    })
}

pub fn command_display(command: &Command) -> String {
    let mut display = command.get_program().to_string_lossy().to_string();
    for arg in command.get_args() {
        display.push(' ');
        display.push_str(&arg.to_string_lossy());
    }
    display
}

pub fn run_cmd(mut command: Command) -> Result<()> {
    let command_display = command_display(&command);
    tracing::debug!(command = %command_display, "running");
    let status = command
        .status()
        .with_context(|| format!("Failed to start {command_display}"))?;
    if !status.success() {
        bail!(
            "Command failed (exit {}): {command_display}",
            status.code().unwrap_or(-1)
        );
    }
    Ok(())
}

pub fn run_cmd_capture(mut command: Command) -> Result<CommandResult> {
    let command_display = command_display(&command);
    tracing::debug!(command = %command_display, "running");
    let output = command
        .output()
        .with_context(|| format!("Failed to start {command_display}"))?;
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    Ok(CommandResult {
        command: command_display,
        ok: output.status.success(),
        stdout,
        stderr,
        returncode: output.status.code().unwrap_or(-1),
    })
}

/// Like [`run_cmd_capture`], but kills the child once `timeout` elapses. A
/// timed-out command is reported as failed with exit code -1.
pub fn run_cmd_capture_timeout(mut command: Command, timeout: Duration) -> Result<CommandResult> {
    let command_display = command_display(&command);
    tracing::debug!(command = %command_display, timeout_secs = timeout.as_secs(), "running");
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("Failed to start {command_display}"))?;
    let stdout_reader = drain(child.stdout.take());
    let stderr_reader = drain(child.stderr.take());

    let deadline = Instant::now() + timeout;
    let status = wait_until(&mut child, deadline)?;

    let stdout = join_output(stdout_reader);
    let mut stderr = join_output(stderr_reader);
    let (ok, returncode) = match status {
        Some(status) => (status.success(), status.code().unwrap_or(-1)),
        None => {
            if !stderr.is_empty() {
                stderr.push('\n');
            }
            stderr.push_str(&format!("timed out after {}s", timeout.as_secs()));
            (false, -1)
        }
    };
    Ok(CommandResult {
        command: command_display,
        ok,
        stdout,
        stderr,
        returncode,
    })
}

fn wait_until(child: &mut Child, deadline: Instant) -> Result<Option<std::process::ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(None);
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|mut pipe| {
        std::thread::spawn(move || {
            let mut buffer = Vec::new();
            let _ = pipe.read_to_end(&mut buffer);
            buffer
        })
    })
}

fn join_output(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|handle| handle.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).trim().to_string())
        .unwrap_or_default()
}

pub fn shell_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(ch);
        }
    }
    out.push('\'');
    out
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn is_secret_key(key: &str) -> bool {
    let lowered = key.to_lowercase();
    lowered.contains("password") || lowered.contains("token") || lowered.contains("secret")
}

pub fn redact_value(key: &str, value: &str) -> String {
    if is_secret_key(key) && !value.is_empty() {
        "REDACTED".to_string()
    } else {
        value.to_string()
    }
}

/// Writes `contents` only when the file is missing or differs. Returns whether
/// anything was written.
pub fn write_if_changed(path: &Path, contents: &[u8]) -> Result<bool> {
    if let Ok(existing) = fs::read(path) {
        if existing == contents {
            return Ok(false);
        }
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_escape_wraps_single_quotes() {
        assert_eq!(shell_escape("plain"), "'plain'");
        assert_eq!(shell_escape("it's"), "'it'\\''s'");
    }

    #[test]
    fn run_cmd_names_the_failing_command() {
        run_cmd(Command::new("true")).unwrap();

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("exit 3");
        let err = run_cmd(cmd).unwrap_err().to_string();
        assert!(err.contains("exit 3"), "{err}");
        assert!(err.contains("sh -c exit 3"), "{err}");
    }

    #[test]
    fn timeout_kills_long_running_command() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("sleep 5");
        let result = run_cmd_capture_timeout(cmd, Duration::from_millis(200)).unwrap();
        assert!(!result.ok);
        assert_eq!(result.returncode, -1);
        assert!(result.stderr.contains("timed out"), "{}", result.stderr);
    }

    #[test]
    fn timeout_captures_output_of_fast_command() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo hello; echo oops >&2");
        let result = run_cmd_capture_timeout(cmd, Duration::from_secs(5)).unwrap();
        assert!(result.ok);
        assert_eq!(result.stdout, "hello");
        assert_eq!(result.stderr, "oops");
    }

    #[test]
    fn write_if_changed_skips_identical_contents() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("nested/file.txt");
        assert!(write_if_changed(&path, b"one").unwrap());
        assert!(!write_if_changed(&path, b"one").unwrap());
        assert!(write_if_changed(&path, b"two").unwrap());
    }

    #[test]
    fn secrets_are_redacted_by_key_name() {
        assert_eq!(redact_value("MYSQL_PASSWORD", "hunter2"), "REDACTED");
        assert_eq!(redact_value("TRACKER_ADMIN_TOKEN", "abc"), "REDACTED");
        assert_eq!(redact_value("DOMAIN_NAME", "example.com"), "example.com");
    }
}
