use anyhow::{bail, Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::constants::{SSH_CONNECT_TIMEOUT_SECS, TRANSFER_TIMEOUT};
use crate::utils::{run_cmd_capture, run_cmd_capture_timeout, CommandResult};

pub trait RemoteShell {
    fn destination(&self) -> String;

    fn run(&self, script: &str) -> Result<CommandResult>;

    fn upload(&self, local: &Path, remote_path: &str) -> Result<CommandResult>;

    fn sync_files(&self, root: &Path, files: &[PathBuf], remote_dir: &str) -> Result<CommandResult>;

    fn run_ok(&self, script: &str, what: &str) -> Result<CommandResult> {
        let result = self.run(script)?;
        if !result.ok {
            bail!(
                "{what} failed on {} (exit {}): {}",
                self.destination(),
                result.returncode,
                result.detail()
            );
        }
        Ok(result)
    }
}

#[derive(Debug, Clone)]
pub struct SshTarget {
    pub user: String,
    pub host: String,
}

impl SshTarget {
    pub fn new(user: &str, host: &str) -> Self {
        Self {
            user: user.to_string(),
            host: host.to_string(),
        }
    }

    fn options() -> Vec<String> {
        vec![
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={SSH_CONNECT_TIMEOUT_SECS}"),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
        ]
    }

    pub fn ssh_command(&self, script: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(Self::options())
            .arg(self.destination())
            .arg(script);
        cmd
    }

    fn rsync_shell() -> String {
        let mut shell = "ssh".to_string();
        for option in Self::options() {
            shell.push(' ');
            shell.push_str(&option);
        }
        shell
    }
}

impl RemoteShell for SshTarget {
    fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    fn run(&self, script: &str) -> Result<CommandResult> {
        run_cmd_capture(self.ssh_command(script))
    }

    fn upload(&self, local: &Path, remote_path: &str) -> Result<CommandResult> {
        let mut cmd = Command::new("scp");
        cmd.args(Self::options())
            .arg(local)
            .arg(format!("{}:{remote_path}", self.destination()));
        run_cmd_capture_timeout(cmd, TRANSFER_TIMEOUT)
    }

    fn sync_files(&self, root: &Path, files: &[PathBuf], remote_dir: &str) -> Result<CommandResult> {
        let mut list = tempfile::NamedTempFile::new()?;
        for file in files {
            writeln!(list, "{}", file.display())?;
        }
        list.flush()?;

        let mut cmd = Command::new("rsync");
        cmd.arg("-az")
            .arg(format!("--files-from={}", list.path().display()))
            .arg("-e")
            .arg(Self::rsync_shell())
            .arg(format!("{}/", root.display()))
            .arg(format!("{}:{}/", self.destination(), remote_dir.trim_end_matches('/')));
        run_cmd_capture_timeout(cmd, TRANSFER_TIMEOUT)
            .with_context(|| format!("Failed to run rsync to {}", self.destination()))
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::cell::RefCell;
    use std::fs;

    type Responder = Box<dyn FnMut(&str) -> (bool, String)>;

    pub(crate) struct FakeRemote {
        pub(crate) scripts: RefCell<Vec<String>>,
        pub(crate) root: tempfile::TempDir,
        responder: RefCell<Responder>,
    }

    impl FakeRemote {
        pub(crate) fn new(responder: impl FnMut(&str) -> (bool, String) + 'static) -> Self {
            Self {
                scripts: RefCell::new(Vec::new()),
                root: tempfile::tempdir().unwrap(),
                responder: RefCell::new(Box::new(responder)),
            }
        }

        pub(crate) fn always_ok() -> Self {
            Self::new(|_| (true, String::new()))
        }

        pub(crate) fn local_path(&self, remote: &str) -> PathBuf {
            self.root.path().join(remote.trim_start_matches('/'))
        }

        pub(crate) fn ran(&self, needle: &str) -> bool {
            self.scripts
                .borrow()
                .iter()
                .any(|script| script.contains(needle))
        }

        pub(crate) fn position(&self, needle: &str) -> Option<usize> {
            self.scripts
                .borrow()
                .iter()
                .position(|script| script.contains(needle))
        }

        fn result(command: String, ok: bool, stdout: String) -> CommandResult {
            CommandResult {
                command,
                ok,
                stdout,
                stderr: String::new(),
                returncode: if ok { 0 } else { 1 },
            }
        }
    }

    impl RemoteShell for FakeRemote {
        fn destination(&self) -> String {
            "torrust@fake".to_string()
        }

        fn run(&self, script: &str) -> Result<CommandResult> {
            self.scripts.borrow_mut().push(script.to_string());
            let (ok, stdout) = (self.responder.borrow_mut())(script);
            Ok(Self::result(script.to_string(), ok, stdout))
        }

        fn upload(&self, local: &Path, remote_path: &str) -> Result<CommandResult> {
            let target = self.local_path(remote_path);
            fs::create_dir_all(target.parent().unwrap())?;
            fs::copy(local, &target)?;
            self.scripts
                .borrow_mut()
                .push(format!("upload {remote_path}"));
            Ok(Self::result(format!("upload {remote_path}"), true, String::new()))
        }

        fn sync_files(&self, root: &Path, files: &[PathBuf], remote_dir: &str) -> Result<CommandResult> {
            let base = self.local_path(remote_dir);
            for file in files {
                let target = base.join(file);
                fs::create_dir_all(target.parent().unwrap())?;
                fs::copy(root.join(file), &target)?;
            }
            self.scripts.borrow_mut().push(format!("sync {remote_dir}"));
            Ok(Self::result(format!("sync {remote_dir}"), true, String::new()))
        }
    }
}
