use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::BTreeSet;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tempfile::NamedTempFile;

use crate::constants::REMOTE_ARCHIVE_PATH;
use crate::error::PipelineError;
use crate::output;
use crate::provider::TransferMode;
use crate::remote::RemoteShell;
use crate::utils::{run_cmd_capture, sha256_file, shell_escape};

#[derive(Debug)]
pub enum Artifact {
    WorkingTree {
        root: PathBuf,
        files: Vec<PathBuf>,
    },
    Archive {
        file: NamedTempFile,
        sha256: String,
        entries: usize,
    },
}

impl Artifact {
    pub fn describe(&self) -> String {
        match self {
            Self::WorkingTree { files, .. } => format!("{} files from the working tree", files.len()),
            Self::Archive {
                sha256, entries, ..
            } => format!(
                "HEAD archive of {entries} files (sha256 {})",
                &sha256[..sha256.len().min(12)]
            ),
        }
    }
}

pub trait TransferStrategy {
    fn mode(&self) -> TransferMode;

    fn prepare(&self, project: &Path) -> Result<Artifact>;

    fn ship(&self, artifact: &Artifact, remote: &dyn RemoteShell, remote_dir: &str) -> Result<()>;

    fn deliver(&self, project: &Path, remote: &dyn RemoteShell, remote_dir: &str) -> Result<()> {
        let artifact = self.prepare(project)?;
        output::info(&format!(
            "Transferring {} to {}",
            artifact.describe(),
            remote.destination()
        ));
        self.ship(&artifact, remote, remote_dir)
    }
}

pub fn strategy_for(mode: TransferMode) -> Box<dyn TransferStrategy> {
    match mode {
        TransferMode::WorkingTree => Box::new(WorkingTreeTransfer),
        TransferMode::Archive => Box::new(ArchiveTransfer),
    }
}

fn transfer_failure(message: String) -> anyhow::Error {
    PipelineError::TransferFailure(message).into()
}

fn git(project: &Path) -> Command {
    let mut cmd = Command::new("git");
    cmd.arg("-C").arg(project);
    cmd
}

pub struct WorkingTreeTransfer;

impl WorkingTreeTransfer {
    pub fn list_files(project: &Path) -> Result<Vec<PathBuf>> {
        let mut cmd = git(project);
        cmd.args(["ls-files", "--cached", "--others", "--exclude-standard"]);
        let result = run_cmd_capture(cmd)?;
        if !result.ok {
            return Err(transfer_failure(format!(
                "git ls-files failed in {}: {}",
                project.display(),
                result.detail()
            )));
        }
        // --cached lists unmerged paths more than once and still reports
        // files deleted from the working tree.
        let files: BTreeSet<PathBuf> = result
            .stdout
            .lines()
            .filter(|line| !line.is_empty())
            .map(PathBuf::from)
            .filter(|path| project.join(path).is_file())
            .collect();
        Ok(files.into_iter().collect())
    }
}

impl TransferStrategy for WorkingTreeTransfer {
    fn mode(&self) -> TransferMode {
        TransferMode::WorkingTree
    }

    fn prepare(&self, project: &Path) -> Result<Artifact> {
        let files = Self::list_files(project)?;
        if files.is_empty() {
            return Err(transfer_failure(format!(
                "no files to deploy in {}",
                project.display()
            )));
        }
        Ok(Artifact::WorkingTree {
            root: project.to_path_buf(),
            files,
        })
    }

    fn ship(&self, artifact: &Artifact, remote: &dyn RemoteShell, remote_dir: &str) -> Result<()> {
        let Artifact::WorkingTree { root, files } = artifact else {
            return Err(transfer_failure("working-tree transfer given an archive".to_string()));
        };
        let result = remote.sync_files(root, files, remote_dir)?;
        if !result.ok {
            return Err(transfer_failure(format!(
                "rsync to {} exited with {}: {}",
                remote.destination(),
                result.returncode,
                result.detail()
            )));
        }
        Ok(())
    }
}

pub struct ArchiveTransfer;

impl ArchiveTransfer {
    pub fn build_archive(project: &Path) -> Result<NamedTempFile> {
        let file = tempfile::Builder::new()
            .prefix("trackerctl-release-")
            .suffix(".tar.gz")
            .tempfile()
            .context("Failed to create release archive")?;

        let mut child = git(project)
            .args(["archive", "--format=tar", "HEAD"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("Failed to start git archive")?;
        let mut stdout = child
            .stdout
            .take()
            .context("git archive stdout unavailable")?;

        let mut encoder = GzEncoder::new(file.reopen()?, Compression::default());
        io::copy(&mut stdout, &mut encoder).context("Failed to compress release archive")?;
        encoder.finish()?.flush()?;

        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(transfer_failure(format!(
                "git archive failed in {}: {}",
                project.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(file)
    }

    pub fn count_files(path: &Path) -> Result<usize> {
        let reader = std::fs::File::open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let mut archive = tar::Archive::new(GzDecoder::new(reader));
        let mut files = 0;
        for entry in archive.entries().context("Failed to read release archive")? {
            if entry?.header().entry_type().is_file() {
                files += 1;
            }
        }
        Ok(files)
    }
}

impl TransferStrategy for ArchiveTransfer {
    fn mode(&self) -> TransferMode {
        TransferMode::Archive
    }

    fn prepare(&self, project: &Path) -> Result<Artifact> {
        let file = Self::build_archive(project)?;
        let entries = Self::count_files(file.path())?;
        if entries == 0 {
            return Err(transfer_failure(format!(
                "HEAD of {} contains no files",
                project.display()
            )));
        }
        let sha256 = sha256_file(file.path())?;
        Ok(Artifact::Archive {
            file,
            sha256,
            entries,
        })
    }

    fn ship(&self, artifact: &Artifact, remote: &dyn RemoteShell, remote_dir: &str) -> Result<()> {
        let Artifact::Archive { file, sha256, .. } = artifact else {
            return Err(transfer_failure("archive transfer given a file list".to_string()));
        };
        let upload = remote.upload(file.path(), REMOTE_ARCHIVE_PATH)?;
        if !upload.ok {
            return Err(transfer_failure(format!(
                "scp to {} exited with {}: {}",
                remote.destination(),
                upload.returncode,
                upload.detail()
            )));
        }

        let archive = shell_escape(REMOTE_ARCHIVE_PATH);
        let check = remote.run(&format!("sha256sum {archive}"))?;
        let remote_sum = check.stdout.split_whitespace().next().unwrap_or_default();
        if !check.ok || remote_sum != sha256 {
            return Err(transfer_failure(format!(
                "checksum mismatch after upload: local {sha256}, remote {}",
                if remote_sum.is_empty() { check.detail() } else { remote_sum }
            )));
        }

        let extract = remote.run(&format!(
            "tar -xzf {archive} -C {} && rm -f {archive}",
            shell_escape(remote_dir)
        ))?;
        if !extract.ok {
            return Err(transfer_failure(format!(
                "extracting release archive failed: {}",
                extract.detail()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::fake::FakeRemote;
    use crate::utils::which;
    use std::fs;

    fn git_ok(project: &Path, args: &[&str]) {
        let status = git(project)
            .args([
                "-c",
                "user.name=test",
                "-c",
                "user.email=test@example.com",
                "-c",
                "commit.gpgsign=false",
            ])
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .unwrap();
        assert!(status.success(), "git {args:?}");
    }

    fn sample_repo() -> Option<tempfile::TempDir> {
        which("git")?;
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        git_ok(root, &["init", "-q"]);
        fs::write(root.join(".gitignore"), "*.log\n").unwrap();
        fs::create_dir_all(root.join("application")).unwrap();
        fs::write(root.join("application/compose.yaml"), "services: {}\n").unwrap();
        fs::write(root.join("removed.txt"), "gone soon\n").unwrap();
        git_ok(root, &["add", "."]);
        git_ok(root, &["commit", "-q", "-m", "initial"]);

        fs::write(root.join("application/compose.yaml"), "services: {tracker: {}}\n").unwrap();
        fs::write(root.join("untracked.txt"), "new\n").unwrap();
        fs::write(root.join("debug.log"), "noise\n").unwrap();
        fs::remove_file(root.join("removed.txt")).unwrap();
        Some(temp)
    }

    fn archive_entries(file: &Path) -> Vec<(String, String)> {
        let decoder = GzDecoder::new(fs::File::open(file).unwrap());
        let mut archive = tar::Archive::new(decoder);
        let mut entries = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let path = entry.path().unwrap().to_string_lossy().to_string();
            let mut body = String::new();
            io::Read::read_to_string(&mut entry, &mut body).unwrap();
            entries.push((path, body));
        }
        entries
    }

    #[test]
    fn working_tree_includes_untracked_and_skips_ignored_and_deleted() {
        let Some(repo) = sample_repo() else { return };
        let files = WorkingTreeTransfer::list_files(repo.path()).unwrap();
        let names: Vec<String> = files.iter().map(|f| f.to_string_lossy().to_string()).collect();
        assert!(names.contains(&"untracked.txt".to_string()));
        assert!(names.contains(&"application/compose.yaml".to_string()));
        assert!(names.contains(&".gitignore".to_string()));
        assert!(!names.contains(&"debug.log".to_string()));
        assert!(!names.contains(&"removed.txt".to_string()));
    }

    #[test]
    fn working_tree_ship_copies_current_contents() {
        let Some(repo) = sample_repo() else { return };
        let remote = FakeRemote::always_ok();
        WorkingTreeTransfer
            .deliver(repo.path(), &remote, "/srv/app")
            .unwrap();
        let shipped = fs::read_to_string(remote.local_path("/srv/app/application/compose.yaml")).unwrap();
        assert_eq!(shipped, "services: {tracker: {}}\n");
        assert!(remote.local_path("/srv/app/untracked.txt").is_file());
    }

    #[test]
    fn archive_contains_head_only() {
        let Some(repo) = sample_repo() else { return };
        let artifact = ArchiveTransfer.prepare(repo.path()).unwrap();
        let Artifact::Archive {
            file,
            sha256,
            entries: count,
        } = &artifact
        else {
            panic!("expected archive artifact");
        };
        assert_eq!(sha256.len(), 64);
        assert_eq!(*count, 3);

        let entries = archive_entries(file.path());
        let names: Vec<&str> = entries.iter().map(|(name, _)| name.as_str()).collect();
        assert!(names.contains(&"removed.txt"));
        assert!(!names.contains(&"untracked.txt"));
        assert!(!names.contains(&"debug.log"));
        let compose = entries
            .iter()
            .find(|(name, _)| name == "application/compose.yaml")
            .unwrap();
        assert_eq!(compose.1, "services: {}\n");
    }

    #[test]
    fn archive_ship_verifies_checksum_then_extracts() {
        let Some(repo) = sample_repo() else { return };
        let artifact = ArchiveTransfer.prepare(repo.path()).unwrap();
        let Artifact::Archive { sha256, .. } = &artifact else {
            panic!("expected archive artifact");
        };

        let expected = sha256.clone();
        let remote = FakeRemote::new(move |script| {
            if script.starts_with("sha256sum") {
                (true, format!("{expected}  {REMOTE_ARCHIVE_PATH}"))
            } else {
                (true, String::new())
            }
        });
        ArchiveTransfer.ship(&artifact, &remote, "/srv/app").unwrap();
        assert!(remote.local_path(REMOTE_ARCHIVE_PATH).is_file());
        let verify = remote.position("sha256sum").unwrap();
        let extract = remote.position("tar -xzf").unwrap();
        assert!(verify < extract);

        let tampered = FakeRemote::new(|script| {
            if script.starts_with("sha256sum") {
                (true, format!("{}  {REMOTE_ARCHIVE_PATH}", "0".repeat(64)))
            } else {
                (true, String::new())
            }
        });
        let err = ArchiveTransfer.ship(&artifact, &tampered, "/srv/app").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::TransferFailure(_))
        ));
        assert!(!tampered.ran("tar -xzf"));
    }

    #[test]
    fn strategy_matches_mode() {
        assert_eq!(strategy_for(TransferMode::Archive).mode(), TransferMode::Archive);
        assert_eq!(
            strategy_for(TransferMode::WorkingTree).mode(),
            TransferMode::WorkingTree
        );
    }
}
