//! Git lifecycle for one folder's working directory: init, remote
//! configuration, commit, and push, all by shelling out to the `git`
//! binary (mirrors the persistence layer's original implementation, which
//! does the same rather than drive libgit2 directly — subprocess stderr is
//! what push-failure classification needs to read anyway).

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::error::{PushFailureKind, SyncError};
use crate::persistence::ssh::SshKeyGuard;

const LOCK_WAIT_TIMEOUT: Duration = Duration::from_secs(5);
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// One folder's Git working directory.
pub struct GitRepo {
    pub dir: PathBuf,
}

impl GitRepo {
    pub fn new(dir: PathBuf) -> Self {
        GitRepo { dir }
    }

    fn git(&self) -> Command {
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(&self.dir);
        cmd
    }

    fn run(&self, args: &[&str]) -> Result<Output, SyncError> {
        self.git().args(args).output().map_err(SyncError::Io)
    }

    fn run_with_ssh(&self, args: &[&str], ssh: &SshKeyGuard) -> Result<Output, SyncError> {
        let mut cmd = self.git();
        cmd.args(args);
        if let Some(ssh_command) = ssh.ssh_command() {
            cmd.env("GIT_SSH_COMMAND", ssh_command);
        }
        cmd.output().map_err(SyncError::Io)
    }

    pub fn exists(&self) -> bool {
        self.dir.join(".git").is_dir()
    }

    /// Idempotent: creates the repo with an initial branch `main` if
    /// missing, and commits a placeholder `.gitignore` when there is no
    /// `HEAD` yet so subsequent commands have a valid ref to work from.
    pub fn init(&self) -> Result<(), SyncError> {
        std::fs::create_dir_all(&self.dir)?;
        if !self.exists() {
            let output = Command::new("git")
                .arg("init")
                .arg("--initial-branch=main")
                .arg(&self.dir)
                .output()?;
            if !output.status.success() {
                return Err(command_error("git init", &output));
            }
            info!(dir = %self.dir.display(), "initialized folder repository");
        }

        if !self.has_head()? {
            let gitignore = self.dir.join(".gitignore");
            if !gitignore.exists() {
                std::fs::write(&gitignore, "")?;
            }
            self.run(&["add", ".gitignore"])?;
            let output = self.run(&[
                "commit",
                "-m",
                "content-only sync repository",
            ])?;
            if !output.status.success() {
                return Err(command_error("git commit (init)", &output));
            }
        }
        Ok(())
    }

    fn has_head(&self) -> Result<bool, SyncError> {
        let output = self.run(&["rev-parse", "--verify", "HEAD"])?;
        Ok(output.status.success())
    }

    pub fn configure_remote(
        &self,
        remote_name: &str,
        url: &str,
    ) -> Result<(), SyncError> {
        let has_remote = self.run(&["remote", "get-url", remote_name])?.status.success();
        let output = if has_remote {
            self.run(&["remote", "set-url", remote_name, url])?
        } else {
            self.run(&["remote", "add", remote_name, url])?
        };
        if !output.status.success() {
            return Err(command_error("git remote configure", &output));
        }
        Ok(())
    }

    pub fn is_dirty(&self) -> Result<bool, SyncError> {
        let output = self.run(&["diff", "--quiet"])?;
        Ok(!output.status.success())
    }

    pub fn has_untracked(&self) -> Result<bool, SyncError> {
        let output = self.run(&["ls-files", "--others", "--exclude-standard"])?;
        Ok(!String::from_utf8_lossy(&output.stdout).trim().is_empty())
    }

    pub fn has_staged(&self) -> Result<bool, SyncError> {
        let output = self.run(&["diff", "--cached", "--quiet"])?;
        Ok(!output.status.success())
    }

    pub fn stage_all(&self) -> Result<(), SyncError> {
        let output = self.run(&["add", "-A"])?;
        if !output.status.success() {
            return Err(command_error("git add -A", &output));
        }
        Ok(())
    }

    pub fn commit(&self, message: &str) -> Result<(), SyncError> {
        let output = self.run(&["commit", "-m", message])?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("nothing to commit") {
                return Ok(());
            }
            return Err(command_error("git commit", &output));
        }
        Ok(())
    }

    fn has_upstream(&self, branch: &str) -> Result<bool, SyncError> {
        let output = self.run(&[
            "rev-parse",
            "--abbrev-ref",
            &format!("{branch}@{{upstream}}"),
        ])?;
        Ok(output.status.success())
    }

    /// Push, classifying failures into the §7 taxonomy instead of
    /// aborting. Sets the upstream on first push when none is tracked yet.
    pub fn push(
        &self,
        remote_name: &str,
        branch: &str,
        ssh: &SshKeyGuard,
    ) -> Result<(), SyncError> {
        let needs_upstream = !self.has_upstream(branch)?;
        let args: Vec<&str> = if needs_upstream {
            vec!["push", "--set-upstream", remote_name, branch]
        } else {
            vec!["push", remote_name, branch]
        };

        let output = self.run_with_ssh(&args, ssh)?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let kind = PushFailureKind::classify(&stderr);
        warn!(repo = %self.dir.display(), %kind, "git push failed: {stderr}");
        Err(SyncError::PushFailure {
            repo: self.dir.display().to_string(),
            kind,
            detail: stderr,
        })
    }

    /// Wait (bounded) for a stale `.git` lock file to disappear, polling
    /// rather than failing immediately — mirrors the reference
    /// implementation's lock-wait loop.
    pub fn wait_for_lock_clear(&self) -> Result<(), SyncError> {
        let lock = self.dir.join(".git").join("index.lock");
        let start = Instant::now();
        while lock.exists() {
            if start.elapsed() > LOCK_WAIT_TIMEOUT {
                return Err(SyncError::GitLocked {
                    repo: self.dir.display().to_string(),
                });
            }
            std::thread::sleep(LOCK_POLL_INTERVAL);
        }
        Ok(())
    }
}

fn command_error(what: &str, output: &Output) -> SyncError {
    let stderr = String::from_utf8_lossy(&output.stderr);
    SyncError::GitCommandFailed {
        command: what.to_string(),
        detail: stderr.to_string(),
    }
}

/// Removes stale `*.lock` files under every repo directory beneath
/// `repos_root`. Run on startup, on signal, and as a retry-once strategy
/// after a caught lock error.
pub fn clean_stale_locks(repos_root: &Path) {
    if !repos_root.exists() {
        return;
    }
    let patterns = [
        "index.lock",
        "HEAD.lock",
        "config.lock",
    ];
    for entry in walkdir::WalkDir::new(repos_root)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let matches_fixed = patterns.contains(&name);
        // refs/heads/*.lock and refs/remotes/*/*.lock: any *.lock file that
        // sits somewhere under a "refs" directory.
        let matches_ref_lock = name.ends_with(".lock")
            && path.components().any(|c| c.as_os_str() == "refs");

        if matches_fixed || matches_ref_lock {
            if let Err(e) = std::fs::remove_file(path) {
                warn!("failed to remove stale lock {}: {e}", path.display());
            } else {
                info!("removed stale git lock file: {}", path.display());
            }
        }
    }
}
