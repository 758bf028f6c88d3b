//! Git collaborator over a local clone.
//!
//! Reads go through libgit2; writes that must honor hooks, credentials and
//! remotes (commit, push, fetch, rebase) shell out to the `git` CLI.

use crate::collaborator::GitCollaborator;
use crate::subprocess::{SubprocessOutput, run_program};
use anyhow::{Context, Result};
use async_trait::async_trait;
use git2::Repository;
use mend_core::fix::FixAttempt;
use mend_core::gate::PushStatus;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

const FALLBACK_NAME: &str = "mend";
const FALLBACK_EMAIL: &str = "mend@localhost";

pub struct GitWorkspace {
    timeout: Duration,
}

impl GitWorkspace {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn git(&self, workspace: &Path, args: &[&str]) -> Result<SubprocessOutput> {
        run_program("git", args, workspace, self.timeout).await
    }

    async fn git_ok(&self, workspace: &Path, args: &[&str]) -> Result<SubprocessOutput> {
        let out = self.git(workspace, args).await?;
        if !out.success() {
            anyhow::bail!("git {} failed: {}", args.join(" "), out.stderr.trim());
        }
        Ok(out)
    }

    /// Write, stage and commit one file. Returns `false` when the write
    /// leaves the index unchanged.
    async fn stage_and_commit(
        &self,
        workspace: &Path,
        file_path: &str,
        target: &Path,
        content: &str,
        message: &str,
    ) -> Result<bool> {
        tokio::fs::write(target, content)
            .await
            .with_context(|| format!("failed to write {}", target.display()))?;
        self.git_ok(workspace, &["add", "--", file_path]).await?;

        let staged = self
            .git(workspace, &["diff", "--cached", "--quiet", "--", file_path])
            .await?;
        if staged.exit_code == 0 {
            tracing::info!(file = file_path, "patch produced no change, nothing to commit");
            return Ok(false);
        }

        let name = format!("user.name={FALLBACK_NAME}");
        let email = format!("user.email={FALLBACK_EMAIL}");
        let mut args: Vec<&str> = Vec::new();
        if !has_identity(workspace) {
            tracing::debug!("no git identity configured, using fallback");
            args.extend(["-c", name.as_str(), "-c", email.as_str()]);
        }
        args.extend(["commit", "-m", message]);
        self.git_ok(workspace, &args).await?;
        tracing::info!(file = file_path, message, "committed fix");
        Ok(true)
    }

    /// Unstage `file_path` and put back the bytes it had before a failed
    /// apply. A file that did not exist before is removed.
    async fn restore(
        &self,
        workspace: &Path,
        file_path: &str,
        target: &Path,
        original: Option<&[u8]>,
    ) {
        let unstaged = self
            .git_ok(workspace, &["reset", "-q", "--", file_path])
            .await;
        if let Err(e) = unstaged {
            tracing::warn!(file = file_path, error = %e, "failed to unstage after failed apply");
        }
        let restored = match original {
            Some(bytes) => tokio::fs::write(target, bytes).await,
            None => tokio::fs::remove_file(target).await,
        };
        match restored {
            Ok(()) => tracing::info!(file = file_path, "restored file after failed apply"),
            Err(e) => {
                tracing::warn!(file = file_path, error = %e, "failed to restore after failed apply");
            }
        }
    }
}

impl Default for GitWorkspace {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

/// Resolve a repo-relative path, refusing absolute paths and `..`.
pub fn resolve_in_workspace(workspace: &Path, file_path: &str) -> Option<PathBuf> {
    let relative = Path::new(file_path);
    let escapes = relative.components().any(|c| {
        matches!(
            c,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });
    if escapes || file_path.is_empty() {
        return None;
    }
    Some(workspace.join(relative))
}

/// Current HEAD commit, via libgit2.
pub fn head_sha(workspace: &Path) -> Result<String> {
    let repo = Repository::open(workspace)
        .with_context(|| format!("failed to open git repo at {}", workspace.display()))?;
    let head = repo.head()?;
    let oid = head.target().context("HEAD has no target")?;
    Ok(oid.to_string())
}

fn has_identity(workspace: &Path) -> bool {
    Repository::open(workspace)
        .and_then(|repo| repo.signature().map(|_| ()))
        .is_ok()
}

fn looks_rejected(stderr: &str) -> bool {
    ["rejected", "non-fast-forward", "fetch first", "failed to push"]
        .iter()
        .any(|needle| stderr.contains(needle))
}

#[async_trait]
impl GitCollaborator for GitWorkspace {
    async fn apply(&self, fix: &FixAttempt, message: &str, workspace: &Path) -> Result<bool> {
        let file_path = fix.bug_report.file_path();
        let Some(target) = resolve_in_workspace(workspace, file_path) else {
            tracing::warn!(file = file_path, "refusing to write outside the workspace");
            return Ok(false);
        };

        let original = match tokio::fs::read(&target).await {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", target.display()));
            }
        };

        let result = self
            .stage_and_commit(workspace, file_path, &target, &fix.patched_content, message)
            .await;
        if result.is_err() {
            self.restore(workspace, file_path, &target, original.as_deref())
                .await;
        }
        result
    }

    async fn push(&self, workspace: &Path, branch: &str) -> Result<PushStatus> {
        let refspec = format!("HEAD:refs/heads/{branch}");
        let out = self.git(workspace, &["push", "origin", &refspec]).await?;
        if out.success() {
            tracing::info!(branch, "pushed");
            return Ok(PushStatus::Success);
        }
        tracing::warn!(branch, stderr = %out.stderr.trim(), "push failed");
        if looks_rejected(&out.stderr) {
            Ok(PushStatus::Rejected)
        } else {
            Ok(PushStatus::Error)
        }
    }

    async fn sync_with_remote(&self, workspace: &Path, branch: &str) -> Result<()> {
        self.git_ok(workspace, &["fetch", "origin", branch]).await?;
        let upstream = format!("origin/{branch}");
        let rebase = self.git(workspace, &["rebase", &upstream]).await?;
        if !rebase.success() {
            match self.git(workspace, &["rebase", "--abort"]).await {
                Ok(abort) if !abort.success() => {
                    tracing::warn!(stderr = %abort.stderr.trim(), "rebase --abort failed");
                }
                Err(e) => tracing::warn!(error = %e, "rebase --abort failed"),
                Ok(_) => {}
            }
            anyhow::bail!("rebase onto {upstream} failed: {}", rebase.stderr.trim());
        }
        Ok(())
    }

    async fn head_sha(&self, workspace: &Path) -> Result<String> {
        head_sha(workspace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mend_core::bug::{BugReport, BugType};
    use std::process::Command;

    fn git(dir: &Path, args: &[&str]) {
        let status = Command::new("git")
            .args(args)
            .current_dir(dir)
            .status()
            .unwrap();
        assert!(status.success(), "git {args:?} failed");
    }

    fn init_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        git(dir.path(), &["init", "-q", "-b", "work"]);
        git(dir.path(), &["config", "user.name", "Test"]);
        git(dir.path(), &["config", "user.email", "test@example.com"]);
        std::fs::write(dir.path().join("main.py"), "def main()\n    return 1\n").unwrap();
        git(dir.path(), &["add", "."]);
        git(dir.path(), &["commit", "-q", "-m", "initial"]);
        dir
    }

    fn fix(path: &str, content: &str) -> FixAttempt {
        let bug = BugReport::new(BugType::Syntax, "missing_colon", path, 1).unwrap();
        let mut f = FixAttempt::new(bug, 1);
        f.patched_content = content.into();
        f
    }

    #[test]
    fn resolve_refuses_escapes() {
        let ws = Path::new("/work");
        assert_eq!(
            resolve_in_workspace(ws, "src/a.py"),
            Some(PathBuf::from("/work/src/a.py"))
        );
        assert_eq!(resolve_in_workspace(ws, "../etc/passwd"), None);
        assert_eq!(resolve_in_workspace(ws, "/etc/passwd"), None);
        assert_eq!(resolve_in_workspace(ws, ""), None);
    }

    #[tokio::test]
    async fn apply_commits_change() {
        let repo = init_repo();
        let before = head_sha(repo.path()).unwrap();
        let git = GitWorkspace::default();
        let applied = git
            .apply(
                &fix("main.py", "def main():\n    return 1\n"),
                "[AI-AGENT] Fix: SYNTAX/missing_colon in main.py",
                repo.path(),
            )
            .await
            .unwrap();
        assert!(applied);
        let after = git.head_sha(repo.path()).await.unwrap();
        assert_ne!(before, after);
        assert_eq!(after.len(), 40);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_commit_restores_file() {
        use std::os::unix::fs::PermissionsExt;

        let repo = init_repo();
        let hook = repo.path().join(".git/hooks/pre-commit");
        std::fs::write(&hook, "#!/bin/sh\nexit 1\n").unwrap();
        std::fs::set_permissions(&hook, std::fs::Permissions::from_mode(0o755)).unwrap();
        let before = head_sha(repo.path()).unwrap();

        let result = GitWorkspace::default()
            .apply(&fix("main.py", "def main():\n    return 1\n"), "msg", repo.path())
            .await;
        assert!(result.is_err());

        let content = std::fs::read_to_string(repo.path().join("main.py")).unwrap();
        assert_eq!(content, "def main()\n    return 1\n");
        let status = Command::new("git")
            .args(["status", "--porcelain"])
            .current_dir(repo.path())
            .output()
            .unwrap();
        assert!(status.stdout.is_empty(), "{}", String::from_utf8_lossy(&status.stdout));
        assert_eq!(head_sha(repo.path()).unwrap(), before);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_commit_removes_new_file() {
        use std::os::unix::fs::PermissionsExt;

        let repo = init_repo();
        let hook = repo.path().join(".git/hooks/pre-commit");
        std::fs::write(&hook, "#!/bin/sh\nexit 1\n").unwrap();
        std::fs::set_permissions(&hook, std::fs::Permissions::from_mode(0o755)).unwrap();

        let result = GitWorkspace::default()
            .apply(&fix("new.py", "x = 1\n"), "msg", repo.path())
            .await;
        assert!(result.is_err());
        assert!(!repo.path().join("new.py").exists());
    }

    #[tokio::test]
    async fn apply_without_change_skips_commit() {
        let repo = init_repo();
        let before = head_sha(repo.path()).unwrap();
        let applied = GitWorkspace::default()
            .apply(&fix("main.py", "def main()\n    return 1\n"), "msg", repo.path())
            .await
            .unwrap();
        assert!(!applied);
        assert_eq!(head_sha(repo.path()).unwrap(), before);
    }

    #[tokio::test]
    async fn apply_refuses_outside_paths() {
        let repo = init_repo();
        let applied = GitWorkspace::default()
            .apply(&fix("../escape.py", "x = 1\n"), "msg", repo.path())
            .await
            .unwrap();
        assert!(!applied);
    }

    #[tokio::test]
    async fn push_and_sync_against_local_remote() {
        let remote = tempfile::tempdir().unwrap();
        git(remote.path(), &["init", "-q", "--bare"]);
        let repo = init_repo();
        let remote_path = remote.path().to_str().unwrap();
        git(repo.path(), &["remote", "add", "origin", remote_path]);

        let git = GitWorkspace::default();
        let status = git.push(repo.path(), "TEAM_LEAD_AI_Fix").await.unwrap();
        assert_eq!(status, PushStatus::Success);
        git.sync_with_remote(repo.path(), "TEAM_LEAD_AI_Fix")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn conflicting_sync_aborts_rebase() {
        let remote = tempfile::tempdir().unwrap();
        git(remote.path(), &["init", "-q", "--bare"]);
        let repo = init_repo();
        let remote_path = remote.path().to_str().unwrap();
        git(repo.path(), &["remote", "add", "origin", remote_path]);
        git(repo.path(), &["push", "-q", "origin", "HEAD:refs/heads/FIX_AI_Fix"]);

        let other = tempfile::tempdir().unwrap();
        let other_path = other.path().to_str().unwrap();
        git(
            repo.path(),
            &["clone", "-q", "-b", "FIX_AI_Fix", remote_path, other_path],
        );
        git(other.path(), &["config", "user.name", "Other"]);
        git(other.path(), &["config", "user.email", "other@example.com"]);
        std::fs::write(other.path().join("main.py"), "def main():\n    return 2\n").unwrap();
        git(other.path(), &["commit", "-q", "-am", "theirs"]);
        git(other.path(), &["push", "-q", "origin", "FIX_AI_Fix"]);

        std::fs::write(repo.path().join("main.py"), "def main():\n    return 3\n").unwrap();
        git(repo.path(), &["commit", "-q", "-am", "ours"]);
        let before = head_sha(repo.path()).unwrap();

        let err = GitWorkspace::default()
            .sync_with_remote(repo.path(), "FIX_AI_Fix")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("rebase onto origin/FIX_AI_Fix failed"));
        assert!(!repo.path().join(".git/rebase-merge").exists());
        assert!(!repo.path().join(".git/rebase-apply").exists());
        assert_eq!(head_sha(repo.path()).unwrap(), before);
    }

    #[test]
    fn rejection_detection() {
        assert!(looks_rejected(" ! [rejected] HEAD -> x (fetch first)"));
        assert!(!looks_rejected("fatal: could not read from remote repository"));
    }
}
