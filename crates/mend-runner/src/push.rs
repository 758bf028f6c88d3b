//! Push with a single rebase-and-retry.

use crate::collaborator::GitCollaborator;
use mend_core::gate::{CommitPolicy, PushStatus};
use std::path::Path;

/// Push HEAD to `branch`.
///
/// Protected or badly named branches are refused before any git call. A
/// rejected or failed push is followed by one fetch + rebase and one more
/// push; a second failure is `ConflictUnresolved`.
pub async fn push_with_retry(
    git: &dyn GitCollaborator,
    policy: &CommitPolicy,
    workspace: &Path,
    branch: &str,
) -> PushStatus {
    if let Err(refused) = policy.validate_branch(branch) {
        tracing::warn!(branch, status = %refused, "push refused");
        return refused;
    }

    match git.push(workspace, branch).await {
        Ok(PushStatus::Success) => return PushStatus::Success,
        Ok(status @ (PushStatus::RejectedMain | PushStatus::InvalidBranchName)) => return status,
        Ok(status) => tracing::info!(branch, status = %status, "push failed, syncing with remote"),
        Err(e) => tracing::warn!(branch, error = %e, "push errored, syncing with remote"),
    }

    if let Err(e) = git.sync_with_remote(workspace, branch).await {
        tracing::warn!(branch, error = %e, "rebase onto remote failed");
        return PushStatus::ConflictUnresolved;
    }

    match git.push(workspace, branch).await {
        Ok(PushStatus::Success) => PushStatus::Success,
        Ok(status) => {
            tracing::warn!(branch, status = %status, "push failed after rebase");
            PushStatus::ConflictUnresolved
        }
        Err(e) => {
            tracing::warn!(branch, error = %e, "push errored after rebase");
            PushStatus::ConflictUnresolved
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use mend_core::fix::FixAttempt;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingGit {
        pushes: Mutex<Vec<PushStatus>>,
        sync_fails: bool,
        calls: Mutex<Vec<&'static str>>,
    }

    impl RecordingGit {
        fn with_pushes(pushes: Vec<PushStatus>) -> Self {
            Self {
                pushes: Mutex::new(pushes),
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl GitCollaborator for RecordingGit {
        async fn apply(&self, _fix: &FixAttempt, _message: &str, _ws: &Path) -> Result<bool> {
            self.calls.lock().unwrap().push("apply");
            Ok(true)
        }

        async fn push(&self, _ws: &Path, _branch: &str) -> Result<PushStatus> {
            self.calls.lock().unwrap().push("push");
            let mut pushes = self.pushes.lock().unwrap();
            if pushes.is_empty() {
                anyhow::bail!("network unreachable");
            }
            Ok(pushes.remove(0))
        }

        async fn sync_with_remote(&self, _ws: &Path, _branch: &str) -> Result<()> {
            self.calls.lock().unwrap().push("sync");
            if self.sync_fails {
                anyhow::bail!("conflict in main.py");
            }
            Ok(())
        }

        async fn head_sha(&self, _ws: &Path) -> Result<String> {
            Ok("0".repeat(40))
        }
    }

    const BRANCH: &str = "ACME_ADA_AI_Fix";

    #[tokio::test]
    async fn protected_branch_makes_no_calls() {
        let git = RecordingGit::default();
        let policy = CommitPolicy::default();
        for branch in ["main", "MASTER"] {
            let status = push_with_retry(&git, &policy, Path::new("."), branch).await;
            assert_eq!(status, PushStatus::RejectedMain);
        }
        let status = push_with_retry(&git, &policy, Path::new("."), "feature/x").await;
        assert_eq!(status, PushStatus::InvalidBranchName);
        assert!(git.calls().is_empty());
    }

    #[tokio::test]
    async fn first_push_succeeds() {
        let git = RecordingGit::with_pushes(vec![PushStatus::Success]);
        let status = push_with_retry(&git, &CommitPolicy::default(), Path::new("."), BRANCH).await;
        assert_eq!(status, PushStatus::Success);
        assert_eq!(git.calls(), vec!["push"]);
    }

    #[tokio::test]
    async fn rejected_push_rebases_once() {
        let git = RecordingGit::with_pushes(vec![PushStatus::Rejected, PushStatus::Success]);
        let status = push_with_retry(&git, &CommitPolicy::default(), Path::new("."), BRANCH).await;
        assert_eq!(status, PushStatus::Success);
        assert_eq!(git.calls(), vec!["push", "sync", "push"]);
    }

    #[tokio::test]
    async fn second_failure_is_terminal() {
        let git = RecordingGit::with_pushes(vec![PushStatus::Rejected, PushStatus::Rejected]);
        let status = push_with_retry(&git, &CommitPolicy::default(), Path::new("."), BRANCH).await;
        assert_eq!(status, PushStatus::ConflictUnresolved);
        assert_eq!(git.calls(), vec!["push", "sync", "push"]);
    }

    #[tokio::test]
    async fn failed_rebase_is_terminal() {
        let git = RecordingGit {
            sync_fails: true,
            ..RecordingGit::with_pushes(vec![PushStatus::Error])
        };
        let status = push_with_retry(&git, &CommitPolicy::default(), Path::new("."), BRANCH).await;
        assert_eq!(status, PushStatus::ConflictUnresolved);
        assert_eq!(git.calls(), vec!["push", "sync"]);
    }

    #[tokio::test]
    async fn push_error_is_retried() {
        let git = RecordingGit::with_pushes(vec![]);
        let status = push_with_retry(&git, &CommitPolicy::default(), Path::new("."), BRANCH).await;
        assert_eq!(status, PushStatus::ConflictUnresolved);
        assert_eq!(git.calls(), vec!["push", "sync", "push"]);
    }
}
