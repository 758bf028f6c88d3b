//! Narrow interfaces to the systems the healing loop drives.
//!
//! The orchestrator only sees these traits; concrete implementations
//! (shell executor, git CLI, GitHub API, LLM providers) and test fakes are
//! injected at construction.

use anyhow::Result;
use async_trait::async_trait;
use mend_core::bug::BugReport;
use mend_core::ci::CiObservation;
use mend_core::escalation::EscalationReason;
use mend_core::fix::{ContextLevel, FixAttempt};
use mend_core::gate::PushStatus;
use mend_core::provider::ProviderUsage;
use std::path::Path;
use std::time::Duration;

/// Outcome of one build. A failing build is a normal result; `error` is set
/// only when the build could not be run properly (e.g. it timed out).
#[derive(Debug, Clone, Default)]
pub struct BuildResult {
    pub exit_code: i32,
    pub full_log: String,
    pub log_excerpt: String,
    pub elapsed: Duration,
    pub error: Option<String>,
}

impl BuildResult {
    pub fn passed(&self) -> bool {
        self.exit_code == 0 && self.error.is_none()
    }
}

#[async_trait]
pub trait BuildExecutor: Send + Sync {
    async fn execute(
        &self,
        workspace: &Path,
        project_type: &str,
        working_dir: Option<&str>,
    ) -> Result<BuildResult>;
}

/// Turns a build log into bug reports. Must be deterministic: the same log
/// yields the same reports in the same order.
pub trait FailureParser: Send + Sync {
    fn name(&self) -> &str;

    fn parse(&self, log: &str, workspace: &Path) -> Result<Vec<BugReport>>;
}

/// Everything a generator needs to propose a patch for one bug.
#[derive(Debug, Clone, Copy)]
pub struct FixRequest<'a> {
    pub bug: &'a BugReport,
    pub file_content: &'a str,
    pub attempt: u32,
    pub context: ContextLevel,
}

/// A generator's answer. Rejections are ordinary values, not errors.
#[derive(Debug, Clone, PartialEq)]
pub enum FixProposal {
    Patched {
        patched_content: String,
        confidence: f64,
        provider_used: String,
    },
    Rejected {
        reason: EscalationReason,
        message: String,
        provider_used: String,
    },
}

#[async_trait]
pub trait FixGenerator: Send + Sync {
    async fn generate(&self, request: FixRequest<'_>) -> Result<FixProposal>;

    /// Provider selections made so far, for the run report.
    async fn provider_usage(&self) -> Vec<ProviderUsage> {
        Vec::new()
    }
}

#[async_trait]
pub trait GitCollaborator: Send + Sync {
    /// Write the patched file and commit it. `false` when nothing was
    /// committed (no change, or the path was refused).
    async fn apply(&self, fix: &FixAttempt, message: &str, workspace: &Path) -> Result<bool>;

    /// One push attempt of HEAD to `branch`.
    async fn push(&self, workspace: &Path, branch: &str) -> Result<PushStatus>;

    /// Fetch and rebase onto `origin/{branch}` after a rejected push.
    async fn sync_with_remote(&self, workspace: &Path, branch: &str) -> Result<()>;

    async fn head_sha(&self, workspace: &Path) -> Result<String>;
}

#[async_trait]
pub trait CiStatusSource: Send + Sync {
    /// Jobs for a commit (or branch), or a classified failure.
    async fn fetch(&self, repo: &str, commit_or_branch: &str) -> CiObservation;
}
